use std::io::Error as IoError;

use thiserror::Error;
use vblock_common::serializer::ReaderError;

use crate::core::transfer_log::TlError;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] ReaderError),

    #[error("Invalid packet magic: {0:#010x}")]
    InvalidMagic(u32),

    #[error("Unknown packet command: {0:#06x}")]
    UnknownCommand(u16),

    #[error("Trailing bytes after packet payload: {0}")]
    TrailingData(usize),

    #[error("Send timed out, peer did not answer the ping")]
    SendTimeout,

    #[error("Send on the meta socket timed out")]
    MetaSendTimeout,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Handshake version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("Wire protocol mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: u32, theirs: u32 },

    #[error("Invalid handshake field: {0}")]
    InvalidHandshake(String),

    #[error("Barrier accounting error: {0}")]
    BarrierAccounting(#[from] TlError),

    #[error("Channel send error: {0}")]
    SendError(String),
}

pub type P2pResult<T> = Result<T, P2pError>;
