use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::WireProtocol;

use super::interval::BlockInterval;

pub type RequestId = u64;

// Status surfaced to the upper layer when a bio fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoStatus {
    #[error("IO error")]
    Io,
    #[error("Out of memory")]
    NoMemory,
    #[error("Operation not supported")]
    NotSupported,
}

// What the upper layer gets back: read data on a successful read,
// nothing on a successful write
pub type MasterResult = Result<Option<Bytes>, IoStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    ReadAhead,
    Write,
}

impl IoKind {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

// Upper-layer IO handed to the engine
#[derive(Debug)]
pub struct Bio {
    pub kind: IoKind,
    pub sector: u64,
    pub size: u32,
    // Payload for writes, None for reads
    pub data: Option<Bytes>,
    // Legacy hard-barrier attribute; no longer honored
    pub hard_barrier: bool,
}

// Handle back to the upper-layer IO; completing it is exactly one send
pub struct MasterBio {
    completion: oneshot::Sender<MasterResult>,
}

impl MasterBio {
    pub fn new() -> (Self, oneshot::Receiver<MasterResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { completion: tx }, rx)
    }

    pub fn complete(self, result: MasterResult) {
        // The submitter may have given up waiting; that is its business
        let _ = self.completion.send(result);
    }
}

impl std::fmt::Debug for MasterBio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterBio")
    }
}

// Fate of the local disk submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFate {
    // No local part, or not submitted yet
    Idle,
    // Owned by the backing device until its endio fires
    Pending { aborted: bool },
    Completed { ok: bool },
}

impl LocalFate {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    // A pending, not-aborted submission blocks master completion
    pub fn blocks_completion(self) -> bool {
        matches!(self, Self::Pending { aborted: false })
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Completed { ok: true })
    }
}

// Progress of the request on the wire. Done is monotonic: once the
// network part is settled it never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetPhase {
    Idle,
    // Sitting on exactly one sender work queue
    Queued,
    Sent,
    Done,
}

// Which acknowledgement this request expects, frozen at creation from
// the negotiated protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedAck {
    None,
    Receive,
    Write,
}

impl ExpectedAck {
    pub fn for_protocol(protocol: WireProtocol) -> Self {
        match protocol {
            WireProtocol::A => Self::None,
            WireProtocol::B => Self::Receive,
            WireProtocol::C => Self::Write,
        }
    }
}

// Network fate: the wire phase plus the evidence bits that vary
// independently of it
#[derive(Debug, Clone, Copy)]
pub struct NetState {
    pub phase: NetPhase,
    // Set when the request is bound to the wire, never cleared;
    // a request with no network part has this false
    pub mirrored: bool,
    // An ack (positive or negative) is still owed by the peer
    pub pending: bool,
    // Positive completion evidence arrived
    pub ok: bool,
    // Ack said the range may be marked in sync
    pub sis: bool,
    pub expect: ExpectedAck,
}

impl NetState {
    pub fn new() -> Self {
        Self {
            phase: NetPhase::Idle,
            mirrored: false,
            pending: false,
            ok: false,
            sis: false,
            expect: ExpectedAck::None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == NetPhase::Done
    }

    // Done is monotonic; never leave the phase once reached
    pub fn set_done(&mut self) {
        self.phase = NetPhase::Done;
    }
}

// Everything that can happen to a request during its lifetime. All
// state mutation funnels through Device::apply_event with the request
// lock held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    ToBeSent,
    ToBeSubmitted,
    QueueForNetRead,
    QueueForNetWrite,
    QueueForSendOos,
    HandedOverToNetwork,
    OosHandedToNetwork,
    SendFailed,
    SendCanceled,
    ReadRetryRemoteCanceled,
    RecvAckedByPeer,
    WriteAckedByPeer,
    WriteAckedByPeerAndSis,
    DiscardWrite,
    NegAcked,
    BarrierAcked,
    ConnectionLostWhilePending,
    CompletedOk,
    WriteCompletedWithError,
    ReadCompletedWithError,
    ReadAheadCompletedWithError,
    AbortDiskIo,
    PostponeWrite,
    DataReceived,
    Resend,
    RestartFrozenDiskIo,
    FailFrozenDiskIo,
}

// One record per in-flight upper-layer IO
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub interval: BlockInterval,
    pub kind: IoKind,
    // Transfer-log epoch joined at submission
    pub epoch_nr: u32,
    pub local: LocalFate,
    pub net: NetState,
    // Held back for a retry through the router
    pub postponed: bool,
    // Holds an activity-log reference that must be dropped on destroy
    pub in_act_log: bool,
    // Non-null exactly while the upper layer awaits completion
    pub master: Option<MasterBio>,
    // Write payload; also the resend source
    pub payload: Option<Bytes>,
    // Answer to a remote read
    pub read_data: Option<Bytes>,
    // A clone aimed at the local backing device exists
    pub has_private_bio: bool,
    // Local completion error preserved for the both-sides-failed case
    pub local_error: Option<IoStatus>,
    // The barrier covering this write has been acked; the transfer log
    // entry needs no tombstone anymore
    pub barrier_acked: bool,
    pub submit_time: Instant,
    pub in_write_tree: bool,
    pub in_read_tree: bool,
    pub in_tl: bool,
}

impl Request {
    pub fn new(id: RequestId, bio_kind: IoKind, interval: BlockInterval, master: MasterBio) -> Self {
        Self {
            id,
            interval,
            kind: bio_kind,
            epoch_nr: 0,
            local: LocalFate::Idle,
            net: NetState::new(),
            postponed: false,
            in_act_log: false,
            master: Some(master),
            payload: None,
            read_data: None,
            has_private_bio: false,
            local_error: None,
            barrier_acked: false,
            submit_time: Instant::now(),
            in_write_tree: false,
            in_read_tree: false,
            in_tl: false,
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    // The single destruction predicate: the request memory may be
    // reclaimed only when nobody can still reference it
    pub fn may_destroy(&self) -> bool {
        self.master.is_none()
            && !self.local.is_pending()
            && (!self.net.mirrored || self.net.is_done())
    }

    // A mirrored write participates in barrier set-size accounting
    pub fn counts_for_barrier(&self) -> bool {
        self.is_write() && self.net.mirrored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_request() -> Request {
        let (master, _rx) = MasterBio::new();
        Request::new(1, IoKind::Write, BlockInterval::new(0, 4096), master)
    }

    #[test]
    fn test_fresh_request_not_destructible() {
        let req = dummy_request();
        assert!(!req.may_destroy());
    }

    #[test]
    fn test_local_only_destructible_after_completion() {
        let mut req = dummy_request();
        req.local = LocalFate::Completed { ok: true };
        req.master = None;
        assert!(req.may_destroy());
    }

    #[test]
    fn test_mirrored_needs_net_done() {
        let mut req = dummy_request();
        req.master = None;
        req.local = LocalFate::Completed { ok: true };
        req.net.mirrored = true;
        req.net.pending = true;
        assert!(!req.may_destroy());
        req.net.pending = false;
        req.net.set_done();
        assert!(req.may_destroy());
    }

    #[test]
    fn test_expected_ack_per_protocol() {
        assert_eq!(
            ExpectedAck::for_protocol(WireProtocol::A),
            ExpectedAck::None
        );
        assert_eq!(
            ExpectedAck::for_protocol(WireProtocol::B),
            ExpectedAck::Receive
        );
        assert_eq!(
            ExpectedAck::for_protocol(WireProtocol::C),
            ExpectedAck::Write
        );
    }
}
