use clap::ValueEnum;
use serde::{Deserialize, Serialize};

// Version reported in the handshake; peers with a different value are refused
pub const PROTOCOL_VERSION: u32 = 1;

// Fixed cookie at the start of every frame on both sockets
pub const WIRE_MAGIC: u32 = 0x56424C4B; // "VBLK"

// Magic word closing the on-disk generation-counter superblock
pub const SUPERBLOCK_MAGIC: u32 = 0x56424D44; // "VBMD"

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

// Granularity of the out-of-sync bitmap
pub const BM_BLOCK_SIZE: u32 = 4096;

// The frame length field is 16 bits wide, which caps a single data
// payload. Bios above this limit are refused at submission.
pub const MAX_BIO_SIZE: u32 = 32 * 1024;

// Initial assumed round trip time on the meta socket, until the first
// ping/ping-ack sample arrives
pub const INITIAL_ARTT_MILLIS: u64 = 200;

// Lower clamp so a LAN round trip can never shrink the meta timeout to
// nothing
pub const MIN_ARTT_MILLIS: u64 = 50;

// Seconds between reconnect attempts after a broken session
pub const RECONNECT_DELAY_SECS: u64 = 3;

// Durability protocol negotiated per connection.
// A completes on hand-over to the socket, B on the peer's receipt
// acknowledgement, C on the peer's durable write acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum WireProtocol {
    A,
    B,
    C,
}

impl WireProtocol {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::A),
            2 => Some(Self::B),
            3 => Some(Self::C),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
        }
    }
}

// What to do when the mirror link is congested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum OnCongestion {
    // Keep submitters blocked on the send path
    Block,
    // Let local IO run ahead, mark the mirror out of sync
    PullAhead,
    // Tear the connection down
    Disconnect,
}

// Where reads should be served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ReadBalancing {
    PreferLocal,
    PreferRemote,
    RoundRobin,
    LeastPending,
    CongestedRemote,
    Striping32K,
    Striping64K,
    Striping128K,
    Striping256K,
    Striping512K,
    Striping1M,
}

impl ReadBalancing {
    // Stripe shift in bits for the striping variants
    pub fn stripe_shift(self) -> Option<u32> {
        match self {
            Self::Striping32K => Some(15),
            Self::Striping64K => Some(16),
            Self::Striping128K => Some(17),
            Self::Striping256K => Some(18),
            Self::Striping512K => Some(19),
            Self::Striping1M => Some(20),
            _ => None,
        }
    }
}

// What to do when the backing device reports an IO error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum OnIoError {
    // Report upwards, keep the disk attached
    PassOn,
    // Drop the backing device, serve from the peer
    Detach,
}

// Per-connection settings, agreed out of band and cross-checked by the
// handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    // Send timeout on the data socket, in tenths of a second
    pub timeout: u32,
    // How many timeout periods the oldest pending request may age
    // before the session is declared dead
    pub ko_count: u32,
    // Writes per epoch before a barrier is forced
    pub max_epoch_size: u32,
    pub wire_protocol: WireProtocol,
    pub on_congestion: OnCongestion,
    // Congestion threshold on in-flight sectors; zero disables
    pub cong_fill: u32,
    // Congestion threshold on active activity-log extents; zero disables
    pub cong_extents: u32,
    pub read_balancing: ReadBalancing,
    // Transfer log capacity in entries
    pub tl_size: usize,
    // In-flight request cap; exhaustion fails new bios
    pub max_requests: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            timeout: 60,
            ko_count: 7,
            max_epoch_size: 2048,
            wire_protocol: WireProtocol::C,
            on_congestion: OnCongestion::Block,
            cong_fill: 0,
            cong_extents: 0,
            read_balancing: ReadBalancing::PreferLocal,
            tl_size: 4096,
            max_requests: 1024,
        }
    }
}

impl NetConfig {
    // Data socket send timeout
    pub fn send_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout as u64 * 100)
    }

    // Network deadline for the request watchdog
    pub fn effective_net_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout as u64 * 100 * self.ko_count as u64)
    }
}

// Per-backing-device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    // Disk deadline for the request watchdog, in tenths of a second;
    // zero disables
    pub disk_timeout: u32,
    pub on_io_error: OnIoError,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            disk_timeout: 0,
            on_io_error: OnIoError::Detach,
        }
    }
}

impl DiskConfig {
    pub fn disk_deadline(&self) -> Option<std::time::Duration> {
        if self.disk_timeout == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(
                self.disk_timeout as u64 * 100,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_protocol_round_trip() {
        for p in [WireProtocol::A, WireProtocol::B, WireProtocol::C] {
            assert_eq!(WireProtocol::from_wire(p.to_wire()), Some(p));
        }
        assert_eq!(WireProtocol::from_wire(0), None);
    }

    #[test]
    fn test_stripe_shifts() {
        assert_eq!(ReadBalancing::Striping32K.stripe_shift(), Some(15));
        assert_eq!(ReadBalancing::Striping1M.stripe_shift(), Some(20));
        assert_eq!(ReadBalancing::PreferLocal.stripe_shift(), None);
    }

    #[test]
    fn test_effective_net_timeout() {
        let conf = NetConfig::default();
        assert_eq!(
            conf.effective_net_timeout(),
            std::time::Duration::from_secs(42)
        );
    }
}
