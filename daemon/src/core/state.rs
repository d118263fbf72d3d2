use std::fmt::{Display, Formatter};

// Connection state as seen by the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    StandAlone,
    Unconnected,
    // Session declared dead by the send/watchdog machinery
    Timeout,
    // Socket error on either path
    BrokenPipe,
    Connecting,
    // Sockets are up, waiting for the parameter exchange
    WfReportParams,
    Connected,
}

impl ConnState {
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::StandAlone),
            1 => Some(Self::Unconnected),
            2 => Some(Self::Timeout),
            3 => Some(Self::BrokenPipe),
            4 => Some(Self::Connecting),
            5 => Some(Self::WfReportParams),
            6 => Some(Self::Connected),
            _ => None,
        }
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StandAlone => "StandAlone",
            Self::Unconnected => "Unconnected",
            Self::Timeout => "Timeout",
            Self::BrokenPipe => "BrokenPipe",
            Self::Connecting => "Connecting",
            Self::WfReportParams => "WFReportParams",
            Self::Connected => "Connected",
        };
        write!(f, "{}", name)
    }
}

// State of a backing device, local or as reported by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskState {
    Diskless,
    Failed,
    Inconsistent,
    Consistent,
    UpToDate,
}

impl DiskState {
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Diskless),
            1 => Some(Self::Failed),
            2 => Some(Self::Inconsistent),
            3 => Some(Self::Consistent),
            4 => Some(Self::UpToDate),
            _ => None,
        }
    }
}

impl Display for DiskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Diskless => "Diskless",
            Self::Failed => "Failed",
            Self::Inconsistent => "Inconsistent",
            Self::Consistent => "Consistent",
            Self::UpToDate => "UpToDate",
        };
        write!(f, "{}", name)
    }
}

// Replication relationship with a peer device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    Off,
    Established,
    // Local IO runs ahead of the mirror, touched ranges go out of sync
    Ahead,
    SyncSource,
    SyncTarget,
}

impl Display for ReplState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Off => "Off",
            Self::Established => "Established",
            Self::Ahead => "Ahead",
            Self::SyncSource => "SyncSource",
            Self::SyncTarget => "SyncTarget",
        };
        write!(f, "{}", name)
    }
}

// Role of this node for a given device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Secondary,
    Primary,
}

impl Role {
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Secondary),
            1 => Some(Self::Primary),
            _ => None,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Secondary => "Secondary",
            Self::Primary => "Primary",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_wire_round_trip() {
        for s in [
            ConnState::StandAlone,
            ConnState::Timeout,
            ConnState::Connected,
        ] {
            assert_eq!(ConnState::from_wire(s.to_wire()), Some(s));
        }
        assert_eq!(ConnState::from_wire(99), None);
    }

    #[test]
    fn test_disk_state_ordering() {
        assert!(DiskState::UpToDate > DiskState::Inconsistent);
        assert!(DiskState::Failed < DiskState::Consistent);
    }
}
