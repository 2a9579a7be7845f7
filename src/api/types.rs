/// Replication protocol: when does a mirrored write count as done.
///
/// A: when it left for the network. B: when the peer received it.
/// C: when the peer wrote it to disk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    A,
    B,
    C,
}

impl Protocol {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            Protocol::A => 1,
            Protocol::B => 2,
            Protocol::C => 3,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> Option<Protocol> {
        match raw {
            1 => Some(Protocol::A),
            2 => Some(Protocol::B),
            3 => Some(Protocol::C),
            _ => None,
        }
    }
}

/// Only a Primary accepts writes from the host; a Secondary only mirrors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Primary,
    Secondary,
}

/// Connection / replication state of the device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Unconfigured,
    StandAlone,
    Unconnected,
    WFReportParams,
    Connected,
    SyncSource,
    SyncTarget,
    /// Congestion pull-ahead: local writes proceed, the peer only learns
    /// which blocks went out of sync.
    Ahead,
    Timeout,
    BrokenPipe,
}

impl ConnState {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            ConnState::Unconfigured => 0,
            ConnState::StandAlone => 1,
            ConnState::Unconnected => 2,
            ConnState::WFReportParams => 3,
            ConnState::Connected => 4,
            ConnState::SyncSource => 5,
            ConnState::SyncTarget => 6,
            ConnState::Ahead => 7,
            ConnState::Timeout => 8,
            ConnState::BrokenPipe => 9,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> Option<ConnState> {
        Some(match raw {
            0 => ConnState::Unconfigured,
            1 => ConnState::StandAlone,
            2 => ConnState::Unconnected,
            3 => ConnState::WFReportParams,
            4 => ConnState::Connected,
            5 => ConnState::SyncSource,
            6 => ConnState::SyncTarget,
            7 => ConnState::Ahead,
            8 => ConnState::Timeout,
            9 => ConnState::BrokenPipe,
            _ => return None,
        })
    }
}

/// Consistency of a replica's backing data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiskState {
    UpToDate,
    Inconsistent,
}

/// Where to serve reads from when both replicas could.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadBalancing {
    PreferLocal,
    PreferRemote,
    /// Compare local in-flight count against the peer's pending counts.
    LeastPending,
    RoundRobin,
    /// Go remote while the backing device reports read congestion.
    CongestedRemote,
    Striping32K,
    Striping64K,
    Striping128K,
    Striping256K,
    Striping512K,
    Striping1M,
}

impl ReadBalancing {
    pub(crate) fn stripe_shift(self) -> Option<u32> {
        match self {
            ReadBalancing::Striping32K => Some(15),
            ReadBalancing::Striping64K => Some(16),
            ReadBalancing::Striping128K => Some(17),
            ReadBalancing::Striping256K => Some(18),
            ReadBalancing::Striping512K => Some(19),
            ReadBalancing::Striping1M => Some(20),
            _ => None,
        }
    }
}

/// What to do when the data channel backs up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OnCongestion {
    Block,
    PullAhead,
    Disconnect,
}

/// Point-in-time view of a device, for the administrative surface.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub cstate: ConnState,
    pub role: Role,
    pub peer_role: Option<Role>,
    pub disk_state: DiskState,
    pub peer_disk_state: Option<DiskState>,
    pub dirty_blocks: u64,
    pub ap_pending: u32,
    pub rs_pending: u32,
    pub unacked: u32,
    pub ap_in_flight_sectors: u64,
    pub send_bytes: u64,
    pub recv_bytes: u64,
    pub read_sectors: u64,
    pub written_sectors: u64,
}
