//! Cluster state view
//!
//! The routing logic consumes a read-only snapshot of server roles, ranks
//! and replication lag. A background probe task keeps the registry current;
//! sessions never mutate it.

mod probe;
mod registry;

pub use probe::{probe_server, ProbeError, ProbeResult};
pub use registry::{ServerRegistry, ServerSnapshot};

/// Role of an upstream server as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Replica,
    /// Not probed yet
    Unknown,
    Down,
}

impl ServerRole {
    pub fn is_usable(&self) -> bool {
        matches!(self, ServerRole::Primary | ServerRole::Replica)
    }
}

/// Mutable state of one server, owned by the registry
#[derive(Debug, Clone)]
pub struct ServerState {
    pub role: ServerRole,
    /// Administrative preference; higher wins among eligible servers
    pub rank: i64,
    /// Replication lag in seconds, if known
    pub lag_s: Option<u64>,
    /// Operator-requested drain; no new statements are routed here
    pub maintenance: bool,
    /// Last observed GTID position
    pub gtid_pos: Option<String>,
}

impl ServerState {
    pub fn new(rank: i64) -> Self {
        Self {
            role: ServerRole::Unknown,
            rank,
            lag_s: None,
            maintenance: false,
            gtid_pos: None,
        }
    }
}
