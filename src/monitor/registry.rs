use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ServerConfig};

use super::probe::probe_server;
use super::{ServerRole, ServerState};

/// Immutable view of one server handed to routing decisions
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub name: String,
    pub addr: String,
    pub role: ServerRole,
    pub rank: i64,
    pub lag_s: Option<u64>,
    pub maintenance: bool,
    pub gtid_pos: Option<String>,
}

impl ServerSnapshot {
    pub fn is_primary(&self) -> bool {
        self.role == ServerRole::Primary && !self.maintenance
    }

    pub fn is_replica(&self) -> bool {
        self.role == ServerRole::Replica && !self.maintenance
    }

    pub fn is_usable(&self) -> bool {
        self.role.is_usable() && !self.maintenance
    }
}

struct Entry {
    config: ServerConfig,
    state: ServerState,
}

/// Registry of all configured servers and their last observed state.
///
/// Sessions read snapshots; only the probe task and administrative calls
/// write.
pub struct ServerRegistry {
    entries: DashMap<String, Entry>,
}

impl ServerRegistry {
    pub fn new(servers: &[ServerConfig]) -> Self {
        let entries = DashMap::new();
        for server in servers {
            entries.insert(
                server.name.clone(),
                Entry {
                    config: server.clone(),
                    state: ServerState::new(server.rank),
                },
            );
        }
        Self { entries }
    }

    /// Snapshot of every configured server, ordered by name for determinism
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        let mut servers: Vec<ServerSnapshot> = self
            .entries
            .iter()
            .map(|e| ServerSnapshot {
                name: e.key().clone(),
                addr: e.value().config.addr(),
                role: e.value().state.role,
                rank: e.value().state.rank,
                lag_s: e.value().state.lag_s,
                maintenance: e.value().state.maintenance,
                gtid_pos: e.value().state.gtid_pos.clone(),
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub fn get(&self, name: &str) -> Option<ServerSnapshot> {
        self.entries.get(name).map(|e| ServerSnapshot {
            name: e.key().clone(),
            addr: e.value().config.addr(),
            role: e.value().state.role,
            rank: e.value().state.rank,
            lag_s: e.value().state.lag_s,
            maintenance: e.value().state.maintenance,
            gtid_pos: e.value().state.gtid_pos.clone(),
        })
    }

    /// GTID position of the current primary, used by fast causal reads
    pub fn primary_gtid(&self) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.value().state.role == ServerRole::Primary)
            .and_then(|e| e.value().state.gtid_pos.clone())
    }

    pub fn set_role(&self, name: &str, role: ServerRole) {
        if let Some(mut e) = self.entries.get_mut(name) {
            if e.value().state.role != role {
                info!(server = name, role = ?role, "Server role changed");
            }
            e.value_mut().state.role = role;
        }
    }

    pub fn set_gtid(&self, name: &str, gtid: Option<String>) {
        if let Some(mut e) = self.entries.get_mut(name) {
            e.value_mut().state.gtid_pos = gtid;
        }
    }

    pub fn set_lag(&self, name: &str, lag_s: Option<u64>) {
        if let Some(mut e) = self.entries.get_mut(name) {
            e.value_mut().state.lag_s = lag_s;
        }
    }

    pub fn set_maintenance(&self, name: &str, maintenance: bool) {
        if let Some(mut e) = self.entries.get_mut(name) {
            e.value_mut().state.maintenance = maintenance;
        }
    }

    /// Spawn the background probe loop. Roles and GTID positions are
    /// refreshed once per interval until the token is cancelled.
    pub fn start_probing(
        self: Arc<Self>,
        config: Arc<Config>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Server probing stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                for server in &config.servers {
                    match probe_server(
                        &server.addr(),
                        &config.proxy.user,
                        &config.proxy.password,
                    )
                    .await
                    {
                        Ok(result) => {
                            let role = if result.read_only {
                                ServerRole::Replica
                            } else {
                                ServerRole::Primary
                            };
                            debug!(server = %server.name, role = ?role, gtid = ?result.gtid_pos, "Probe ok");
                            self.set_role(&server.name, role);
                            self.set_gtid(&server.name, result.gtid_pos);
                            self.set_lag(&server.name, result.lag_s);
                        }
                        Err(e) => {
                            warn!(server = %server.name, error = %e, "Probe failed");
                            self.set_role(&server.name, ServerRole::Down);
                        }
                    }
                }
            }
        })
    }
}
