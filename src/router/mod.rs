//! Routing decisions
//!
//! [`plan_route`] maps the statement classification, the session's
//! transaction state and the server snapshot to a [`RoutingPlan`]. Given the
//! same inputs it always returns the same plan.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{CausalReads, ServiceConfig, UseSqlVariablesIn};
use crate::monitor::ServerSnapshot;
use crate::parser::{types::*, RouteInfo, RoutingHint};
use crate::protocol::Command;

/// Where a statement should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Primary,
    Replica,
    /// Session command executed on every backend in use
    All,
}

/// Routing decision for one statement
#[derive(Debug, Clone)]
pub struct RoutingPlan {
    pub target: RouteTarget,
    /// Concrete server, resolved when the target kind allows it
    pub server: Option<String>,
    /// A GTID wait must precede the statement on the replica
    pub causal_read: bool,
    /// A GTID probe on the primary must run before this read
    pub gtid_probe: bool,
}

/// Session-side inputs to the routing decision
#[derive(Debug)]
pub struct PlanCtx<'a> {
    pub info: &'a RouteInfo,
    pub trx_open: bool,
    pub trx_read_only: bool,
    /// Server carrying the open transaction, once bound
    pub trx_target: Option<&'a str>,
    /// Transaction is speculatively running on a replica
    pub optimistic: bool,
    pub locked_to_primary: bool,
    pub last_used: Option<&'a str>,
    /// No causal read is in flight
    pub causal_idle: bool,
    /// Per-server statement counts of this session, for tie-breaking
    pub server_stmts: &'a HashMap<String, u64>,
}

/// Compute the routing plan for one statement
pub fn plan_route(
    ctx: &PlanCtx<'_>,
    servers: &[ServerSnapshot],
    config: &ServiceConfig,
) -> RoutingPlan {
    let info = ctx.info;

    // Hints are ignored inside a transaction when replay or causal reads is
    // on: spreading the transaction across servers would break both.
    let hints_allowed = !(ctx.trx_open
        && (config.transaction_replay || config.causal_reads != CausalReads::None));

    if hints_allowed {
        if let Some(plan) = resolve_hint(ctx, servers) {
            return plan;
        }
    }

    // Session commands replicate to every backend unless variables are
    // scoped to the primary only.
    if info.is_session_command() && !info.is_write() {
        let target = match config.use_sql_variables_in {
            UseSqlVariablesIn::All => RouteTarget::All,
            UseSqlVariablesIn::Primary => RouteTarget::Primary,
        };
        let server = (target == RouteTarget::Primary)
            .then(|| pick_primary(servers))
            .flatten();
        return RoutingPlan {
            target,
            server,
            causal_read: false,
            gtid_probe: false,
        };
    }

    let wants_primary = ctx.locked_to_primary
        || info.is_write()
        || info.type_mask & (TYPE_MASTER_READ | TYPE_USERVAR_WRITE) != 0
        || (config.use_sql_variables_in == UseSqlVariablesIn::Primary
            && info.type_mask & (TYPE_USERVAR_READ | TYPE_SYSVAR_READ) != 0);

    if ctx.trx_open {
        return plan_in_trx(ctx, servers, config, wants_primary);
    }

    if wants_primary || !info.is_read() {
        return RoutingPlan {
            target: RouteTarget::Primary,
            server: pick_primary(servers),
            causal_read: false,
            gtid_probe: false,
        };
    }

    plan_read(ctx, servers, config)
}

fn plan_in_trx(
    ctx: &PlanCtx<'_>,
    servers: &[ServerSnapshot],
    config: &ServiceConfig,
    wants_primary: bool,
) -> RoutingPlan {
    // Read-only and optimistic transactions stick to the server they were
    // bound to; everything else sticks to the primary.
    if (ctx.trx_read_only || ctx.optimistic) && !wants_primary {
        let server = ctx
            .trx_target
            .map(|s| s.to_string())
            .or_else(|| pick_replica(ctx, servers, config))
            .or_else(|| pick_primary(servers));
        return RoutingPlan {
            target: RouteTarget::Replica,
            server,
            causal_read: false,
            gtid_probe: false,
        };
    }

    RoutingPlan {
        target: RouteTarget::Primary,
        server: pick_primary(servers),
        causal_read: false,
        gtid_probe: false,
    }
}

fn plan_read(
    ctx: &PlanCtx<'_>,
    servers: &[ServerSnapshot],
    config: &ServiceConfig,
) -> RoutingPlan {
    let server = pick_replica(ctx, servers, config);

    if server.is_none() {
        // No eligible replica; the primary serves the read
        return RoutingPlan {
            target: RouteTarget::Primary,
            server: pick_primary(servers),
            causal_read: false,
            gtid_probe: false,
        };
    }

    let cmd = ctx.info.command;
    let synchronisable = matches!(cmd, Some(Command::Query) | Some(Command::StmtExecute))
        && !ctx.info.ends_trx();

    let causal_read = config.causal_reads != CausalReads::None && synchronisable;
    let gtid_probe = config.causal_reads == CausalReads::Universal
        && ctx.causal_idle
        && synchronisable;

    RoutingPlan {
        target: RouteTarget::Replica,
        server,
        causal_read,
        gtid_probe,
    }
}

fn resolve_hint(ctx: &PlanCtx<'_>, servers: &[ServerSnapshot]) -> Option<RoutingPlan> {
    let plan = |target: RouteTarget, server: Option<String>| RoutingPlan {
        target,
        server,
        causal_read: false,
        gtid_probe: false,
    };

    match ctx.info.hint.as_ref()? {
        RoutingHint::ToPrimary => Some(plan(RouteTarget::Primary, pick_primary(servers))),
        RoutingHint::ToReplica => {
            let server = best_replica(ctx, servers, &|s| s.is_replica());
            server.map(|s| plan(RouteTarget::Replica, Some(s)))
        }
        RoutingHint::ToNamed(name) => {
            let snapshot = servers.iter().find(|s| &s.name == name);
            match snapshot {
                Some(s) if s.is_usable() => {
                    let target = if s.is_primary() {
                        RouteTarget::Primary
                    } else {
                        RouteTarget::Replica
                    };
                    Some(plan(target, Some(s.name.clone())))
                }
                _ => {
                    debug!(server = %name, "Hinted server not usable, ignoring hint");
                    None
                }
            }
        }
        RoutingHint::ToLastUsed => {
            let name = ctx.last_used?;
            let snapshot = servers.iter().find(|s| s.name == name)?;
            if snapshot.is_usable() {
                let target = if snapshot.is_primary() {
                    RouteTarget::Primary
                } else {
                    RouteTarget::Replica
                };
                Some(plan(target, Some(snapshot.name.clone())))
            } else {
                None
            }
        }
    }
}

/// Name of the current primary, if usable
pub fn pick_primary(servers: &[ServerSnapshot]) -> Option<String> {
    servers
        .iter()
        .find(|s| s.is_primary())
        .map(|s| s.name.clone())
}

/// Best eligible replica for a read
fn pick_replica(
    ctx: &PlanCtx<'_>,
    servers: &[ServerSnapshot],
    config: &ServiceConfig,
) -> Option<String> {
    best_replica(ctx, servers, &|s| {
        s.is_replica()
            && (config.max_replication_lag_s == 0
                || s.lag_s.map_or(true, |lag| lag <= config.max_replication_lag_s))
    })
}

/// Deterministic tie-break: highest rank, then fewest statements routed by
/// this session, then name order (snapshots are name-ordered).
fn best_replica(
    ctx: &PlanCtx<'_>,
    servers: &[ServerSnapshot],
    eligible: &dyn Fn(&ServerSnapshot) -> bool,
) -> Option<String> {
    servers
        .iter()
        .filter(|s| eligible(s))
        .min_by_key(|s| {
            let stmts = ctx.server_stmts.get(&s.name).copied().unwrap_or(0);
            (std::cmp::Reverse(s.rank), stmts)
        })
        .map(|s| s.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ServerRole;
    use crate::parser::Classifier;
    use crate::protocol::Packet;

    fn snapshot(name: &str, role: ServerRole, rank: i64) -> ServerSnapshot {
        ServerSnapshot {
            name: name.to_string(),
            addr: format!("{}:3306", name),
            role,
            rank,
            lag_s: None,
            maintenance: false,
            gtid_pos: None,
        }
    }

    fn cluster() -> Vec<ServerSnapshot> {
        vec![
            snapshot("db1", ServerRole::Primary, 0),
            snapshot("db2", ServerRole::Replica, 1),
            snapshot("db3", ServerRole::Replica, 0),
        ]
    }

    fn classify(sql: &str) -> RouteInfo {
        Classifier::new().classify(&Packet::query(sql), &HashMap::new())
    }

    fn ctx<'a>(info: &'a RouteInfo, stmts: &'a HashMap<String, u64>) -> PlanCtx<'a> {
        PlanCtx {
            info,
            trx_open: false,
            trx_read_only: false,
            trx_target: None,
            optimistic: false,
            locked_to_primary: false,
            last_used: None,
            causal_idle: true,
            server_stmts: stmts,
        }
    }

    #[test]
    fn test_read_routes_to_highest_rank_replica() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SELECT 1");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Replica);
        assert_eq!(plan.server.as_deref(), Some("db2"));
    }

    #[test]
    fn test_write_routes_to_primary() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("INSERT INTO t VALUES (1)");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Primary);
        assert_eq!(plan.server.as_deref(), Some("db1"));
    }

    #[test]
    fn test_maintenance_demotes_ranked_replica() {
        let mut servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SELECT 1");

        servers[1].maintenance = true;
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.server.as_deref(), Some("db3"));

        // Maintenance lifted: the ranked replica is preferred again
        servers[1].maintenance = false;
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.server.as_deref(), Some("db2"));
    }

    #[test]
    fn test_lagging_replica_is_skipped() {
        let mut servers = cluster();
        let stmts = HashMap::new();
        servers[1].lag_s = Some(120);
        let config = ServiceConfig {
            max_replication_lag_s: 10,
            ..Default::default()
        };
        let info = classify("SELECT 1");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &config);
        assert_eq!(plan.server.as_deref(), Some("db3"));
    }

    #[test]
    fn test_no_replicas_falls_back_to_primary() {
        let servers = vec![snapshot("db1", ServerRole::Primary, 0)];
        let stmts = HashMap::new();
        let info = classify("SELECT 1");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Primary);
    }

    #[test]
    fn test_open_trx_sticks_to_primary() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SELECT 1");
        let mut c = ctx(&info, &stmts);
        c.trx_open = true;
        let plan = plan_route(&c, &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Primary);
    }

    #[test]
    fn test_read_only_trx_sticks_to_replica() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SELECT 1");
        let mut c = ctx(&info, &stmts);
        c.trx_open = true;
        c.trx_read_only = true;
        c.trx_target = Some("db3");
        let plan = plan_route(&c, &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Replica);
        assert_eq!(plan.server.as_deref(), Some("db3"));
    }

    #[test]
    fn test_locked_to_primary_overrides_reads() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SELECT 1");
        let mut c = ctx(&info, &stmts);
        c.locked_to_primary = true;
        let plan = plan_route(&c, &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Primary);
    }

    #[test]
    fn test_session_command_routes_to_all() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SET NAMES utf8mb4");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::All);
    }

    #[test]
    fn test_session_var_scope_primary() {
        let servers = cluster();
        let stmts = HashMap::new();
        let config = ServiceConfig {
            use_sql_variables_in: UseSqlVariablesIn::Primary,
            ..Default::default()
        };

        let info = classify("SET @greeting = 'hi'");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &config);
        assert_eq!(plan.target, RouteTarget::Primary);

        // Reading the variable must then go to the primary too
        let info = classify("SELECT @greeting");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &config);
        assert_eq!(plan.target, RouteTarget::Primary);
    }

    #[test]
    fn test_hint_honoured_outside_trx() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("/* hermes route to master */ SELECT 1");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.target, RouteTarget::Primary);
    }

    #[test]
    fn test_hint_ignored_in_replayable_trx() {
        let servers = cluster();
        let stmts = HashMap::new();
        let config = ServiceConfig {
            transaction_replay: true,
            ..Default::default()
        };
        let info = classify("/* hermes route to slave */ SELECT 1");
        let mut c = ctx(&info, &stmts);
        c.trx_open = true;
        let plan = plan_route(&c, &servers, &config);
        assert_eq!(plan.target, RouteTarget::Primary);
    }

    #[test]
    fn test_named_hint() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("/* hermes route to server db3 */ SELECT 1");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.server.as_deref(), Some("db3"));
    }

    #[test]
    fn test_gtid_probe_only_for_universal() {
        let servers = cluster();
        let stmts = HashMap::new();
        let info = classify("SELECT 1");

        let config = ServiceConfig {
            causal_reads: CausalReads::Universal,
            ..Default::default()
        };
        let plan = plan_route(&ctx(&info, &stmts), &servers, &config);
        assert!(plan.gtid_probe);
        assert!(plan.causal_read);

        let config = ServiceConfig {
            causal_reads: CausalReads::Local,
            ..Default::default()
        };
        let plan = plan_route(&ctx(&info, &stmts), &servers, &config);
        assert!(!plan.gtid_probe);
        assert!(plan.causal_read);

        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert!(!plan.causal_read);
    }

    #[test]
    fn test_tie_break_prefers_less_used_server() {
        let servers = vec![
            snapshot("db1", ServerRole::Primary, 0),
            snapshot("db2", ServerRole::Replica, 0),
            snapshot("db3", ServerRole::Replica, 0),
        ];
        let stmts = HashMap::from([("db2".to_string(), 5u64)]);
        let info = classify("SELECT 1");
        let plan = plan_route(&ctx(&info, &stmts), &servers, &ServiceConfig::default());
        assert_eq!(plan.server.as_deref(), Some("db3"));
    }
}
