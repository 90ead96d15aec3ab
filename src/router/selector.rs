//! Backend selection.
//!
//! Candidates are sorted ascending by the configured criterion, ties broken
//! by server name so selection is deterministic. The criterion reads the
//! shared server statistics without locking; a stale sample only costs a
//! slightly worse pick.

use std::sync::Arc;

use serde::Deserialize;

use crate::backend::ServerInfo;

/// Criterion used to order slave candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectCriteria {
    /// Connections from anyone, across the whole service
    LeastGlobalConnections,
    /// Connections opened by this router
    LeastRouterConnections,
    /// Replication lag behind the master
    LeastBehindMaster,
    /// Queries currently executing
    LeastCurrentOperations,
}

impl SelectCriteria {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectCriteria::LeastGlobalConnections => "LEAST_GLOBAL_CONNECTIONS",
            SelectCriteria::LeastRouterConnections => "LEAST_ROUTER_CONNECTIONS",
            SelectCriteria::LeastBehindMaster => "LEAST_BEHIND_MASTER",
            SelectCriteria::LeastCurrentOperations => "LEAST_CURRENT_OPERATIONS",
        }
    }

    /// Sort key; lower is better. Unknown lag sorts last under
    /// LEAST_BEHIND_MASTER so measured servers are preferred.
    fn sort_key(&self, server: &ServerInfo) -> u64 {
        match self {
            SelectCriteria::LeastGlobalConnections => server.connections(),
            SelectCriteria::LeastRouterConnections => server.router_connections(),
            SelectCriteria::LeastBehindMaster => {
                let lag = server.replication_lag();
                if lag < 0 {
                    u64::MAX
                } else {
                    lag as u64
                }
            }
            SelectCriteria::LeastCurrentOperations => server.current_operations(),
        }
    }
}

/// Selector failure: no backend qualifies
#[derive(Debug, thiserror::Error)]
#[error("no eligible backend available")]
pub struct NoBackend;

/// True when the server may serve reads under the given lag bound
fn within_lag_bound(server: &ServerInfo, max_replication_lag: i64) -> bool {
    if max_replication_lag <= 0 {
        return true;
    }
    let lag = server.replication_lag();
    lag < 0 || lag <= max_replication_lag
}

/// Rank usable slave servers for connection, best first.
///
/// Filters by role, health and (for LEAST_BEHIND_MASTER) replication lag,
/// then sorts ascending by the criterion with the server name as tiebreak.
pub fn rank_slaves(
    servers: &[Arc<ServerInfo>],
    criteria: SelectCriteria,
    max_replication_lag: i64,
) -> Vec<Arc<ServerInfo>> {
    let mut candidates: Vec<Arc<ServerInfo>> = servers
        .iter()
        .filter(|s| s.role.is_slave() && s.is_usable())
        .filter(|s| {
            criteria != SelectCriteria::LeastBehindMaster
                || within_lag_bound(s, max_replication_lag)
        })
        .cloned()
        .collect();

    candidates.sort_by(|a, b| {
        criteria
            .sort_key(a)
            .cmp(&criteria.sort_key(b))
            .then_with(|| a.name.cmp(&b.name))
    });

    candidates
}

/// Pick the first usable master (or joined) server
pub fn find_master(servers: &[Arc<ServerInfo>]) -> Option<Arc<ServerInfo>> {
    let mut masters: Vec<&Arc<ServerInfo>> = servers
        .iter()
        .filter(|s| s.role.is_master() && s.is_usable())
        .collect();
    masters.sort_by(|a, b| a.name.cmp(&b.name));
    masters.first().map(|s| Arc::clone(s))
}

/// Choose the best candidate among indexed servers, e.g. a session's
/// connected slave handles. Returns the index of the winner.
pub fn pick_best<'a>(
    candidates: impl Iterator<Item = (usize, &'a Arc<ServerInfo>)>,
    criteria: SelectCriteria,
    max_replication_lag: i64,
) -> Result<usize, NoBackend> {
    candidates
        .filter(|(_, s)| s.is_usable())
        .filter(|(_, s)| {
            criteria != SelectCriteria::LeastBehindMaster
                || within_lag_bound(s, max_replication_lag)
        })
        .min_by(|(_, a), (_, b)| {
            criteria
                .sort_key(a)
                .cmp(&criteria.sort_key(b))
                .then_with(|| a.name.cmp(&b.name))
        })
        .map(|(idx, _)| idx)
        .ok_or(NoBackend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ServerRole;

    fn server(name: &str, role: ServerRole) -> Arc<ServerInfo> {
        Arc::new(ServerInfo::new(name, "127.0.0.1", 3306, role))
    }

    fn test_cluster() -> Vec<Arc<ServerInfo>> {
        vec![
            server("master1", ServerRole::Master),
            server("slave1", ServerRole::Slave),
            server("slave2", ServerRole::Slave),
            server("slave3", ServerRole::Slave),
        ]
    }

    #[test]
    fn test_rank_orders_by_current_operations() {
        let servers = test_cluster();
        servers[1].operation_started();
        servers[1].operation_started();
        servers[2].operation_started();

        let ranked = rank_slaves(&servers, SelectCriteria::LeastCurrentOperations, -1);
        let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["slave3", "slave2", "slave1"]);
    }

    #[test]
    fn test_rank_ties_broken_by_name() {
        let servers = test_cluster();
        let ranked = rank_slaves(&servers, SelectCriteria::LeastGlobalConnections, -1);
        let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["slave1", "slave2", "slave3"]);
    }

    #[test]
    fn test_rank_excludes_master_and_down_servers() {
        let servers = test_cluster();
        servers[2].set_up(false);

        let ranked = rank_slaves(&servers, SelectCriteria::LeastCurrentOperations, -1);
        assert!(ranked.iter().all(|s| s.role.is_slave()));
        assert!(!ranked.iter().any(|s| s.name == "slave2"));
    }

    #[test]
    fn test_lag_filter_applies_only_to_lag_criterion() {
        let servers = test_cluster();
        servers[1].set_replication_lag(5);
        servers[2].set_replication_lag(120);
        servers[3].set_replication_lag(1);

        let ranked = rank_slaves(&servers, SelectCriteria::LeastBehindMaster, 30);
        let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["slave3", "slave1"]);

        // Other criteria ignore the bound
        let ranked = rank_slaves(&servers, SelectCriteria::LeastCurrentOperations, 30);
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_unknown_lag_passes_bound_but_sorts_last() {
        let servers = test_cluster();
        servers[1].set_replication_lag(5);
        // slave2 and slave3 lag unknown (-1)

        let ranked = rank_slaves(&servers, SelectCriteria::LeastBehindMaster, 30);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].name, "slave1");
    }

    #[test]
    fn test_find_master_prefers_usable() {
        let servers = test_cluster();
        assert_eq!(find_master(&servers).unwrap().name, "master1");

        servers[0].set_up(false);
        assert!(find_master(&servers).is_none());
    }

    #[test]
    fn test_joined_server_is_master_candidate() {
        let servers = vec![server("galera1", ServerRole::Joined)];
        assert_eq!(find_master(&servers).unwrap().name, "galera1");
    }

    #[test]
    fn test_pick_best_deterministic() {
        let servers = test_cluster();
        servers[3].operation_started();

        let slaves: Vec<(usize, &Arc<ServerInfo>)> = servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role.is_slave())
            .collect();

        let winner = pick_best(
            slaves.iter().copied(),
            SelectCriteria::LeastCurrentOperations,
            -1,
        )
        .unwrap();
        assert_eq!(winner, 1); // slave1: zero ops, name tiebreak
    }

    #[test]
    fn test_pick_best_no_backend() {
        let servers = test_cluster();
        servers[1].set_up(false);

        let result = pick_best(
            servers
                .iter()
                .enumerate()
                .filter(|(_, s)| s.role.is_slave() && s.name == "slave1"),
            SelectCriteria::LeastCurrentOperations,
            -1,
        );
        assert!(result.is_err());
    }
}
