//! Configuration for a replication domain.

use dirsync_types::{Dn, Rdn};

/// Configuration of one replicated base DN. Every replicated suffix gets an
/// independent engine instance built from one of these.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Base DN of the replicated suffix.
    pub base_dn: Dn,
    /// Identifier of this replica, unique across the topology.
    pub server_id: i32,
    /// Fractional exclusion list, entries of the form `class:attr1,attr2`
    /// (`*` for the class-independent set). Mutually exclusive with
    /// `fractional_include`.
    pub fractional_exclude: Vec<String>,
    /// Fractional inclusion list, same format.
    pub fractional_include: Vec<String>,
    /// Capacity of the bounded replay queue; producers block (with a
    /// timeout) when it is full.
    pub replay_queue_capacity: usize,
    /// Maximum replay attempts for a single remote change.
    pub replay_retry_budget: u32,
    /// Delay before retrying after a transient `Unavailable` result.
    pub unavailable_retry_delay_ms: u64,
    /// Width of one recovery time slice.
    pub recovery_window_ms: u64,
    /// Maximum number of parked remote changes; oldest evicted first.
    pub parked_changes_cap: usize,
    /// Period of the server-state flush task.
    pub state_flush_period_ms: u64,
    /// Retention horizon for historical information used in conflict
    /// resolution and recovery.
    pub purge_horizon_ms: u64,
    /// Whether naming conflicts are solved automatically. Disabled for
    /// suffixes (such as schema) where conflicts cannot occur and the extra
    /// bookkeeping is unwanted.
    pub solve_conflicts: bool,
}

impl DomainConfig {
    /// A configuration with the default tuning for the given suffix and
    /// replica identifier.
    pub fn new(base_dn: Dn, server_id: i32) -> Self {
        Self {
            base_dn,
            server_id,
            fractional_exclude: Vec::new(),
            fractional_include: Vec::new(),
            replay_queue_capacity: 256,
            replay_retry_budget: 10,
            unavailable_retry_delay_ms: 50,
            recovery_window_ms: 10_000,
            parked_changes_cap: 10_000,
            state_flush_period_ms: 1_000,
            purge_horizon_ms: 24 * 60 * 60 * 1000,
            solve_conflicts: true,
        }
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        let base = Dn::root()
            .child(Rdn::new("dc", "com"))
            .child(Rdn::new("dc", "example"));
        Self::new(base, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tuning() {
        let cfg = DomainConfig::default();
        assert_eq!(cfg.replay_retry_budget, 10);
        assert_eq!(cfg.recovery_window_ms, 10_000);
        assert_eq!(cfg.parked_changes_cap, 10_000);
        assert_eq!(cfg.state_flush_period_ms, 1_000);
        assert!(cfg.solve_conflicts);
    }

    #[test]
    fn test_new_sets_identity() {
        let cfg = DomainConfig::new("dc=test".parse().unwrap(), 7);
        assert_eq!(cfg.server_id, 7);
        assert_eq!(cfg.base_dn.to_string(), "dc=test");
    }
}
