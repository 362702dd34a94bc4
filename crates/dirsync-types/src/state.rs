//! Per-replica high-water-mark state.

use crate::csn::Csn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The highest CSN seen from each replica in the topology.
///
/// Updates are monotonic: recording a CSN older than or equal to the one
/// already held for its replica is a no-op. The serialized form is what the
/// state-flush task persists and what startup reloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    max_csns: HashMap<i32, Csn>,
}

impl ServerState {
    /// An empty state (no replica seen yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` for its originating replica. Returns `true` if the
    /// state advanced, `false` when the CSN was older or equal.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.max_csns.get(&csn.server_id()) {
            Some(current) if csn.is_older_or_equal(current) => false,
            _ => {
                self.max_csns.insert(csn.server_id(), csn);
                true
            }
        }
    }

    /// The highest CSN seen from `server_id`, if any.
    pub fn max_csn(&self, server_id: i32) -> Option<Csn> {
        self.max_csns.get(&server_id).copied()
    }

    /// Returns true if `csn` is already covered by this state, i.e. a
    /// change with that CSN has been seen (committed) locally.
    pub fn cover(&self, csn: &Csn) -> bool {
        self.max_csn(csn.server_id())
            .map(|max| csn.is_older_or_equal(&max))
            .unwrap_or(false)
    }

    /// Number of replicas tracked.
    pub fn len(&self) -> usize {
        self.max_csns.len()
    }

    /// Whether no replica has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.max_csns.is_empty()
    }

    /// Iterates over `(server_id, max_csn)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (i32, Csn)> + '_ {
        self.max_csns.iter().map(|(id, csn)| (*id, *csn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_advances() {
        let mut state = ServerState::new();
        assert!(state.update(Csn::new(10, 0, 1)));
        assert_eq!(state.max_csn(1), Some(Csn::new(10, 0, 1)));
    }

    #[test]
    fn test_update_is_monotonic() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 0, 1));
        assert!(!state.update(Csn::new(9, 5, 1)));
        assert!(!state.update(Csn::new(10, 0, 1)));
        assert_eq!(state.max_csn(1), Some(Csn::new(10, 0, 1)));
        assert!(state.update(Csn::new(10, 1, 1)));
    }

    #[test]
    fn test_replicas_are_independent() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 0, 1));
        state.update(Csn::new(5, 0, 2));
        assert_eq!(state.max_csn(1), Some(Csn::new(10, 0, 1)));
        assert_eq!(state.max_csn(2), Some(Csn::new(5, 0, 2)));
        assert_eq!(state.max_csn(3), None);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_cover() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 3, 1));
        assert!(state.cover(&Csn::new(10, 3, 1)));
        assert!(state.cover(&Csn::new(9, 0, 1)));
        assert!(!state.cover(&Csn::new(10, 4, 1)));
        assert!(!state.cover(&Csn::new(1, 0, 2)));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 0, 1));
        state.update(Csn::new(20, 2, 2));
        let bytes = bincode::serialize(&state).unwrap();
        let back: ServerState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_json_form_for_monitoring() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 0, 1));
        let json = serde_json::to_string(&state).unwrap();
        let back: ServerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
