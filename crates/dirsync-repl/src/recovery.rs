//! Catch-up publication after a disconnection.
//!
//! When a session (re)opens and the peer's last-known CSN for this replica is
//! older than what the replica has produced, the changes in between are
//! reconstructed from the historical record and republished. The scan walks
//! bounded time windows so a long disconnection never materializes one huge
//! result set.

use crate::pending::PendingChanges;
use crate::providers::{Broker, Storage};
use dirsync_types::{Csn, ServerState, UpdateMessage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Buffer of operations reconstructed from history, keyed by CSN. Shared
/// with the engine so a scan interrupted by shutdown can resume its work on
/// the next session.
pub type RecoveryBuffer = Mutex<BTreeMap<Csn, UpdateMessage>>;

fn lock_buffer(buffer: &RecoveryBuffer) -> std::sync::MutexGuard<'_, BTreeMap<Csn, UpdateMessage>> {
    match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Merges a reconstructed operation into the buffer. Two Modify records with
/// the same CSN are halves of one original operation and are recombined.
fn merge(buffer: &mut BTreeMap<Csn, UpdateMessage>, msg: UpdateMessage) {
    let csn = msg.csn();
    if let UpdateMessage::Modify(incoming) = msg {
        match buffer.get_mut(&csn) {
            Some(UpdateMessage::Modify(existing)) => existing.mods.extend(incoming.mods),
            _ => {
                buffer.insert(csn, UpdateMessage::Modify(incoming));
            }
        }
    } else {
        buffer.insert(csn, msg);
    }
}

/// Republishes every change this replica produced after `start` and at or
/// before `end`, reconstructed from the historical record, in CSN order.
///
/// Only changes whose CSN is covered by the local server state are
/// published; anything newer is still in flight locally and will be
/// published by the normal path once the pending tracker releases it.
/// Returns true when the scan ran to completion.
#[allow(clippy::too_many_arguments)]
pub fn publish_missing_changes(
    storage: &dyn Storage,
    broker: &dyn Broker,
    state: &Mutex<ServerState>,
    pending: &PendingChanges,
    buffer: &RecoveryBuffer,
    start: Csn,
    end: Csn,
    window_ms: u64,
    shutdown: &AtomicBool,
) -> bool {
    let server_id = start.server_id();
    info!(%start, %end, server_id, "recovery scan starting");

    // Everything the peer already has is dropped from a previous session's
    // leftovers.
    {
        let mut buffered = lock_buffer(buffer);
        let keep = buffered.split_off(&start);
        *buffered = keep;
        buffered.remove(&start);
    }

    let mut cursor = start;
    let mut published = 0usize;
    while cursor < end {
        if shutdown.load(Ordering::Acquire) {
            warn!(%cursor, "recovery interrupted by shutdown");
            return false;
        }
        let window_top = Csn::window_end(cursor.time_ms().saturating_add(window_ms), server_id);
        let slice_top = if window_top > end { end } else { window_top };

        for record in storage.search_historical(&cursor, &slice_top) {
            if record.csn.server_id() != server_id {
                continue;
            }
            let mut buffered = lock_buffer(buffer);
            merge(&mut buffered, record.rebuild_message());
        }

        {
            let mut buffered = lock_buffer(buffer);
            let ready: Vec<Csn> = buffered
                .range(..=slice_top)
                .map(|(&csn, _)| csn)
                .collect();
            for csn in ready {
                let covered = match state.lock() {
                    Ok(state) => state.cover(&csn),
                    Err(poisoned) => poisoned.into_inner().cover(&csn),
                };
                if !covered {
                    // Still uncommitted locally; the normal path owns it.
                    continue;
                }
                if let Some(msg) = buffered.remove(&csn) {
                    debug!(%csn, kind = msg.kind(), "republishing recovered change");
                    broker.publish_recovery(&msg);
                    published += 1;
                }
            }
        }

        cursor = slice_top;
        if !pending.recovery_until(&cursor) {
            // The scan has passed everything allocated locally; the
            // publication gate just reopened.
            break;
        }
    }

    lock_buffer(buffer).clear();
    info!(published, "recovery scan complete");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::{MemoryBackend, RecordingBroker};
    use dirsync_types::{AddMsg, Dn, ResultCode};
    use std::collections::{BTreeMap as Map, BTreeSet};
    use std::str::FromStr;
    use uuid::Uuid;

    fn dn(s: &str) -> Dn {
        Dn::from_str(s).unwrap()
    }

    struct Fixture {
        storage: MemoryBackend,
        broker: RecordingBroker,
        state: Mutex<ServerState>,
        pending: PendingChanges,
        buffer: RecoveryBuffer,
        shutdown: AtomicBool,
    }

    fn fixture() -> Fixture {
        Fixture {
            storage: MemoryBackend::new(),
            broker: RecordingBroker::new(),
            state: Mutex::new(ServerState::new()),
            pending: PendingChanges::new(),
            buffer: Mutex::new(Map::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    fn seed(fx: &Fixture, csn: Csn, target: &str, parent: Option<Uuid>) -> Uuid {
        let uuid = Uuid::new_v4();
        let code = fx.storage.apply(&UpdateMessage::Add(AddMsg {
            csn,
            dn: dn(target),
            entry_uuid: uuid,
            parent_uuid: parent,
            object_classes: BTreeSet::from(["device".to_string()]),
            attrs: Map::new(),
        }));
        assert_eq!(code, ResultCode::Success);
        fx.state.lock().unwrap().update(csn);
        uuid
    }

    fn run(fx: &Fixture, start: Csn, end: Csn) -> bool {
        publish_missing_changes(
            &fx.storage,
            &fx.broker,
            &fx.state,
            &fx.pending,
            &fx.buffer,
            start,
            end,
            10_000,
            &fx.shutdown,
        )
    }

    #[test]
    fn test_publishes_exactly_the_missing_suffix() {
        let fx = fixture();
        let base = seed(&fx, Csn::new(10, 0, 1), "dc=test", None);
        seed(&fx, Csn::new(20, 0, 1), "cn=a,dc=test", Some(base));
        seed(&fx, Csn::new(30, 0, 1), "cn=b,dc=test", Some(base));
        seed(&fx, Csn::new(40, 0, 1), "cn=c,dc=test", Some(base));

        let complete = run(&fx, Csn::new(20, 0, 1), Csn::upper_bound(50));
        assert!(complete);
        let csns: Vec<Csn> = fx.broker.recovered().iter().map(|m| m.csn()).collect();
        assert_eq!(csns, vec![Csn::new(30, 0, 1), Csn::new(40, 0, 1)]);
        assert!(fx.broker.published().is_empty());
    }

    #[test]
    fn test_other_replicas_changes_are_skipped() {
        let fx = fixture();
        let base = seed(&fx, Csn::new(10, 0, 1), "dc=test", None);
        seed(&fx, Csn::new(20, 0, 2), "cn=peer,dc=test", Some(base));
        seed(&fx, Csn::new(30, 0, 1), "cn=mine,dc=test", Some(base));

        assert!(run(&fx, Csn::new(10, 0, 1), Csn::upper_bound(40)));
        let csns: Vec<Csn> = fx.broker.recovered().iter().map(|m| m.csn()).collect();
        assert_eq!(csns, vec![Csn::new(30, 0, 1)]);
    }

    #[test]
    fn test_uncovered_changes_stay_buffered() {
        let fx = fixture();
        let base = seed(&fx, Csn::new(10, 0, 1), "dc=test", None);
        let uuid = Uuid::new_v4();
        // In history but not yet in the server state (still in flight).
        let code = fx.storage.apply(&UpdateMessage::Add(AddMsg {
            csn: Csn::new(20, 0, 1),
            dn: dn("cn=a,dc=test"),
            entry_uuid: uuid,
            parent_uuid: Some(base),
            object_classes: BTreeSet::new(),
            attrs: Map::new(),
        }));
        assert_eq!(code, ResultCode::Success);

        assert!(run(&fx, Csn::new(10, 0, 1), Csn::upper_bound(30)));
        assert!(fx.broker.recovered().is_empty());
    }

    #[test]
    fn test_shutdown_between_windows_stops_the_scan() {
        let fx = fixture();
        seed(&fx, Csn::new(10, 0, 1), "dc=test", None);
        fx.shutdown.store(true, Ordering::Release);
        let complete = run(&fx, Csn::new(0, 0, 1), Csn::upper_bound(20));
        assert!(!complete);
        assert!(fx.broker.recovered().is_empty());
    }

    #[test]
    fn test_scan_stops_once_pending_tracker_reports_caught_up() {
        let fx = fixture();
        let base = seed(&fx, Csn::new(10, 0, 1), "dc=test", None);
        seed(&fx, Csn::new(20, 0, 1), "cn=a,dc=test", Some(base));
        fx.pending.set_recovering(true);

        assert!(run(&fx, Csn::new(10, 0, 1), Csn::upper_bound(100_000)));
        // The gate reopened once the scan passed the newest local CSN.
        assert_eq!(fx.broker.recovered().len(), 1);
        assert_eq!(fx.pending.drain_committed(|_| {}), 0);
    }
}
