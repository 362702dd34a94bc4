//! Tracking of remote changes between receipt and replay.
//!
//! Remote changes arrive in CSN order per session but may depend on another
//! change that is still being replayed (an Add under a parent whose own Add
//! has not landed yet). Such changes are parked and released, in CSN order,
//! once the change they wait on commits. The tracker also rejects duplicate
//! deliveries after a session failover.

use dirsync_types::{Csn, Dn, UpdateMessage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{debug, warn};

struct Parked {
    msg: UpdateMessage,
    /// True while the change waits on an older pending change.
    dependent: bool,
}

struct Inner {
    changes: BTreeMap<Csn, Parked>,
    /// Parked changes whose dependencies have all committed, awaiting pickup
    /// by `next_ready`.
    ready: BTreeSet<Csn>,
    capacity: usize,
}

/// Tracker for remote in-flight changes with dependency parking.
pub struct RemotePendingChanges {
    inner: Mutex<Inner>,
}

/// Destination DN of a ModifyDn: new RDN under the new superior, or under
/// the current parent when no superior was given.
fn modify_dn_destination(msg: &dirsync_types::ModifyDnMsg) -> Option<Dn> {
    match &msg.new_superior {
        Some(superior) => Some(superior.child(msg.new_rdn.clone())),
        None => msg.dn.with_rdn(msg.new_rdn.clone()),
    }
}

/// Whether `msg` must wait for `older` (an older, still pending change) to
/// commit before it can be replayed.
fn depends_on(msg: &UpdateMessage, older: &UpdateMessage) -> bool {
    match msg {
        // An Add waits for its parent's Add and for a Delete freeing its DN
        // or its UUID.
        UpdateMessage::Add(add) => match older {
            UpdateMessage::Add(parent) => {
                Some(parent.entry_uuid) == add.parent_uuid
                    || Some(&parent.dn) == add.dn.parent().as_ref()
            }
            UpdateMessage::Delete(del) => {
                del.dn == add.dn || del.entry_uuid == add.entry_uuid
            }
            _ => false,
        },
        // A Delete waits for everything still pending below it.
        UpdateMessage::Delete(del) => match older {
            UpdateMessage::Add(add) => add.dn != del.dn && add.dn.is_under(&del.dn),
            UpdateMessage::Delete(child) => child.dn != del.dn && child.dn.is_under(&del.dn),
            _ => false,
        },
        // A Modify waits for the Add of its entry.
        UpdateMessage::Modify(modify) => match older {
            UpdateMessage::Add(add) => {
                add.entry_uuid == modify.entry_uuid || add.dn == modify.dn
            }
            _ => false,
        },
        // A ModifyDn waits for the Adds of its target and new superior, and
        // for a rename freeing its destination DN.
        UpdateMessage::ModifyDn(mdn) => match older {
            UpdateMessage::Add(add) => {
                add.entry_uuid == mdn.entry_uuid
                    || Some(add.entry_uuid) == mdn.new_superior_uuid
                    || Some(&add.dn) == mdn.new_superior.as_ref()
            }
            UpdateMessage::ModifyDn(other) => {
                modify_dn_destination(mdn).is_some_and(|dest| other.dn == dest)
            }
            _ => false,
        },
    }
}

impl RemotePendingChanges {
    /// Creates a tracker holding at most `capacity` in-flight changes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                changes: BTreeMap::new(),
                ready: BTreeSet::new(),
                capacity,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a received change. Returns false on a duplicate CSN, which
    /// the caller discards.
    pub fn put(&self, msg: &UpdateMessage) -> bool {
        let mut inner = self.lock();
        let csn = msg.csn();
        if inner.changes.contains_key(&csn) {
            debug!(%csn, kind = msg.kind(), "duplicate remote change discarded");
            return false;
        }
        if inner.changes.len() >= inner.capacity {
            // Cap reached: drop the oldest parked change to keep the stream
            // moving. That change is re-deliverable by the peer.
            if let Some((&oldest, _)) = inner.changes.iter().next() {
                warn!(%oldest, "remote pending tracker full, evicting oldest");
                inner.changes.remove(&oldest);
                inner.ready.remove(&oldest);
            }
        }
        inner.changes.insert(
            csn,
            Parked {
                msg: msg.clone(),
                dependent: false,
            },
        );
        true
    }

    /// Checks whether `msg` depends on an older pending change. When it
    /// does, the change is parked and true is returned; the caller skips the
    /// replay for now.
    pub fn check_dependencies(&self, msg: &UpdateMessage) -> bool {
        let mut inner = self.lock();
        let csn = msg.csn();
        let blocked = inner
            .changes
            .range(..csn)
            .any(|(_, parked)| depends_on(msg, &parked.msg));
        if blocked {
            if let Some(parked) = inner.changes.get_mut(&csn) {
                parked.dependent = true;
            }
            debug!(%csn, kind = msg.kind(), "remote change parked on dependency");
        }
        blocked
    }

    /// Marks a change fully replayed, dropping it and re-evaluating parked
    /// changes that may have been waiting on it.
    pub fn commit(&self, csn: &Csn) {
        let mut inner = self.lock();
        inner.changes.remove(csn);
        inner.ready.remove(csn);

        let parked: Vec<Csn> = inner
            .changes
            .iter()
            .filter(|(_, p)| p.dependent)
            .map(|(&c, _)| c)
            .collect();
        for candidate in parked {
            let still_blocked = {
                let msg = &inner.changes[&candidate].msg;
                inner
                    .changes
                    .range(..candidate)
                    .any(|(_, older)| depends_on(msg, &older.msg))
            };
            if !still_blocked {
                if let Some(p) = inner.changes.get_mut(&candidate) {
                    p.dependent = false;
                }
                inner.ready.insert(candidate);
            }
        }
    }

    /// The oldest parked change whose dependencies have all committed, if
    /// any. The change stays tracked until its own `commit`.
    pub fn next_ready(&self) -> Option<UpdateMessage> {
        let mut inner = self.lock();
        let csn = inner.ready.iter().next().copied()?;
        inner.ready.remove(&csn);
        inner.changes.get(&csn).map(|p| p.msg.clone())
    }

    /// Number of tracked in-flight changes.
    pub fn len(&self) -> usize {
        self.lock().changes.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_types::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg, Rdn};
    use std::collections::{BTreeMap as Map, BTreeSet as Set};
    use std::str::FromStr;
    use uuid::Uuid;

    fn dn(s: &str) -> Dn {
        Dn::from_str(s).unwrap()
    }

    fn add(csn: Csn, target: &str, uuid: Uuid, parent: Option<Uuid>) -> UpdateMessage {
        UpdateMessage::Add(AddMsg {
            csn,
            dn: dn(target),
            entry_uuid: uuid,
            parent_uuid: parent,
            object_classes: Set::from(["device".to_string()]),
            attrs: Map::new(),
        })
    }

    fn delete(csn: Csn, target: &str, uuid: Uuid) -> UpdateMessage {
        UpdateMessage::Delete(DeleteMsg {
            csn,
            dn: dn(target),
            entry_uuid: uuid,
        })
    }

    fn modify(csn: Csn, target: &str, uuid: Uuid) -> UpdateMessage {
        UpdateMessage::Modify(ModifyMsg {
            csn,
            dn: dn(target),
            entry_uuid: uuid,
            mods: Vec::new(),
        })
    }

    fn csn(t: u64) -> Csn {
        Csn::new(t, 0, 2)
    }

    #[test]
    fn test_duplicate_rejected() {
        let tracker = RemotePendingChanges::new(100);
        let msg = add(csn(1), "cn=x,dc=test", Uuid::new_v4(), None);
        assert!(tracker.put(&msg));
        assert!(!tracker.put(&msg));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_add_waits_for_parent_add() {
        let tracker = RemotePendingChanges::new(100);
        let parent_uuid = Uuid::new_v4();
        let parent = add(csn(1), "ou=people,dc=test", parent_uuid, None);
        let child = add(
            csn(2),
            "cn=x,ou=people,dc=test",
            Uuid::new_v4(),
            Some(parent_uuid),
        );

        assert!(tracker.put(&parent));
        assert!(tracker.put(&child));
        assert!(!tracker.check_dependencies(&parent));
        assert!(tracker.check_dependencies(&child));
        assert!(tracker.next_ready().is_none());

        tracker.commit(&parent.csn());
        let freed = tracker.next_ready().unwrap();
        assert_eq!(freed.csn(), child.csn());
        tracker.commit(&child.csn());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_release_in_ascending_csn_order() {
        let tracker = RemotePendingChanges::new(100);
        let parent_uuid = Uuid::new_v4();
        let parent = add(csn(1), "ou=people,dc=test", parent_uuid, None);
        let child_uuid = Uuid::new_v4();
        let child = add(
            csn(2),
            "cn=x,ou=people,dc=test",
            child_uuid,
            Some(parent_uuid),
        );
        let mod_child = modify(csn(3), "cn=x,ou=people,dc=test", child_uuid);

        for m in [&parent, &child, &mod_child] {
            assert!(tracker.put(m));
        }
        assert!(tracker.check_dependencies(&child));
        assert!(tracker.check_dependencies(&mod_child));

        tracker.commit(&parent.csn());
        // Only the child Add frees up; the Modify still waits on it.
        assert_eq!(tracker.next_ready().unwrap().csn(), child.csn());
        assert!(tracker.next_ready().is_none());

        tracker.commit(&child.csn());
        assert_eq!(tracker.next_ready().unwrap().csn(), mod_child.csn());
    }

    #[test]
    fn test_delete_waits_for_pending_subtree() {
        let tracker = RemotePendingChanges::new(100);
        let child = delete(csn(1), "cn=x,ou=people,dc=test", Uuid::new_v4());
        let parent = delete(csn(2), "ou=people,dc=test", Uuid::new_v4());
        assert!(tracker.put(&child));
        assert!(tracker.put(&parent));
        assert!(!tracker.check_dependencies(&child));
        assert!(tracker.check_dependencies(&parent));

        tracker.commit(&child.csn());
        assert_eq!(tracker.next_ready().unwrap().csn(), parent.csn());
    }

    #[test]
    fn test_modify_dn_waits_for_destination_rename() {
        let tracker = RemotePendingChanges::new(100);
        let away = UpdateMessage::ModifyDn(ModifyDnMsg {
            csn: csn(1),
            dn: dn("cn=y,dc=test"),
            entry_uuid: Uuid::new_v4(),
            new_rdn: Rdn::new("cn", "z"),
            delete_old_rdn: true,
            new_superior: None,
            new_superior_uuid: None,
        });
        let incoming = UpdateMessage::ModifyDn(ModifyDnMsg {
            csn: csn(2),
            dn: dn("cn=x,dc=test"),
            entry_uuid: Uuid::new_v4(),
            new_rdn: Rdn::new("cn", "y"),
            delete_old_rdn: true,
            new_superior: None,
            new_superior_uuid: None,
        });
        assert!(tracker.put(&away));
        assert!(tracker.put(&incoming));
        assert!(tracker.check_dependencies(&incoming));
        tracker.commit(&away.csn());
        assert_eq!(tracker.next_ready().unwrap().csn(), incoming.csn());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let tracker = RemotePendingChanges::new(2);
        let a = add(csn(1), "cn=a,dc=test", Uuid::new_v4(), None);
        let b = add(csn(2), "cn=b,dc=test", Uuid::new_v4(), None);
        let c = add(csn(3), "cn=c,dc=test", Uuid::new_v4(), None);
        assert!(tracker.put(&a));
        assert!(tracker.put(&b));
        assert!(tracker.put(&c));
        assert_eq!(tracker.len(), 2);
        // The evicted oldest is accepted again as if newly delivered.
        assert!(tracker.put(&a));
    }
}
