//! In-memory directory backend.
//!
//! Implements [`Storage`] and [`SchemaProvider`] over a plain map of entries,
//! with the same result-code behavior a real backend exhibits: parent checks,
//! leaf checks, RDN-strip detection, attribute-level last-CSN-wins, and a
//! per-CSN historical log. Used by the test suites and by embedders that do
//! not need durability. Also provides [`MemoryStateStore`] and a
//! [`RecordingBroker`] for tests.

use crate::conflict::CONFLICT_ATTR;
use crate::error::ReplError;
use crate::historical::{history_range_key, HistoricalOp, HistoricalRecord};
use crate::providers::{Broker, ConflictingEntry, SchemaProvider, StateStore, Storage};
use dirsync_types::{
    Csn, Dn, Entry, Modification, ModificationKind, ResultCode, ServerState, UpdateMessage,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

struct StoredEntry {
    entry: Entry,
    /// Last CSN that touched each attribute, for last-writer-wins.
    attr_csns: BTreeMap<String, Csn>,
    /// CSN of the change that gave the entry its current DN.
    dn_changed_at: Option<Csn>,
}

struct Store {
    entries: HashMap<Dn, StoredEntry>,
    by_uuid: HashMap<Uuid, Dn>,
    /// Historical records indexed by their textual range key, which sorts
    /// in CSN order.
    history: BTreeMap<String, Vec<HistoricalRecord>>,
    /// Result codes to return from the next `apply` calls, for tests.
    faults: VecDeque<ResultCode>,
    mandatory: BTreeSet<String>,
}

/// In-memory directory tree.
pub struct MemoryBackend {
    inner: Mutex<Store>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Store {
                entries: HashMap::new(),
                by_uuid: HashMap::new(),
                history: BTreeMap::new(),
                faults: VecDeque::new(),
                mandatory: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues a result code returned by the next `apply` call instead of
    /// touching the tree.
    pub fn inject_fault(&self, code: ResultCode) {
        self.lock().faults.push_back(code);
    }

    /// Declares an attribute schema-mandatory for every class.
    pub fn mark_mandatory(&self, attr: &str) {
        self.lock().mandatory.insert(attr.to_ascii_lowercase());
    }

    /// Number of entries in the tree.
    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of historical records retained.
    pub fn history_len(&self) -> usize {
        self.lock().history.values().map(Vec::len).sum()
    }

    fn apply_add(store: &mut Store, msg: &dirsync_types::AddMsg) -> ResultCode {
        if store.by_uuid.contains_key(&msg.entry_uuid) {
            // Same entry already replayed; idempotent.
            return ResultCode::NoOperation;
        }
        if store.entries.contains_key(&msg.dn) {
            return ResultCode::EntryAlreadyExists;
        }
        if msg.parent_uuid.is_some() {
            match msg.dn.parent() {
                Some(parent) if store.entries.contains_key(&parent) => {}
                _ => return ResultCode::NoSuchObject,
            }
        }
        let attr_csns = msg.attrs.keys().map(|a| (a.clone(), msg.csn)).collect();
        store.by_uuid.insert(msg.entry_uuid, msg.dn.clone());
        store.entries.insert(
            msg.dn.clone(),
            StoredEntry {
                entry: Entry {
                    dn: msg.dn.clone(),
                    uuid: msg.entry_uuid,
                    object_classes: msg.object_classes.clone(),
                    attrs: msg.attrs.clone(),
                },
                attr_csns,
                dn_changed_at: Some(msg.csn),
            },
        );
        store.history.entry(history_range_key(&msg.csn)).or_default().push(HistoricalRecord {
            csn: msg.csn,
            entry_uuid: msg.entry_uuid,
            dn: msg.dn.clone(),
            op: HistoricalOp::Added {
                parent_uuid: msg.parent_uuid,
                object_classes: msg.object_classes.clone(),
                attrs: msg.attrs.clone(),
            },
        });
        ResultCode::Success
    }

    fn apply_delete(store: &mut Store, msg: &dirsync_types::DeleteMsg) -> ResultCode {
        let Some(stored) = store.entries.get(&msg.dn) else {
            return ResultCode::NoSuchObject;
        };
        if stored.entry.uuid != msg.entry_uuid {
            // The DN is occupied by a different entry; the target moved.
            return ResultCode::NoSuchObject;
        }
        let has_children = store
            .entries
            .keys()
            .any(|dn| dn != &msg.dn && dn.is_child_of(&msg.dn));
        if has_children {
            return ResultCode::NotAllowedOnNonLeaf;
        }
        store.entries.remove(&msg.dn);
        store.by_uuid.remove(&msg.entry_uuid);
        store.history.entry(history_range_key(&msg.csn)).or_default().push(HistoricalRecord {
            csn: msg.csn,
            entry_uuid: msg.entry_uuid,
            dn: msg.dn.clone(),
            op: HistoricalOp::Deleted,
        });
        ResultCode::Success
    }

    /// Whether applying `modification` would strip the value the entry's RDN
    /// uses for that attribute.
    fn strips_rdn_value(entry: &Entry, modification: &Modification) -> bool {
        let Some(rdn) = entry.dn.rdn() else {
            return false;
        };
        let Some(rdn_value) = rdn.value_of(&modification.attr) else {
            return false;
        };
        match modification.kind {
            ModificationKind::Add => false,
            ModificationKind::Delete => {
                modification.values.is_empty()
                    || modification
                        .values
                        .iter()
                        .any(|v| v.eq_ignore_ascii_case(rdn_value))
            }
            ModificationKind::Replace => !modification
                .values
                .iter()
                .any(|v| v.eq_ignore_ascii_case(rdn_value)),
        }
    }

    fn apply_modify(store: &mut Store, msg: &dirsync_types::ModifyMsg) -> ResultCode {
        let Some(stored) = store.entries.get(&msg.dn) else {
            return ResultCode::NoSuchObject;
        };
        if stored.entry.uuid != msg.entry_uuid {
            return ResultCode::NoSuchObject;
        }
        for modification in &msg.mods {
            if Self::strips_rdn_value(&stored.entry, modification) {
                return ResultCode::NotAllowedOnRdn;
            }
        }
        let Some(stored) = store.entries.get_mut(&msg.dn) else {
            return ResultCode::NoSuchObject;
        };
        let mut applied = 0usize;
        for modification in &msg.mods {
            // Attribute-level last-writer-wins against the historical.
            if let Some(last) = stored.attr_csns.get(&modification.attr) {
                if last.is_newer_than(&msg.csn) {
                    trace!(attr = %modification.attr, %last, csn = %msg.csn,
                        "stale modification dropped");
                    continue;
                }
            }
            let values = stored.entry.attrs.entry(modification.attr.clone()).or_default();
            match modification.kind {
                ModificationKind::Add => {
                    for v in &modification.values {
                        if !values.iter().any(|existing| existing == v) {
                            values.push(v.clone());
                        }
                    }
                }
                ModificationKind::Delete => {
                    if modification.values.is_empty() {
                        values.clear();
                    } else {
                        values.retain(|v| !modification.values.contains(v));
                    }
                }
                ModificationKind::Replace => {
                    *values = modification.values.clone();
                }
            }
            if values.is_empty() {
                stored.entry.attrs.remove(&modification.attr);
            }
            stored.attr_csns.insert(modification.attr.clone(), msg.csn);
            applied += 1;
            store.history.entry(history_range_key(&msg.csn)).or_default().push(HistoricalRecord {
                csn: msg.csn,
                entry_uuid: msg.entry_uuid,
                dn: msg.dn.clone(),
                op: HistoricalOp::Modified(modification.clone()),
            });
        }
        if applied == 0 && !msg.mods.is_empty() {
            ResultCode::NoOperation
        } else {
            ResultCode::Success
        }
    }

    fn apply_modify_dn(store: &mut Store, msg: &dirsync_types::ModifyDnMsg) -> ResultCode {
        let Some(stored) = store.entries.get(&msg.dn) else {
            return ResultCode::NoSuchObject;
        };
        if stored.entry.uuid != msg.entry_uuid {
            return ResultCode::NoSuchObject;
        }
        let parent = match (&msg.new_superior, msg.dn.parent()) {
            (Some(superior), _) => superior.clone(),
            (None, Some(parent)) => parent,
            (None, None) => return ResultCode::UnwillingToPerform,
        };
        if msg.new_superior.is_some() && !store.entries.contains_key(&parent) {
            return ResultCode::NoSuchObject;
        }
        let dest = parent.child(msg.new_rdn.clone());
        if dest != msg.dn && store.entries.contains_key(&dest) {
            return ResultCode::EntryAlreadyExists;
        }

        let Some(mut stored) = store.entries.remove(&msg.dn) else {
            return ResultCode::NoSuchObject;
        };
        if msg.delete_old_rdn {
            if let Some(old_rdn) = msg.dn.rdn() {
                for (attr, value) in old_rdn.avas() {
                    if let Some(values) = stored.entry.attrs.get_mut(attr) {
                        values.retain(|v| !v.eq_ignore_ascii_case(value));
                        if values.is_empty() {
                            stored.entry.attrs.remove(attr);
                        }
                    }
                }
            }
        }
        for (attr, value) in msg.new_rdn.avas() {
            let values = stored.entry.attrs.entry(attr.clone()).or_default();
            if !values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                values.push(value.clone());
            }
            stored.attr_csns.insert(attr.clone(), msg.csn);
        }
        stored.entry.dn = dest.clone();
        stored.dn_changed_at = Some(msg.csn);
        store.by_uuid.insert(msg.entry_uuid, dest.clone());
        store.entries.insert(dest.clone(), stored);

        // Re-root the subtree under the new DN.
        let moved: Vec<Dn> = store
            .entries
            .keys()
            .filter(|dn| *dn != &dest && dn.is_under(&msg.dn))
            .cloned()
            .collect();
        for old in moved {
            if let Some(mut child) = store.entries.remove(&old) {
                let rebased = rebase(&old, &msg.dn, &dest);
                child.entry.dn = rebased.clone();
                store.by_uuid.insert(child.entry.uuid, rebased.clone());
                store.entries.insert(rebased, child);
            }
        }

        store.history.entry(history_range_key(&msg.csn)).or_default().push(HistoricalRecord {
            csn: msg.csn,
            entry_uuid: msg.entry_uuid,
            dn: msg.dn.clone(),
            op: HistoricalOp::Renamed {
                new_rdn: msg.new_rdn.clone(),
                delete_old_rdn: msg.delete_old_rdn,
                new_superior: msg.new_superior.clone(),
                new_superior_uuid: msg.new_superior_uuid,
            },
        });
        ResultCode::Success
    }
}

/// Rewrites `dn` (which sits under `from`) to sit under `to` instead.
fn rebase(dn: &Dn, from: &Dn, to: &Dn) -> Dn {
    let mut rebased = to.clone();
    let mut stack = Vec::new();
    let mut cursor = dn.clone();
    while cursor != *from {
        match (cursor.rdn().cloned(), cursor.parent()) {
            (Some(rdn), Some(parent)) => {
                stack.push(rdn);
                cursor = parent;
            }
            _ => break,
        }
    }
    while let Some(rdn) = stack.pop() {
        rebased = rebased.child(rdn);
    }
    rebased
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryBackend {
    fn apply(&self, msg: &UpdateMessage) -> ResultCode {
        let mut store = self.lock();
        if let Some(code) = store.faults.pop_front() {
            return code;
        }
        match msg {
            UpdateMessage::Add(m) => Self::apply_add(&mut store, m),
            UpdateMessage::Delete(m) => Self::apply_delete(&mut store, m),
            UpdateMessage::Modify(m) => Self::apply_modify(&mut store, m),
            UpdateMessage::ModifyDn(m) => Self::apply_modify_dn(&mut store, m),
        }
    }

    fn find_dn_by_uuid(&self, uuid: &Uuid) -> Option<Dn> {
        self.lock().by_uuid.get(uuid).cloned()
    }

    fn find_uuid(&self, dn: &Dn) -> Option<Uuid> {
        self.lock().entries.get(dn).map(|s| s.entry.uuid)
    }

    fn entry(&self, dn: &Dn) -> Option<Entry> {
        self.lock().entries.get(dn).map(|s| s.entry.clone())
    }

    fn children(&self, dn: &Dn) -> Vec<Dn> {
        let store = self.lock();
        let mut dns: Vec<Dn> = store
            .entries
            .keys()
            .filter(|child| child.is_child_of(dn))
            .cloned()
            .collect();
        dns.sort_by_key(|d| d.to_string());
        dns
    }

    fn find_conflicting(&self, dn: &Dn, uuid: &Uuid) -> Option<ConflictingEntry> {
        let store = self.lock();
        store.entries.get(dn).and_then(|stored| {
            if stored.entry.uuid == *uuid {
                None
            } else {
                Some(ConflictingEntry {
                    dn: dn.clone(),
                    uuid: stored.entry.uuid,
                    dn_changed_at: stored.dn_changed_at,
                })
            }
        })
    }

    fn conflict_marked(&self, intended: &Dn) -> Vec<ConflictingEntry> {
        let store = self.lock();
        let wanted = intended.to_string();
        let mut marked: Vec<ConflictingEntry> = store
            .entries
            .values()
            .filter(|stored| {
                stored
                    .entry
                    .attr(CONFLICT_ATTR)
                    .is_some_and(|values| values.iter().any(|v| *v == wanted))
            })
            .map(|stored| ConflictingEntry {
                dn: stored.entry.dn.clone(),
                uuid: stored.entry.uuid,
                dn_changed_at: stored.dn_changed_at,
            })
            .collect();
        marked.sort_by_key(|c| (c.dn_changed_at, c.dn.to_string()));
        marked
    }

    fn search_historical(&self, from: &Csn, to: &Csn) -> Vec<HistoricalRecord> {
        let store = self.lock();
        let from_key = history_range_key(from);
        let to_key = history_range_key(to);
        trace!(from = %from_key, to = %to_key, "historical range scan");
        store
            .history
            .range((Bound::Excluded(from_key), Bound::Included(to_key)))
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    fn purge_historical(&self, horizon: &Csn) -> usize {
        let mut store = self.lock();
        let old: Vec<String> = store
            .history
            .range(..=history_range_key(horizon))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in old {
            if let Some(records) = store.history.remove(&key) {
                removed += records.len();
            }
        }
        removed
    }
}

impl SchemaProvider for MemoryBackend {
    fn is_mandatory(&self, _object_classes: &BTreeSet<String>, attr: &str) -> bool {
        self.lock().mandatory.contains(&attr.to_ascii_lowercase())
    }
}

/// [`StateStore`] over an in-memory bincode blob.
#[derive(Default)]
pub struct MemoryStateStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one save happened, for tests.
    pub fn is_saved(&self) -> bool {
        self.bytes.lock().map(|b| b.is_some()).unwrap_or(false)
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &ServerState) -> Result<(), ReplError> {
        let encoded = bincode::serialize(state)?;
        let mut bytes = self.bytes.lock().map_err(|_| ReplError::StatePersistence {
            msg: "state store lock poisoned".to_string(),
        })?;
        *bytes = Some(encoded);
        Ok(())
    }

    fn load(&self) -> Result<Option<ServerState>, ReplError> {
        let bytes = self.bytes.lock().map_err(|_| ReplError::StatePersistence {
            msg: "state store lock poisoned".to_string(),
        })?;
        match bytes.as_deref() {
            Some(encoded) => Ok(Some(bincode::deserialize(encoded)?)),
            None => Ok(None),
        }
    }
}

/// [`Broker`] that records what was published, for tests and embedders that
/// drive the wire themselves.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<UpdateMessage>>,
    recovery: Mutex<Vec<UpdateMessage>>,
}

impl RecordingBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published on the normal path.
    pub fn published(&self) -> Vec<UpdateMessage> {
        self.published.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Messages published on the recovery path.
    pub fn recovered(&self) -> Vec<UpdateMessage> {
        self.recovery.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Broker for RecordingBroker {
    fn publish(&self, msg: &UpdateMessage) {
        if let Ok(mut published) = self.published.lock() {
            published.push(msg.clone());
        }
    }

    fn publish_recovery(&self, msg: &UpdateMessage) {
        if let Ok(mut recovery) = self.recovery.lock() {
            recovery.push(msg.clone());
        }
    }
}
