//! Naming-conflict resolution for failed remote replays.
//!
//! When replaying a remote change fails with a result code that points at a
//! DN or identifier mismatch, the resolver computes a corrective action. The
//! rules are per operation kind and rely on the stable entry identifier: a
//! rename on one replica never prevents a concurrent change from another
//! replica from landing, it just lands on the entry's current DN.
//!
//! Entries that lose a name fight are parked under a synthetic conflict DN
//! (`entryuuid=<uuid>+<original rdn>` below the domain base) and marked with
//! the DN they should have. When a Delete or a rename later frees that DN,
//! the oldest marked entry is renamed back and unmarked.

use crate::alerts::{AlertKind, AlertLog};
use crate::generator::CsnGenerator;
use crate::providers::Storage;
use dirsync_types::{
    AddMsg, Csn, DeleteMsg, Dn, Modification, ModificationKind, ModifyDnMsg, ModifyMsg, Rdn,
    ResultCode, UpdateMessage,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marker attribute recording, on a conflict-renamed entry, the DN it should
/// hold once the colliding name is released.
pub const CONFLICT_ATTR: &str = "ds-sync-conflict";

/// Decision of the resolver for one failed replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Nothing left to do; the change is effectively applied or obsolete.
    Resolved,
    /// Re-attempt the apply with the corrected message.
    Retry(UpdateMessage),
    /// Re-attempt with the corrected message, but the entry ends up under a
    /// conflict name needing operator attention.
    ConflictedRetry(UpdateMessage),
    /// No automatic resolution; the entry was marked for the operator.
    ConflictedDone,
    /// The result code is not a naming conflict; logged for manual repair.
    NotNamingConflict,
}

impl ConflictOutcome {
    /// Whether the outcome leaves a conflict for the operator.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            ConflictOutcome::ConflictedRetry(_) | ConflictOutcome::ConflictedDone
        )
    }
}

/// Per-domain conflict resolver.
pub struct ConflictResolver {
    base_dn: Dn,
    storage: Arc<dyn Storage>,
    generator: Arc<CsnGenerator>,
    alerts: Arc<AlertLog>,
}

/// The synthetic RDN given to an entry displaced by a naming conflict:
/// `entryuuid=<uuid>` plus the entry's original RDN values, guaranteed
/// collision-free because the identifier is unique.
pub fn conflict_rdn(uuid: &Uuid, original: Option<&Rdn>) -> Rdn {
    let mut avas = vec![("entryuuid".to_string(), uuid.to_string())];
    if let Some(original) = original {
        avas.extend(original.avas().iter().cloned());
    }
    Rdn::multi(avas)
}

impl ConflictResolver {
    /// Creates a resolver for the domain rooted at `base_dn`.
    pub fn new(
        base_dn: Dn,
        storage: Arc<dyn Storage>,
        generator: Arc<CsnGenerator>,
        alerts: Arc<AlertLog>,
    ) -> Self {
        Self {
            base_dn,
            storage,
            generator,
            alerts,
        }
    }

    /// Resolves one failed replay. Corrective writes performed here (conflict
    /// marking, child renames) go straight to storage and are never
    /// republished.
    pub fn resolve(&self, code: ResultCode, msg: &UpdateMessage) -> ConflictOutcome {
        let outcome = match msg {
            UpdateMessage::Add(add) => self.resolve_add(code, add),
            UpdateMessage::Delete(del) => self.resolve_delete(code, del),
            UpdateMessage::Modify(modify) => self.resolve_modify(code, modify),
            UpdateMessage::ModifyDn(mdn) => self.resolve_modify_dn(code, mdn),
        };
        if outcome.is_unresolved() {
            self.alerts.raise(
                AlertKind::UnresolvedConflict,
                Some(msg.csn()),
                format!("{} on {} could not be fully resolved", msg.kind(), msg.dn()),
            );
        }
        outcome
    }

    fn resolve_add(&self, code: ResultCode, add: &AddMsg) -> ConflictOutcome {
        match code {
            // Parent is missing at the expected DN. It may just have moved.
            ResultCode::NoSuchObject => match add
                .parent_uuid
                .as_ref()
                .and_then(|uuid| self.storage.find_dn_by_uuid(uuid))
            {
                Some(parent_dn) => {
                    let retargeted = match add.dn.rdn() {
                        Some(rdn) => parent_dn.child(rdn.clone()),
                        None => parent_dn,
                    };
                    debug!(csn = %add.csn, dn = %add.dn, new_dn = %retargeted,
                        "add retargeted under moved parent");
                    let mut corrected = add.clone();
                    corrected.dn = retargeted;
                    ConflictOutcome::Retry(UpdateMessage::Add(corrected))
                }
                // Parent deleted concurrently: park the orphan under the
                // base with a conflict name.
                None => {
                    let mut corrected = add.clone();
                    corrected.dn = self
                        .base_dn
                        .child(conflict_rdn(&add.entry_uuid, add.dn.rdn()));
                    corrected.parent_uuid = self.storage.find_uuid(&self.base_dn);
                    corrected
                        .attrs
                        .insert(CONFLICT_ATTR.to_string(), vec![add.dn.to_string()]);
                    warn!(csn = %add.csn, dn = %add.dn, conflict_dn = %corrected.dn,
                        "orphaned add parked under conflict name");
                    ConflictOutcome::ConflictedRetry(UpdateMessage::Add(corrected))
                }
            },
            ResultCode::EntryAlreadyExists => {
                if self.storage.find_dn_by_uuid(&add.entry_uuid).is_some() {
                    // Same entry, duplicate replay.
                    ConflictOutcome::Resolved
                } else {
                    // Different entry won the name; this one gets a conflict
                    // name under the same parent.
                    let mut corrected = add.clone();
                    let rdn = conflict_rdn(&add.entry_uuid, add.dn.rdn());
                    corrected.dn = match add.dn.with_rdn(rdn.clone()) {
                        Some(dn) => dn,
                        None => self.base_dn.child(rdn),
                    };
                    corrected
                        .attrs
                        .insert(CONFLICT_ATTR.to_string(), vec![add.dn.to_string()]);
                    warn!(csn = %add.csn, dn = %add.dn, conflict_dn = %corrected.dn,
                        "concurrent add lost the name fight");
                    ConflictOutcome::ConflictedRetry(UpdateMessage::Add(corrected))
                }
            }
            _ => self.not_naming(code, add.csn),
        }
    }

    fn resolve_delete(&self, code: ResultCode, del: &DeleteMsg) -> ConflictOutcome {
        match code {
            ResultCode::NoSuchObject => {
                match self.storage.find_dn_by_uuid(&del.entry_uuid) {
                    // Renamed concurrently: delete it where it lives now.
                    Some(current) if current != del.dn => {
                        debug!(csn = %del.csn, dn = %del.dn, current = %current,
                            "delete retargeted to renamed entry");
                        let mut corrected = del.clone();
                        corrected.dn = current;
                        ConflictOutcome::Retry(UpdateMessage::Delete(corrected))
                    }
                    Some(_) => ConflictOutcome::NotNamingConflict,
                    // Already deleted everywhere.
                    None => ConflictOutcome::Resolved,
                }
            }
            // Children were added concurrently under the entry being
            // deleted. Park each child under a conflict name (the same place
            // an orphaned Add would put it), then retry the delete.
            ResultCode::NotAllowedOnNonLeaf => {
                for child_dn in self.storage.children(&del.dn) {
                    if let Some(child_uuid) = self.storage.find_uuid(&child_dn) {
                        self.rename_to_conflict(&child_dn, child_uuid);
                    }
                }
                ConflictOutcome::Retry(UpdateMessage::Delete(del.clone()))
            }
            _ => self.not_naming(code, del.csn),
        }
    }

    fn resolve_modify(&self, code: ResultCode, modify: &ModifyMsg) -> ConflictOutcome {
        match code {
            ResultCode::NoSuchObject => {
                match self.storage.find_dn_by_uuid(&modify.entry_uuid) {
                    Some(current) if current != modify.dn => {
                        debug!(csn = %modify.csn, dn = %modify.dn, current = %current,
                            "modify retargeted to renamed entry");
                        let mut corrected = modify.clone();
                        corrected.dn = current;
                        ConflictOutcome::Retry(UpdateMessage::Modify(corrected))
                    }
                    Some(_) => ConflictOutcome::NotNamingConflict,
                    // Entry deleted concurrently; the modify is obsolete.
                    None => ConflictOutcome::Resolved,
                }
            }
            // A delete/replace would strip the value the RDN uses. Rewrite
            // the offending modifications to retain it.
            ResultCode::NotAllowedOnRdn => {
                let current = self
                    .storage
                    .find_dn_by_uuid(&modify.entry_uuid)
                    .unwrap_or_else(|| modify.dn.clone());
                let Some(rdn) = current.rdn().cloned() else {
                    return ConflictOutcome::NotNamingConflict;
                };
                let mut corrected = modify.clone();
                corrected.dn = current;
                for modification in &mut corrected.mods {
                    rewrite_for_rdn(modification, &rdn);
                }
                debug!(csn = %modify.csn, dn = %modify.dn,
                    "modify rewritten to preserve naming values");
                ConflictOutcome::Retry(UpdateMessage::Modify(corrected))
            }
            _ => self.not_naming(code, modify.csn),
        }
    }

    fn resolve_modify_dn(&self, code: ResultCode, mdn: &ModifyDnMsg) -> ConflictOutcome {
        match code {
            // The original treats schema refusals on a rename like a stale
            // target as well: retarget by identifier and retry.
            ResultCode::NoSuchObject
            | ResultCode::UnwillingToPerform
            | ResultCode::ObjectClassViolation => {
                let Some(current) = self.storage.find_dn_by_uuid(&mdn.entry_uuid) else {
                    // Entry deleted concurrently; the rename is obsolete.
                    return ConflictOutcome::Resolved;
                };
                if let Some(destination) = self.destination(mdn) {
                    if current == destination {
                        // Duplicate replay of an already-applied rename.
                        return ConflictOutcome::Resolved;
                    }
                }
                let mut corrected = mdn.clone();
                corrected.dn = current.clone();
                if let Some(superior_uuid) = &mdn.new_superior_uuid {
                    match self.storage.find_dn_by_uuid(superior_uuid) {
                        Some(superior_dn) => corrected.new_superior = Some(superior_dn),
                        // The new parent is gone; nowhere sane to move the
                        // entry. Mark it and leave it where it is.
                        None => {
                            if let Some(destination) = self.destination(mdn) {
                                self.mark_conflict(&current, mdn.entry_uuid, &destination);
                            }
                            warn!(csn = %mdn.csn, dn = %mdn.dn,
                                "rename target superior no longer exists");
                            return ConflictOutcome::ConflictedDone;
                        }
                    }
                }
                debug!(csn = %mdn.csn, dn = %mdn.dn, current = %current,
                    "rename retargeted by identifier");
                ConflictOutcome::Retry(UpdateMessage::ModifyDn(corrected))
            }
            // Another entry occupies the destination. The moving entry takes
            // a conflict RDN instead and remembers the name it wanted.
            ResultCode::EntryAlreadyExists => {
                let mut corrected = mdn.clone();
                corrected.new_rdn = conflict_rdn(&mdn.entry_uuid, Some(&mdn.new_rdn));
                if let Some(destination) = self.destination(mdn) {
                    self.mark_conflict(&mdn.dn, mdn.entry_uuid, &destination);
                }
                warn!(csn = %mdn.csn, dn = %mdn.dn, new_rdn = %corrected.new_rdn,
                    "rename destination occupied, using conflict name");
                ConflictOutcome::ConflictedRetry(UpdateMessage::ModifyDn(corrected))
            }
            _ => self.not_naming(code, mdn.csn),
        }
    }

    /// The DN the rename is trying to give its entry.
    fn destination(&self, mdn: &ModifyDnMsg) -> Option<Dn> {
        match &mdn.new_superior {
            Some(superior) => Some(superior.child(mdn.new_rdn.clone())),
            None => mdn.dn.with_rdn(mdn.new_rdn.clone()),
        }
    }

    fn not_naming(&self, code: ResultCode, csn: Csn) -> ConflictOutcome {
        warn!(?code, %csn, "replay failure is not a naming conflict");
        ConflictOutcome::NotNamingConflict
    }

    /// Moves an entry out of the way under a conflict name below the domain
    /// base, marking it with the DN it held. Direct storage write.
    fn rename_to_conflict(&self, dn: &Dn, uuid: Uuid) {
        let rename = ModifyDnMsg {
            csn: self.generator.next(),
            dn: dn.clone(),
            entry_uuid: uuid,
            new_rdn: conflict_rdn(&uuid, dn.rdn()),
            delete_old_rdn: false,
            new_superior: Some(self.base_dn.clone()),
            new_superior_uuid: self.storage.find_uuid(&self.base_dn),
        };
        let code = self.storage.apply(&UpdateMessage::ModifyDn(rename));
        if code != ResultCode::Success {
            warn!(%dn, ?code, "failed to park entry under conflict name");
            return;
        }
        if let Some(current) = self.storage.find_dn_by_uuid(&uuid) {
            self.mark_conflict(&current, uuid, dn);
        }
    }

    /// Writes the conflict marker on an entry. Direct storage write.
    fn mark_conflict(&self, dn: &Dn, uuid: Uuid, intended: &Dn) {
        let mark = ModifyMsg {
            csn: self.generator.next(),
            dn: dn.clone(),
            entry_uuid: uuid,
            mods: vec![Modification::new(
                ModificationKind::Replace,
                CONFLICT_ATTR,
                vec![intended.to_string()],
            )],
        };
        let code = self.storage.apply(&UpdateMessage::Modify(mark));
        if code != ResultCode::Success && code != ResultCode::NoOperation {
            warn!(%dn, ?code, "failed to write conflict marker");
        }
    }

    /// Called after a successful Delete or rename freed `freed_dn`: if any
    /// entry was parked waiting for that name, the oldest one gets it back
    /// and its marker is cleared.
    pub fn check_for_cleared_conflict(&self, freed_dn: &Dn) {
        let marked = self.storage.conflict_marked(freed_dn);
        let Some(winner) = marked.first() else {
            return;
        };
        let Some(new_rdn) = freed_dn.rdn().cloned() else {
            return;
        };
        let rename = ModifyDnMsg {
            csn: self.generator.next(),
            dn: winner.dn.clone(),
            entry_uuid: winner.uuid,
            new_rdn,
            delete_old_rdn: true,
            new_superior: freed_dn.parent(),
            new_superior_uuid: freed_dn.parent().and_then(|p| self.storage.find_uuid(&p)),
        };
        let code = self.storage.apply(&UpdateMessage::ModifyDn(rename));
        if code != ResultCode::Success {
            warn!(dn = %winner.dn, freed = %freed_dn, ?code,
                "could not restore conflicted entry to its freed name");
            return;
        }
        let unmark = ModifyMsg {
            csn: self.generator.next(),
            dn: freed_dn.clone(),
            entry_uuid: winner.uuid,
            mods: vec![Modification::new(
                ModificationKind::Delete,
                CONFLICT_ATTR,
                Vec::new(),
            )],
        };
        let code = self.storage.apply(&UpdateMessage::Modify(unmark));
        if code != ResultCode::Success {
            warn!(dn = %freed_dn, ?code, "could not clear conflict marker");
        }
        info!(dn = %freed_dn, "conflicted entry restored to its intended name");
    }
}

/// Rewrites one modification so it can no longer strip `rdn`'s values.
fn rewrite_for_rdn(modification: &mut Modification, rdn: &Rdn) {
    let Some(rdn_value) = rdn.value_of(&modification.attr) else {
        return;
    };
    match modification.kind {
        ModificationKind::Add => {}
        ModificationKind::Delete => {
            if modification.values.is_empty() {
                // Whole-attribute delete becomes "keep only the naming
                // value".
                modification.kind = ModificationKind::Replace;
                modification.values = vec![rdn_value.to_string()];
            } else {
                modification
                    .values
                    .retain(|v| !v.eq_ignore_ascii_case(rdn_value));
            }
        }
        ModificationKind::Replace => {
            if !modification
                .values
                .iter()
                .any(|v| v.eq_ignore_ascii_case(rdn_value))
            {
                modification.values.push(rdn_value.to_string());
            }
        }
    }
}
