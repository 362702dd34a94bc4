//! Per-entry historical change records.
//!
//! The historical record serves two purposes: reconstructing the operations
//! a replica performed during a disconnection window (recovery replay) and
//! resolving attribute-level conflicts by "last CSN wins". Records are kept
//! per entry by the storage backend and queried by CSN range.

use dirsync_types::{
    AddMsg, Csn, DeleteMsg, Dn, Modification, ModifyDnMsg, ModifyMsg, Rdn, UpdateMessage,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// What a historical record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoricalOp {
    /// The entry was created.
    Added {
        /// Parent identifier at creation time.
        parent_uuid: Option<Uuid>,
        /// Object classes of the created entry.
        object_classes: BTreeSet<String>,
        /// Attributes of the created entry.
        attrs: BTreeMap<String, Vec<String>>,
    },
    /// One attribute modification was applied.
    Modified(Modification),
    /// The entry was renamed or moved.
    Renamed {
        /// New leaf RDN.
        new_rdn: Rdn,
        /// Whether old RDN values were stripped.
        delete_old_rdn: bool,
        /// New parent, when the entry moved.
        new_superior: Option<Dn>,
        /// Identifier of the new parent, when one was specified.
        new_superior_uuid: Option<Uuid>,
    },
    /// The entry was deleted.
    Deleted,
}

/// One ordered element of the historical record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    /// CSN of the change.
    pub csn: Csn,
    /// Stable identifier of the affected entry.
    pub entry_uuid: Uuid,
    /// DN of the entry at the time of the change.
    pub dn: Dn,
    /// What happened.
    pub op: HistoricalOp,
}

impl HistoricalRecord {
    /// Rebuilds the update message this record was produced by, for
    /// republication during recovery.
    pub fn rebuild_message(&self) -> UpdateMessage {
        match &self.op {
            HistoricalOp::Added {
                parent_uuid,
                object_classes,
                attrs,
            } => UpdateMessage::Add(AddMsg {
                csn: self.csn,
                dn: self.dn.clone(),
                entry_uuid: self.entry_uuid,
                parent_uuid: *parent_uuid,
                object_classes: object_classes.clone(),
                attrs: attrs.clone(),
            }),
            HistoricalOp::Modified(modification) => UpdateMessage::Modify(ModifyMsg {
                csn: self.csn,
                dn: self.dn.clone(),
                entry_uuid: self.entry_uuid,
                mods: vec![modification.clone()],
            }),
            HistoricalOp::Renamed {
                new_rdn,
                delete_old_rdn,
                new_superior,
                new_superior_uuid,
            } => UpdateMessage::ModifyDn(ModifyDnMsg {
                csn: self.csn,
                dn: self.dn.clone(),
                entry_uuid: self.entry_uuid,
                new_rdn: new_rdn.clone(),
                delete_old_rdn: *delete_old_rdn,
                new_superior: new_superior.clone(),
                new_superior_uuid: *new_superior_uuid,
            }),
            HistoricalOp::Deleted => UpdateMessage::Delete(DeleteMsg {
                csn: self.csn,
                dn: self.dn.clone(),
                entry_uuid: self.entry_uuid,
            }),
        }
    }
}

/// Key the historical index stores records under. Fixed-width hex so that
/// lexicographic order on the keys matches CSN order, with the `dummy:`
/// prefix peers use in range filters. The server id gets its sign bit
/// flipped so negative ids sort before positive ones, like the CSNs do.
pub fn history_range_key(csn: &Csn) -> String {
    format!(
        "dummy:{:016x}{:08x}{:08x}",
        csn.time_ms(),
        csn.seq(),
        (csn.server_id() as u32) ^ 0x8000_0000,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_types::ModificationKind;

    fn record(op: HistoricalOp) -> HistoricalRecord {
        HistoricalRecord {
            csn: Csn::new(100, 2, 1),
            entry_uuid: Uuid::new_v4(),
            dn: "cn=x,dc=test".parse().unwrap(),
            op,
        }
    }

    #[test]
    fn test_rebuild_add() {
        let rec = record(HistoricalOp::Added {
            parent_uuid: None,
            object_classes: BTreeSet::from(["device".to_string()]),
            attrs: BTreeMap::new(),
        });
        let msg = rec.rebuild_message();
        assert_eq!(msg.kind(), "add");
        assert_eq!(msg.csn(), rec.csn);
        assert_eq!(msg.entry_uuid(), rec.entry_uuid);
    }

    #[test]
    fn test_rebuild_modify_carries_single_mod() {
        let m = Modification::new(ModificationKind::Replace, "description", vec!["x".into()]);
        let rec = record(HistoricalOp::Modified(m.clone()));
        match rec.rebuild_message() {
            UpdateMessage::Modify(msg) => assert_eq!(msg.mods, vec![m]),
            other => panic!("expected modify, got {}", other.kind()),
        }
    }

    #[test]
    fn test_rebuild_rename() {
        let rec = record(HistoricalOp::Renamed {
            new_rdn: Rdn::new("cn", "y"),
            delete_old_rdn: true,
            new_superior: None,
            new_superior_uuid: None,
        });
        assert_eq!(rec.rebuild_message().kind(), "modifydn");
    }

    #[test]
    fn test_range_key_format() {
        let csn = Csn::new(5, 6, 7);
        assert_eq!(
            history_range_key(&csn),
            "dummy:00000000000000050000000680000007"
        );
    }

    #[test]
    fn test_range_key_order_matches_csn_order() {
        let csns = [
            Csn::new(1, 9, 9),
            Csn::new(2, 0, -3),
            Csn::new(2, 0, 4),
            Csn::new(2, 1, 0),
            Csn::new(300, 0, 1),
        ];
        for pair in csns.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(history_range_key(&pair[0]) < history_range_key(&pair[1]));
        }
    }
}
