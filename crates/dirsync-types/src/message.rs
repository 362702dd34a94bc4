//! Replication update messages and operation contexts.
//!
//! An [`UpdateMessage`] is the unit published between replicas: one local
//! write, self-contained enough to be replayed against any peer's storage.
//! The conflict resolver retargets messages in place (new DN, new superior)
//! before a replay retry.

use crate::csn::Csn;
use crate::dn::{Dn, Rdn};
use crate::entry::Modification;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// An Add operation to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMsg {
    /// Change identifier.
    pub csn: Csn,
    /// DN of the new entry.
    pub dn: Dn,
    /// Stable identifier of the new entry.
    pub entry_uuid: Uuid,
    /// Stable identifier of the parent, `None` when the entry is the domain
    /// base itself.
    pub parent_uuid: Option<Uuid>,
    /// Object classes of the new entry.
    pub object_classes: BTreeSet<String>,
    /// User attributes of the new entry.
    pub attrs: BTreeMap<String, Vec<String>>,
}

/// A Delete operation to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMsg {
    /// Change identifier.
    pub csn: Csn,
    /// DN the entry had when deleted.
    pub dn: Dn,
    /// Stable identifier of the deleted entry.
    pub entry_uuid: Uuid,
}

/// A Modify operation to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyMsg {
    /// Change identifier.
    pub csn: Csn,
    /// DN of the modified entry.
    pub dn: Dn,
    /// Stable identifier of the modified entry.
    pub entry_uuid: Uuid,
    /// Attribute modifications, in request order.
    pub mods: Vec<Modification>,
}

/// A ModifyDN (rename/move) operation to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyDnMsg {
    /// Change identifier.
    pub csn: Csn,
    /// DN of the entry before the rename.
    pub dn: Dn,
    /// Stable identifier of the renamed entry.
    pub entry_uuid: Uuid,
    /// New leaf RDN.
    pub new_rdn: Rdn,
    /// Whether old RDN values are removed from the entry.
    pub delete_old_rdn: bool,
    /// New parent, `None` to keep the current parent.
    pub new_superior: Option<Dn>,
    /// Stable identifier of the new parent, when one was specified.
    pub new_superior_uuid: Option<Uuid>,
}

/// One replicated change, as carried on the wire and replayed locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMessage {
    /// Entry creation.
    Add(AddMsg),
    /// Entry deletion.
    Delete(DeleteMsg),
    /// Attribute modification.
    Modify(ModifyMsg),
    /// Rename or move.
    ModifyDn(ModifyDnMsg),
}

impl UpdateMessage {
    /// The change identifier of this message.
    pub fn csn(&self) -> Csn {
        match self {
            UpdateMessage::Add(m) => m.csn,
            UpdateMessage::Delete(m) => m.csn,
            UpdateMessage::Modify(m) => m.csn,
            UpdateMessage::ModifyDn(m) => m.csn,
        }
    }

    /// The (current) target DN of this message.
    pub fn dn(&self) -> &Dn {
        match self {
            UpdateMessage::Add(m) => &m.dn,
            UpdateMessage::Delete(m) => &m.dn,
            UpdateMessage::Modify(m) => &m.dn,
            UpdateMessage::ModifyDn(m) => &m.dn,
        }
    }

    /// Retargets the message to a new DN, used by conflict resolution when
    /// the original target moved.
    pub fn set_dn(&mut self, dn: Dn) {
        match self {
            UpdateMessage::Add(m) => m.dn = dn,
            UpdateMessage::Delete(m) => m.dn = dn,
            UpdateMessage::Modify(m) => m.dn = dn,
            UpdateMessage::ModifyDn(m) => m.dn = dn,
        }
    }

    /// Stable identifier of the entry this message is about.
    pub fn entry_uuid(&self) -> Uuid {
        match self {
            UpdateMessage::Add(m) => m.entry_uuid,
            UpdateMessage::Delete(m) => m.entry_uuid,
            UpdateMessage::Modify(m) => m.entry_uuid,
            UpdateMessage::ModifyDn(m) => m.entry_uuid,
        }
    }

    /// Short operation-kind label, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateMessage::Add(_) => "add",
            UpdateMessage::Delete(_) => "delete",
            UpdateMessage::Modify(_) => "modify",
            UpdateMessage::ModifyDn(_) => "modifydn",
        }
    }
}

/// Context attached to an operation as it flows through the engine. Its
/// presence on an operation is what distinguishes a replayed remote change
/// from a local client write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationContext {
    /// Context of an Add.
    Add {
        /// Change identifier.
        csn: Csn,
        /// Identifier of the added entry.
        entry_uuid: Uuid,
        /// Identifier of its parent, if not the domain base.
        parent_uuid: Option<Uuid>,
    },
    /// Context of a Delete.
    Delete {
        /// Change identifier.
        csn: Csn,
        /// Identifier of the deleted entry.
        entry_uuid: Uuid,
    },
    /// Context of a Modify.
    Modify {
        /// Change identifier.
        csn: Csn,
        /// Identifier of the modified entry.
        entry_uuid: Uuid,
    },
    /// Context of a ModifyDN.
    ModifyDn {
        /// Change identifier.
        csn: Csn,
        /// Identifier of the renamed entry.
        entry_uuid: Uuid,
        /// Identifier of the new superior, when one was specified.
        new_superior_uuid: Option<Uuid>,
    },
}

impl OperationContext {
    /// The CSN allocated to the operation.
    pub fn csn(&self) -> Csn {
        match self {
            OperationContext::Add { csn, .. }
            | OperationContext::Delete { csn, .. }
            | OperationContext::Modify { csn, .. }
            | OperationContext::ModifyDn { csn, .. } => *csn,
        }
    }

    /// The stable identifier of the operation's entry.
    pub fn entry_uuid(&self) -> Uuid {
        match self {
            OperationContext::Add { entry_uuid, .. }
            | OperationContext::Delete { entry_uuid, .. }
            | OperationContext::Modify { entry_uuid, .. }
            | OperationContext::ModifyDn { entry_uuid, .. } => *entry_uuid,
        }
    }
}
