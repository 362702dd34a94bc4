//! Directory entries, attribute modifications and backend result codes.

use crate::dn::Dn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A directory entry as seen by the replication core: its DN, stable
/// identifier, object classes and user attributes. Attribute names are
/// lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Current DN of the entry.
    pub dn: Dn,
    /// Stable identifier, invariant across renames.
    pub uuid: Uuid,
    /// Object classes (lowercase names).
    pub object_classes: BTreeSet<String>,
    /// User attributes and their values.
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    /// Value(s) of an attribute, if present.
    pub fn attr(&self, name: &str) -> Option<&Vec<String>> {
        self.attrs.get(&name.to_ascii_lowercase())
    }
}

/// How a modification alters an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationKind {
    /// Add the listed values.
    Add,
    /// Delete the listed values, or the whole attribute when empty.
    Delete,
    /// Replace all values with the listed ones.
    Replace,
}

/// A single attribute modification within a Modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// The kind of change.
    pub kind: ModificationKind,
    /// Target attribute (lowercase).
    pub attr: String,
    /// Values involved; may be empty for a whole-attribute delete.
    pub values: Vec<String>,
}

impl Modification {
    /// Convenience constructor normalizing the attribute name.
    pub fn new(kind: ModificationKind, attr: &str, values: Vec<String>) -> Self {
        Self {
            kind,
            attr: attr.to_ascii_lowercase(),
            values,
        }
    }
}

/// Result of applying an operation against local storage. This is the closed
/// set of codes the replication engine dispatches on; anything else travels
/// as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// The operation was applied.
    Success,
    /// Pre-operation resolution decided the operation is a no-op (for
    /// example an Add replayed a second time).
    NoOperation,
    /// The target entry (or a required parent) does not exist.
    NoSuchObject,
    /// An entry already occupies the target DN.
    EntryAlreadyExists,
    /// A Delete hit an entry that still has children.
    NotAllowedOnNonLeaf,
    /// A Modify would strip a value used in the entry's RDN.
    NotAllowedOnRdn,
    /// The server refuses the operation (policy).
    UnwillingToPerform,
    /// Schema violation on the resulting entry.
    ObjectClassViolation,
    /// Transient: the backend could not take a lock right now.
    Busy,
    /// Transient: the backend is temporarily offline.
    Unavailable,
    /// Any other code, carried numerically.
    Other(u32),
}

impl ResultCode {
    /// Transient conditions are retried by the replay loop without being
    /// classified as naming conflicts.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResultCode::Busy | ResultCode::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_entry_attr_lookup_is_case_insensitive() {
        let entry = Entry {
            dn: Dn::from_str("cn=x,dc=test").unwrap(),
            uuid: Uuid::new_v4(),
            object_classes: BTreeSet::from(["device".to_string()]),
            attrs: BTreeMap::from([("cn".to_string(), vec!["x".to_string()])]),
        };
        assert_eq!(entry.attr("CN").unwrap(), &vec!["x".to_string()]);
        assert!(entry.attr("description").is_none());
    }

    #[test]
    fn test_modification_normalizes_attr() {
        let m = Modification::new(ModificationKind::Replace, "Description", vec![]);
        assert_eq!(m.attr, "description");
    }

    #[test]
    fn test_transient_codes() {
        assert!(ResultCode::Busy.is_transient());
        assert!(ResultCode::Unavailable.is_transient());
        assert!(!ResultCode::NoSuchObject.is_transient());
        assert!(!ResultCode::Success.is_transient());
    }
}
