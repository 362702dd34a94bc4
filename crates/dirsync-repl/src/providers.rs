//! Traits the replication engine depends on.
//!
//! The engine never touches a backend, a schema or the wire directly: it sees
//! storage through [`Storage`], schema through [`SchemaProvider`], the
//! replication service through [`Broker`] and durable state through
//! [`StateStore`]. The in-memory implementations in [`crate::memstore`] back
//! the tests; a production deployment plugs real ones in.

use crate::historical::HistoricalRecord;
use dirsync_types::{Csn, Dn, Entry, ResultCode, ServerState, UpdateMessage};
use std::collections::BTreeSet;
use uuid::Uuid;

/// An entry found squatting on a DN another change wants, as reported by
/// [`Storage::find_conflicting`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingEntry {
    /// DN the entry currently holds.
    pub dn: Dn,
    /// Its stable identifier.
    pub uuid: Uuid,
    /// CSN of the change that gave the entry its current DN, when known.
    pub dn_changed_at: Option<Csn>,
}

/// Local directory storage as the replay and resolution paths see it.
///
/// `apply` is the single mutation entry point; it returns the backend result
/// code instead of an error so the replay loop can dispatch on the full
/// closed set of codes.
pub trait Storage: Send + Sync {
    /// Applies one operation and reports the backend's verdict. Historical
    /// bookkeeping (per-attribute CSNs, change records) happens here too.
    fn apply(&self, msg: &UpdateMessage) -> ResultCode;

    /// Resolves an entry identifier to its current DN.
    fn find_dn_by_uuid(&self, uuid: &Uuid) -> Option<Dn>;

    /// Resolves a DN to the identifier of the entry holding it.
    fn find_uuid(&self, dn: &Dn) -> Option<Uuid>;

    /// Reads the entry at `dn`.
    fn entry(&self, dn: &Dn) -> Option<Entry>;

    /// DNs of the entries directly under `dn`.
    fn children(&self, dn: &Dn) -> Vec<Dn>;

    /// Looks for an entry other than `uuid` currently occupying `dn`.
    fn find_conflicting(&self, dn: &Dn, uuid: &Uuid) -> Option<ConflictingEntry>;

    /// Entries carrying a conflict marker naming `intended` as the DN they
    /// should hold.
    fn conflict_marked(&self, intended: &Dn) -> Vec<ConflictingEntry>;

    /// Historical records with CSN strictly greater than `from` and at most
    /// `to`, in ascending CSN order.
    fn search_historical(&self, from: &Csn, to: &Csn) -> Vec<HistoricalRecord>;

    /// Drops historical records at or before `horizon`. Returns how many
    /// were removed.
    fn purge_historical(&self, horizon: &Csn) -> usize;
}

/// The slice of schema knowledge fractional filtering needs.
pub trait SchemaProvider: Send + Sync {
    /// Whether `attr` is mandatory for an entry carrying `object_classes`.
    fn is_mandatory(&self, object_classes: &BTreeSet<String>, attr: &str) -> bool;
}

/// Outbound side of the replication service connection.
pub trait Broker: Send + Sync {
    /// Publishes one locally originated change to peers.
    fn publish(&self, msg: &UpdateMessage);

    /// Publishes one change reconstructed from history after a
    /// disconnection. Kept distinct so transports can flag these for
    /// peers that are themselves recovering.
    fn publish_recovery(&self, msg: &UpdateMessage);
}

/// Durable persistence for the per-replica server state.
pub trait StateStore: Send + Sync {
    /// Persists the state snapshot.
    fn save(&self, state: &ServerState) -> Result<(), crate::error::ReplError>;

    /// Loads the last persisted snapshot, or `None` on first start.
    fn load(&self) -> Result<Option<ServerState>, crate::error::ReplError>;
}
