#![warn(missing_docs)]

//! DirSync replication engine: change ordering, conflict resolution and
//! catch-up replication for one multi-master directory suffix.
//!
//! Each replicated base DN gets a [`ReplicationDomain`] wired to the
//! collaborators in [`providers`]: local storage, schema, the replication
//! broker and a state store. Local writes go through
//! [`ReplicationDomain::apply_local`], remote changes through
//! [`ReplicationDomain::process_update`]; everything in between (CSN
//! allocation, pending-change tracking, fractional filtering, naming
//! conflict resolution, recovery after a disconnection) is internal to the
//! engine.

pub mod alerts;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fractional;
pub mod generator;
pub mod historical;
pub mod memstore;
pub mod pending;
pub mod providers;
pub mod recovery;
pub mod remote_pending;

mod engine;

pub use alerts::{Alert, AlertKind, AlertLog};
pub use config::DomainConfig;
pub use conflict::{ConflictOutcome, ConflictResolver, CONFLICT_ATTR};
pub use engine::{LocalWrite, MonitorSnapshot, ReplicationDomain};
pub use error::ReplError;
pub use fractional::{FractionalConfig, FractionalMode, ModFilterOutcome};
pub use generator::{ClockSource, CsnGenerator, SystemClock};
pub use historical::{HistoricalOp, HistoricalRecord};
pub use memstore::{MemoryBackend, MemoryStateStore, RecordingBroker};
pub use pending::PendingChanges;
pub use providers::{Broker, ConflictingEntry, SchemaProvider, StateStore, Storage};
pub use remote_pending::RemotePendingChanges;
