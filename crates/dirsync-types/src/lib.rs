#![warn(missing_docs)]

//! DirSync replication data model: change sequence numbers, DNs, entries,
//! update messages and per-replica server state.

pub mod csn;
pub mod dn;
pub mod entry;
pub mod message;
pub mod state;

pub use csn::Csn;
pub use dn::{Dn, Rdn};
pub use entry::{Entry, Modification, ModificationKind, ResultCode};
pub use message::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg, OperationContext, UpdateMessage};
pub use state::ServerState;
