//! Error types for the replication engine.

use thiserror::Error;

/// Errors surfaced by the replication engine.
///
/// Conflict resolution and dependency handling never produce these: they are
/// fully local (see the conflict resolver). `ReplError` covers the failures
/// that must reach a caller: bad configuration, undecodable inbound data,
/// persistence problems, and operations attempted after shutdown.
#[derive(Debug, Error)]
pub enum ReplError {
    /// An inbound message could not be decoded. The change is skipped and
    /// the stream advances; this is surfaced for the repair tool since it
    /// represents potential permanent divergence.
    #[error("cannot decode update message")]
    Decode(#[from] bincode::Error),

    /// Invalid replication configuration.
    #[error("invalid configuration: {msg}")]
    Config {
        /// What was wrong.
        msg: String,
    },

    /// The persisted server state could not be saved or loaded.
    #[error("server state persistence failed: {msg}")]
    StatePersistence {
        /// Underlying failure description.
        msg: String,
    },

    /// I/O error from a persistence backend.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The engine is shutting down; the operation was not attempted.
    #[error("replication engine shut down")]
    Shutdown,
}
