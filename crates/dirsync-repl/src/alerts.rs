//! Administrative alerts raised by the replication engine.
//!
//! Alerts are conditions an operator must look at (an unresolvable conflict,
//! a change dropped after its retry budget). They are logged at error level
//! and retained in memory so callers and tests can inspect them.

use dirsync_types::Csn;
use std::sync::Mutex;
use tracing::error;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// A naming conflict could not be resolved automatically.
    UnresolvedConflict,
    /// A remote change was abandoned after exhausting its retry budget.
    ReplayFailure,
    /// An inbound message could not be decoded and was skipped.
    DecodeFailure,
    /// Recovery stopped before republishing everything peers were missing.
    RecoveryIncomplete,
    /// The server state could not be persisted.
    PersistenceFailure,
}

/// One raised alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Category of the condition.
    pub kind: AlertKind,
    /// CSN of the change involved, when one exists.
    pub csn: Option<Csn>,
    /// Human-readable detail.
    pub detail: String,
}

/// In-memory alert sink shared across the engine's tasks.
#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an alert and logs it.
    pub fn raise(&self, kind: AlertKind, csn: Option<Csn>, detail: impl Into<String>) {
        let alert = Alert {
            kind,
            csn,
            detail: detail.into(),
        };
        match &alert.csn {
            Some(csn) => error!(?kind, %csn, detail = %alert.detail, "replication alert"),
            None => error!(?kind, detail = %alert.detail, "replication alert"),
        }
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }

    /// Snapshot of everything raised so far.
    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }

    /// Number of alerts raised.
    pub fn len(&self) -> usize {
        self.alerts.lock().map(|alerts| alerts.len()).unwrap_or(0)
    }

    /// Whether nothing has been raised.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_snapshot() {
        let log = AlertLog::new();
        assert!(log.is_empty());
        log.raise(AlertKind::ReplayFailure, Some(Csn::new(1, 0, 2)), "gave up");
        log.raise(AlertKind::DecodeFailure, None, "truncated frame");
        let alerts = log.snapshot();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::ReplayFailure);
        assert_eq!(alerts[0].csn, Some(Csn::new(1, 0, 2)));
        assert_eq!(alerts[1].kind, AlertKind::DecodeFailure);
    }
}
