//! Tracking of locally originated changes between CSN allocation and
//! publication.
//!
//! Local writes allocate their CSN before the backend applies them, so
//! operations can commit out of allocation order. Peers, on the other hand,
//! must see the stream in CSN order with no gaps: a change is released for
//! publication only once every older allocated change has committed or been
//! removed.

use crate::generator::CsnGenerator;
use dirsync_types::{Csn, UpdateMessage};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

enum PendingStatus {
    InProgress,
    Committed(UpdateMessage),
}

struct Inner {
    changes: BTreeMap<Csn, PendingStatus>,
    /// Newest CSN whose change (and all older ones) has been drained.
    max_committed: Option<Csn>,
    /// Newest CSN handed out by `allocate`.
    newest_allocated: Option<Csn>,
    /// While true, drained messages are withheld from publication because a
    /// recovery scan is republishing history and would duplicate them.
    recovering: bool,
}

/// Tracker for local in-flight changes, releasing a contiguous committed
/// prefix in CSN order.
pub struct PendingChanges {
    inner: Mutex<Inner>,
}

impl PendingChanges {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                changes: BTreeMap::new(),
                max_committed: None,
                newest_allocated: None,
                recovering: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocates a CSN for a starting local operation and records it as in
    /// progress.
    pub fn allocate(&self, generator: &CsnGenerator) -> Csn {
        let mut inner = self.lock();
        let csn = generator.next();
        inner.changes.insert(csn, PendingStatus::InProgress);
        inner.newest_allocated = Some(csn);
        csn
    }

    /// Marks an allocated change committed and attaches its outbound message.
    pub fn commit(&self, csn: Csn, msg: UpdateMessage) {
        let mut inner = self.lock();
        inner.changes.insert(csn, PendingStatus::Committed(msg));
    }

    /// Drops an allocation whose operation failed before commit, unblocking
    /// newer committed changes.
    pub fn remove(&self, csn: &Csn) {
        let mut inner = self.lock();
        inner.changes.remove(csn);
    }

    /// Releases the contiguous committed prefix, in CSN order, handing each
    /// message to `publish` while the tracker is still locked. Two concurrent
    /// drains therefore cannot interleave their batches, and peers see the
    /// stream in CSN order. Releases nothing while a change older than the
    /// head is still in progress, or while recovering. Returns the number of
    /// messages released.
    pub fn drain_committed(&self, mut publish: impl FnMut(UpdateMessage)) -> usize {
        let mut inner = self.lock();
        if inner.recovering {
            return 0;
        }
        let mut released = 0;
        while let Some((&csn, status)) = inner.changes.iter().next() {
            match status {
                PendingStatus::InProgress => break,
                PendingStatus::Committed(_) => {
                    if let Some(PendingStatus::Committed(msg)) = inner.changes.remove(&csn) {
                        publish(msg);
                        released += 1;
                    }
                    inner.max_committed = Some(csn);
                }
            }
        }
        released
    }

    /// Newest CSN released so far; everything at or below it has been
    /// published (or was removed).
    pub fn max_committed_csn(&self) -> Option<Csn> {
        self.lock().max_committed
    }

    /// Number of tracked in-flight changes.
    pub fn len(&self) -> usize {
        self.lock().changes.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens or closes the recovery publication gate.
    pub fn set_recovering(&self, recovering: bool) {
        let mut inner = self.lock();
        debug!(recovering, "local pending tracker recovery gate");
        inner.recovering = recovering;
    }

    /// Called by the recovery scan with the CSN it has republished up to.
    /// Returns true while more scanning is needed; once the scan has passed
    /// the newest allocated CSN the gate closes and normal publication
    /// resumes.
    pub fn recovery_until(&self, csn: &Csn) -> bool {
        let mut inner = self.lock();
        match inner.newest_allocated {
            Some(newest) if newest.is_newer_than(csn) => true,
            _ => {
                inner.recovering = false;
                false
            }
        }
    }
}

impl Default for PendingChanges {
    fn default() -> Self {
        Self::new()
    }
}
