//! CSN generation with peer-clock adjustment.
//!
//! Each replica runs one generator. New CSNs are strictly increasing for the
//! replica; observing a peer CSN ahead of the local clock pushes the
//! generator forward so nothing it produces afterwards compares older than
//! what it has already seen.

use dirsync_types::Csn;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds, injectable for tests.
pub trait ClockSource: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The default clock backed by [`SystemTime`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Generates CSNs for one replica.
pub struct CsnGenerator {
    server_id: i32,
    clock: Box<dyn ClockSource>,
    // (last issued time_ms, last issued seq)
    last: Mutex<(u64, u32)>,
}

impl CsnGenerator {
    /// Creates a generator for `server_id` on the system clock.
    pub fn new(server_id: i32) -> Self {
        Self::with_clock(server_id, Box::new(SystemClock))
    }

    /// Creates a generator on an explicit clock.
    pub fn with_clock(server_id: i32, clock: Box<dyn ClockSource>) -> Self {
        Self {
            server_id,
            clock,
            last: Mutex::new((0, 0)),
        }
    }

    /// Identifier of the replica this generator issues CSNs for.
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Issues the next CSN. Strictly greater than every CSN previously issued
    /// or adjusted against, even when the wall clock stalls or steps back.
    pub fn next(&self) -> Csn {
        let now = self.clock.now_ms();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if now > last.0 {
            *last = (now, 0);
        } else if last.1 == u32::MAX {
            // Sequence exhausted within the millisecond; borrow the next one.
            *last = (last.0 + 1, 0);
        } else {
            last.1 += 1;
        }
        Csn::new(last.0, last.1, self.server_id)
    }

    /// Adjusts the generator against a CSN observed from a peer, so that
    /// subsequent [`next`](Self::next) calls compare newer than it.
    pub fn adjust(&self, seen: &Csn) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if (seen.time_ms(), seen.seq()) > *last {
            *last = (seen.time_ms(), seen.seq());
        }
    }
}
