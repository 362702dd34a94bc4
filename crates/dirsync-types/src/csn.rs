//! Change Sequence Numbers: replica-scoped, clock-based, totally ordered
//! change identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Change Sequence Number: the globally comparable identifier assigned to
/// every change produced by a replica.
///
/// Total order is `(time_ms, seq, server_id)` ascending, which makes CSNs
/// from different replicas comparable without synchronized clocks as long as
/// generators are adjusted with the CSNs they observe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Csn {
    time_ms: u64,
    seq: u32,
    server_id: i32,
}

impl Csn {
    /// Creates a CSN from its three components.
    pub fn new(time_ms: u64, seq: u32, server_id: i32) -> Self {
        Self {
            time_ms,
            seq,
            server_id,
        }
    }

    /// Milliseconds component (wall clock at generation time).
    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    /// Sequence number within the millisecond.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Identifier of the replica that generated this CSN.
    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Returns true if `self` was generated strictly after `other` in the
    /// total order.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }

    /// Returns true if `self` is older than or equal to `other`.
    pub fn is_older_or_equal(&self, other: &Csn) -> bool {
        self <= other
    }

    /// Upper bound of a recovery time slice: the greatest CSN a given replica
    /// could have generated at `time_ms`.
    pub fn window_end(time_ms: u64, server_id: i32) -> Self {
        Self {
            time_ms,
            seq: u32::MAX,
            server_id,
        }
    }

    /// A CSN that compares newer than anything generated at or before
    /// `time_ms`, whatever the replica. Used as the "now" sentinel when
    /// slicing the historical record.
    pub fn upper_bound(time_ms: u64) -> Self {
        Self {
            time_ms,
            seq: u32::MAX,
            server_id: i32::MAX,
        }
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.time_ms, self.seq, self.server_id)
    }
}

/// Error parsing the textual `"<time_ms>:<seq>:<server_id>"` form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid CSN: {input}")]
pub struct CsnParseError {
    /// The rejected input.
    pub input: String,
}

impl FromStr for Csn {
    type Err = CsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CsnParseError {
            input: s.to_string(),
        };
        let mut parts = s.split(':');
        let time_ms = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let seq = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let server_id = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Csn {
            time_ms,
            seq,
            server_id,
        })
    }
}
