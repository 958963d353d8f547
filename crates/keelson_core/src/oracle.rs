//! Timestamp oracle.

use crate::error::CoreResult;
use crate::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Supplies strictly increasing timestamps.
///
/// In a cluster this is an external, durable sequencer. Timestamps must
/// never be reused, including across restarts.
pub trait TimestampOracle: Send + Sync {
    /// Returns the next timestamp.
    ///
    /// # Errors
    ///
    /// Fails if the sequencer cannot be reached.
    fn next(&self) -> CoreResult<Timestamp>;
}

/// An in-process oracle backed by an atomic counter.
///
/// Suitable for single-process engines and tests. A restart is simulated
/// with [`MonotonicOracle::starting_at`] using a value above every
/// timestamp already handed out.
#[derive(Debug)]
pub struct MonotonicOracle {
    next: AtomicU64,
}

impl MonotonicOracle {
    /// Creates an oracle whose first timestamp is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates an oracle whose first timestamp is `first`.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the timestamp the next call will hand out.
    #[must_use]
    pub fn peek(&self) -> Timestamp {
        Timestamp::new(self.next.load(Ordering::SeqCst))
    }
}

impl Default for MonotonicOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampOracle for MonotonicOracle {
    fn next(&self) -> CoreResult<Timestamp> {
        Ok(Timestamp::new(self.next.fetch_add(1, Ordering::SeqCst)))
    }
}
