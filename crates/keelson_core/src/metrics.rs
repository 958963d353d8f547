//! Transaction-layer metrics.
//!
//! Counters are shared by the transaction manager, the keep-alive scheduler
//! and the read resolver. Write-side counts live in
//! [`WriteStats`](crate::WriteStats) instead, because those are merged
//! across workers rather than shared.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = Engine::open_in_memory(Config::default(), collaborators)?;
//! let txn = engine.begin_transaction()?;
//! engine.commit(&mut txn)?;
//!
//! let m = engine.metrics();
//! println!("committed: {}", m.committed);
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction-layer counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct TxnMetrics {
    // Lifecycle
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    conflicts: AtomicU64,

    // Keep-alive
    keep_alive_renewals: AtomicU64,
    keep_alive_failures: AtomicU64,

    // Status lookups
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // Read resolution
    resolver_submitted: AtomicU64,
    resolver_resolved: AtomicU64,
    resolver_dropped: AtomicU64,
    resolver_failed: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident, $doc:literal) => {
        #[doc = concat!("Records one ", $doc, ".")]
        pub(crate) fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        #[doc = concat!("Returns the number of ", $doc, "s.")]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl TxnMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_begin, begun, begun, "transaction begin");
    counter!(record_commit, committed, committed, "commit");
    counter!(record_rollback, rolled_back, rolled_back, "rollback");
    counter!(record_failure, failed, failed, "failed transaction");
    counter!(record_abandon, abandoned, abandoned, "abandonment write-back");
    counter!(record_conflict, conflicts, conflicts, "conflict");
    counter!(
        record_keep_alive,
        keep_alive_renewals,
        keep_alive_renewals,
        "keep-alive renewal"
    );
    counter!(
        record_keep_alive_failure,
        keep_alive_failures,
        keep_alive_failures,
        "keep-alive failure"
    );
    counter!(record_cache_hit, cache_hits, cache_hits, "status cache hit");
    counter!(record_cache_miss, cache_misses, cache_misses, "status cache miss");
    counter!(
        record_resolver_submit,
        resolver_submitted,
        resolver_submitted,
        "resolver submission"
    );
    counter!(
        record_resolved,
        resolver_resolved,
        resolver_resolved,
        "resolved version stamp"
    );
    counter!(
        record_resolver_drop,
        resolver_dropped,
        resolver_dropped,
        "dropped resolver submission"
    );
    counter!(
        record_resolver_failure,
        resolver_failed,
        resolver_failed,
        "failed resolution"
    );

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> TxnMetricsSnapshot {
        TxnMetricsSnapshot {
            begun: self.begun(),
            committed: self.committed(),
            rolled_back: self.rolled_back(),
            failed: self.failed(),
            abandoned: self.abandoned(),
            conflicts: self.conflicts(),
            keep_alive_renewals: self.keep_alive_renewals(),
            keep_alive_failures: self.keep_alive_failures(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            resolver_submitted: self.resolver_submitted(),
            resolver_resolved: self.resolver_resolved(),
            resolver_dropped: self.resolver_dropped(),
            resolver_failed: self.resolver_failed(),
        }
    }
}

/// A point-in-time copy of [`TxnMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxnMetricsSnapshot {
    /// Transactions begun (including read-only ones).
    pub begun: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back by their owner.
    pub rolled_back: u64,
    /// Transactions marked failed.
    pub failed: u64,
    /// Expired transactions written back as rolled back.
    pub abandoned: u64,
    /// Commit or rollback attempts that hit a finished record.
    pub conflicts: u64,
    /// Successful keep-alive renewals.
    pub keep_alive_renewals: u64,
    /// Keep-alive renewals that hit a store error.
    pub keep_alive_failures: u64,
    /// Status lookups served from the completed-transaction cache.
    pub cache_hits: u64,
    /// Status lookups that went to the store.
    pub cache_misses: u64,
    /// Pairs accepted by the read resolver.
    pub resolver_submitted: u64,
    /// Versions stamped by the read resolver.
    pub resolver_resolved: u64,
    /// Pairs dropped because the resolver queue was full.
    pub resolver_dropped: u64,
    /// Resolutions that failed.
    pub resolver_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = TxnMetrics::new();
        assert_eq!(metrics.snapshot(), TxnMetricsSnapshot::default());
    }

    #[test]
    fn snapshot_reflects_records() {
        let metrics = TxnMetrics::new();
        metrics.record_begin();
        metrics.record_begin();
        metrics.record_commit();
        metrics.record_conflict();
        metrics.record_resolver_drop();

        let snap = metrics.snapshot();
        assert_eq!(snap.begun, 2);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.conflicts, 1);
        assert_eq!(snap.resolver_dropped, 1);
        assert_eq!(snap.rolled_back, 0);
    }
}
