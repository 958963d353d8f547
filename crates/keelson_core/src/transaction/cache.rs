//! Bounded cache of finished transaction records.

use super::TxnRecord;
use crate::types::TransactionId;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache of finished transaction records.
///
/// Finished records never change, so a hit can be served without consulting
/// the store. Active records are never admitted. Entries are evicted in
/// insertion order once the cache is full, and ignored once older than
/// `max_age`.
#[derive(Debug)]
pub struct CompletedTxnCache {
    capacity: usize,
    max_age: Duration,
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TransactionId, (TxnRecord, Instant)>,
    order: VecDeque<TransactionId>,
}

/// Hit and miss counts of a [`CompletedTxnCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through.
    pub misses: u64,
    /// Entries currently held.
    pub entries: usize,
}

impl CompletedTxnCache {
    /// Creates a cache. A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity,
            max_age,
            inner: RwLock::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a finished record.
    pub fn get(&self, id: TransactionId) -> Option<TxnRecord> {
        let found = {
            let inner = self.inner.read();
            inner
                .entries
                .get(&id)
                .filter(|(_, at)| at.elapsed() <= self.max_age)
                .map(|(rec, _)| *rec)
        };
        match found {
            Some(rec) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(rec)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Admits a record. Returns false if it was not admitted.
    pub fn insert(&self, record: TxnRecord) -> bool {
        if self.capacity == 0 || !record.is_finished() {
            return false;
        }

        let mut inner = self.inner.write();
        let now = Instant::now();
        if let Some(entry) = inner.entries.get_mut(&record.id) {
            entry.1 = now;
            return true;
        }

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.entries.insert(record.id, (record, now));
        inner.order.push_back(record.id);
        true
    }

    /// Returns the number of cached records.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Returns hit and miss counts.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
