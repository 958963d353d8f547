//! Transaction manager.

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::keepalive::KeepAliveScheduler;
use crate::metrics::TxnMetrics;
use crate::oracle::TimestampOracle;
use crate::transaction::cache::CompletedTxnCache;
use crate::transaction::record::{
    FinalStatus, Transition, TransitionOutcome, TxnRecord, TxnState, TxnStatus,
};
use crate::transaction::state::{Transaction, TransactionState};
use crate::transaction::store::TxnStore;
use crate::types::{Timestamp, TransactionId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Manages snapshot-isolation transactions.
///
/// The transaction manager provides:
/// - Timestamp assignment through the [`TimestampOracle`]
/// - Durable state transitions through the [`TxnStore`]
/// - Keep-alive registration for writing transactions
/// - Visibility decisions for the read path
///
/// ## Abandonment
///
/// A transaction whose record was not renewed within the transaction
/// timeout is treated as rolled back by every reader, whether or not the
/// rollback has been written back. [`TransactionManager::settle`] performs
/// that write-back.
pub struct TransactionManager {
    store: Arc<dyn TxnStore>,
    oracle: Arc<dyn TimestampOracle>,
    clock: Arc<dyn Clock>,
    cache: CompletedTxnCache,
    metrics: Arc<TxnMetrics>,
    keep_alive: Option<KeepAliveScheduler>,
    /// Keep-alive timeout in milliseconds.
    timeout_ms: u64,
    /// Transactions begun through this manager and not yet finished.
    active: Mutex<BTreeSet<TransactionId>>,
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TransactionManager {
    /// Creates a transaction manager without a keep-alive scheduler.
    pub fn new(
        store: Arc<dyn TxnStore>,
        oracle: Arc<dyn TimestampOracle>,
        clock: Arc<dyn Clock>,
        config: &Config,
        metrics: Arc<TxnMetrics>,
    ) -> Self {
        Self {
            store,
            oracle,
            clock,
            cache: CompletedTxnCache::new(config.cache_capacity, config.cache_max_age),
            metrics,
            keep_alive: None,
            timeout_ms: duration_millis(config.transaction_timeout),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Attaches the scheduler that renews this manager's transactions.
    #[must_use]
    pub fn with_keep_alive(mut self, scheduler: KeepAliveScheduler) -> Self {
        self.keep_alive = Some(scheduler);
        self
    }

    /// Returns the keep-alive scheduler, if one is attached.
    pub fn keep_alive(&self) -> Option<&KeepAliveScheduler> {
        self.keep_alive.as_ref()
    }

    /// Returns the completed-transaction cache.
    pub fn cache(&self) -> &CompletedTxnCache {
        &self.cache
    }

    /// Returns the keep-alive timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Begins a writing transaction.
    ///
    /// The ACTIVE record is persisted before the handle is returned.
    pub fn begin(&self) -> CoreResult<Transaction> {
        let begin_ts = self.oracle.next()?;
        let record = TxnRecord::begin(begin_ts, self.clock.now_millis(), false);
        self.store.create(record)?;

        self.track(record.id);
        self.metrics.record_begin();
        tracing::debug!(txn = %record.id, "transaction begun");
        Ok(Transaction::new(record.id, false))
    }

    /// Begins a read-only transaction.
    ///
    /// Nothing is persisted until the transaction is elevated.
    pub fn begin_read_only(&self) -> CoreResult<Transaction> {
        let begin_ts = self.oracle.next()?;
        let id = TransactionId::from_begin(begin_ts);
        self.active.lock().insert(id);
        self.metrics.record_begin();
        tracing::debug!(txn = %id, "read-only transaction begun");
        Ok(Transaction::new(id, true))
    }

    /// Turns a read-only transaction into a writing one.
    ///
    /// No-op for transactions that can already write.
    pub fn elevate(&self, txn: &mut Transaction) -> CoreResult<()> {
        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }
        if txn.is_persisted() {
            return Ok(());
        }

        let record = TxnRecord::begin(txn.snapshot(), self.clock.now_millis(), true);
        self.store.create(record)?;
        txn.mark_elevated();
        self.track(record.id);
        tracing::debug!(txn = %record.id, "transaction elevated");
        Ok(())
    }

    /// Commits a transaction and returns its commit timestamp.
    ///
    /// Fails with [`CoreError::Conflict`] if the record is no longer ACTIVE,
    /// including when it has expired. A read-only transaction commits
    /// trivially at its begin timestamp.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Timestamp> {
        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }

        let id = txn.id();
        if !txn.is_persisted() {
            let ts = txn.snapshot();
            txn.mark_committed(ts);
            self.untrack(id);
            self.metrics.record_commit();
            return Ok(ts);
        }

        let commit_ts = self.oracle.next()?;
        let transition = Transition::Commit {
            commit_ts,
            now: self.clock.now_millis(),
            timeout_ms: self.timeout_ms,
        };

        match self.store.transition(id, &transition)? {
            TransitionOutcome::Applied(record) => {
                self.untrack(id);
                self.cache.insert(record);
                txn.mark_committed(commit_ts);
                self.metrics.record_commit();
                tracing::debug!(txn = %id, commit_ts = %commit_ts, "transaction committed");
                Ok(commit_ts)
            }
            TransitionOutcome::Unchanged(record) | TransitionOutcome::Rejected(record) => {
                self.untrack(id);
                self.cache.insert(record);
                txn.mark_aborted();
                self.metrics.record_conflict();
                tracing::debug!(txn = %id, state = %record.state, "commit conflict");
                Err(CoreError::conflict(id, record.state))
            }
        }
    }

    /// Rolls a transaction back.
    ///
    /// Idempotent when the record is already ROLLED_BACK. Fails with
    /// [`CoreError::Conflict`] when it is COMMITTED or ERROR.
    pub fn rollback(&self, txn: &mut Transaction) -> CoreResult<()> {
        match txn.state() {
            TransactionState::Aborted => return Ok(()),
            TransactionState::Committed => {
                return Err(CoreError::conflict(txn.id(), TxnState::Committed))
            }
            TransactionState::Active => {}
        }

        let id = txn.id();
        if !txn.is_persisted() {
            txn.mark_aborted();
            self.untrack(id);
            return Ok(());
        }

        let outcome = self.store.transition(id, &Transition::Rollback)?;
        self.untrack(id);
        self.cache.insert(*outcome.record());
        txn.mark_aborted();

        match outcome {
            TransitionOutcome::Applied(_) => {
                self.metrics.record_rollback();
                tracing::debug!(txn = %id, "transaction rolled back");
                Ok(())
            }
            TransitionOutcome::Unchanged(_) => Ok(()),
            TransitionOutcome::Rejected(record) => {
                self.metrics.record_conflict();
                Err(CoreError::conflict(id, record.state))
            }
        }
    }

    /// Marks a transaction as failed after a fatal write error.
    pub fn fail(&self, txn: &mut Transaction) -> CoreResult<()> {
        if !txn.is_active() {
            return Ok(());
        }

        let id = txn.id();
        if !txn.is_persisted() {
            txn.mark_aborted();
            self.untrack(id);
            return Ok(());
        }

        let outcome = self.store.transition(id, &Transition::Fail)?;
        self.untrack(id);
        self.cache.insert(*outcome.record());
        txn.mark_aborted();

        if let TransitionOutcome::Applied(_) = outcome {
            self.metrics.record_failure();
            tracing::debug!(txn = %id, "transaction failed");
        }
        Ok(())
    }

    /// Returns the effective status of a transaction.
    ///
    /// Finished records are served from the cache when possible. An ACTIVE
    /// record past its keep-alive deadline is reported as
    /// [`TxnStatus::Abandoned`].
    pub fn status(&self, id: TransactionId) -> CoreResult<TxnStatus> {
        Ok(self.lookup(id)?.status(self.clock.now_millis(), self.timeout_ms))
    }

    fn lookup(&self, id: TransactionId) -> CoreResult<TxnRecord> {
        if let Some(record) = self.cache.get(id) {
            self.metrics.record_cache_hit();
            return Ok(record);
        }
        self.metrics.record_cache_miss();

        let record = self
            .store
            .get(id)?
            .ok_or(CoreError::TransactionNotFound { txn_id: id })?;
        if record.is_finished() {
            self.cache.insert(record);
        }
        Ok(record)
    }

    /// Returns true if writes of `candidate` are visible to `reader`.
    ///
    /// A reader sees its own writes, and the writes of any transaction that
    /// committed at or before its snapshot.
    pub fn is_visible(&self, reader: &Transaction, candidate: TransactionId) -> CoreResult<bool> {
        self.is_visible_at(reader.snapshot(), Some(reader.id()), candidate)
    }

    /// Like [`TransactionManager::is_visible`] for a bare snapshot timestamp.
    pub fn is_visible_at(
        &self,
        snapshot: Timestamp,
        own: Option<TransactionId>,
        candidate: TransactionId,
    ) -> CoreResult<bool> {
        if own == Some(candidate) {
            return Ok(true);
        }
        // Began at or after the snapshot, so it cannot have committed before it.
        if candidate.begin_timestamp() >= snapshot {
            return Ok(false);
        }
        Ok(matches!(
            self.status(candidate)?,
            TxnStatus::Committed(commit_ts) if commit_ts <= snapshot
        ))
    }

    /// Resolves a transaction to its final status, writing back abandonment.
    ///
    /// Returns `None` while the transaction is still live.
    pub fn settle(&self, id: TransactionId) -> CoreResult<Option<FinalStatus>> {
        let now = self.clock.now_millis();
        let record = self.lookup(id)?;
        let status = record.status(now, self.timeout_ms);
        if status != TxnStatus::Abandoned {
            return Ok(status.final_status());
        }

        let outcome = self.store.transition(
            id,
            &Transition::Abandon {
                now,
                timeout_ms: self.timeout_ms,
            },
        )?;
        let settled = *outcome.record();
        if let TransitionOutcome::Applied(_) = outcome {
            self.metrics.record_abandon();
            self.untrack(id);
            tracing::debug!(txn = %id, "abandoned transaction rolled back");
        }
        self.cache.insert(settled);
        Ok(settled.status(now, self.timeout_ms).final_status())
    }

    /// Returns the number of transactions begun here and not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Returns the oldest unfinished transaction begun here.
    ///
    /// Versions committed before its snapshot and superseded since are no
    /// longer needed by any local reader.
    pub fn oldest_active(&self) -> Option<TransactionId> {
        self.active.lock().first().copied()
    }

    /// Stops the keep-alive scheduler, if any.
    pub fn shutdown(&self) {
        if let Some(scheduler) = &self.keep_alive {
            scheduler.shutdown();
        }
    }

    fn track(&self, id: TransactionId) {
        self.active.lock().insert(id);
        if let Some(scheduler) = &self.keep_alive {
            scheduler.register(id);
        }
    }

    fn untrack(&self, id: TransactionId) {
        self.active.lock().remove(&id);
        if let Some(scheduler) = &self.keep_alive {
            scheduler.unregister(id);
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("timeout_ms", &self.timeout_ms)
            .field("active", &self.active_count())
            .field("keep_alive", &self.keep_alive.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::oracle::MonotonicOracle;
    use crate::transaction::store::LogTxnStore;

    const TIMEOUT_MS: u64 = 1_000;

    struct Fixture {
        manager: TransactionManager,
        store: Arc<LogTxnStore>,
        clock: Arc<ManualClock>,
        metrics: Arc<TxnMetrics>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LogTxnStore::in_memory());
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Arc::new(TxnMetrics::new());
        let config = Config::new()
            .keep_alive_interval(Duration::from_millis(100))
            .transaction_timeout(Duration::from_millis(TIMEOUT_MS));
        let manager = TransactionManager::new(
            store.clone(),
            Arc::new(MonotonicOracle::new()),
            clock.clone(),
            &config,
            metrics.clone(),
        );
        Fixture {
            manager,
            store,
            clock,
            metrics,
        }
    }

    #[test]
    fn begin_persists_active_record() {
        let f = fixture();
        let txn = f.manager.begin().unwrap();
        let rec = f.store.get(txn.id()).unwrap().unwrap();
        assert_eq!(rec.state, TxnState::Active);
        assert_eq!(rec.last_keep_alive, 10_000);
        assert_eq!(f.manager.active_count(), 1);
        assert_eq!(f.manager.status(txn.id()).unwrap(), TxnStatus::Active);
    }

    #[test]
    fn commit_assigns_later_timestamp() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        let commit_ts = f.manager.commit(&mut txn).unwrap();
        assert!(commit_ts > txn.snapshot());
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(
            f.manager.status(txn.id()).unwrap(),
            TxnStatus::Committed(commit_ts)
        );
        assert_eq!(f.manager.active_count(), 0);
    }

    #[test]
    fn commit_after_rollback_is_conflict() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        f.store.transition(txn.id(), &Transition::Rollback).unwrap();

        let err = f.manager.commit(&mut txn).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                state: TxnState::RolledBack,
                ..
            }
        ));
        assert_eq!(f.metrics.conflicts(), 1);
    }

    #[test]
    fn commit_after_expiry_is_conflict() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        f.clock.advance(TIMEOUT_MS + 1);
        assert!(f.manager.commit(&mut txn).is_err());
        assert_eq!(
            f.store.get(txn.id()).unwrap().unwrap().state,
            TxnState::RolledBack
        );
    }

    #[test]
    fn rollback_is_idempotent() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        f.manager.rollback(&mut txn).unwrap();
        f.manager.rollback(&mut txn).unwrap();
        assert_eq!(f.metrics.rolled_back(), 1);
        assert_eq!(f.manager.status(txn.id()).unwrap(), TxnStatus::RolledBack);
    }

    #[test]
    fn rollback_of_committed_is_conflict() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        f.manager.commit(&mut txn).unwrap();
        assert!(matches!(
            f.manager.rollback(&mut txn),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn fail_marks_error() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        f.manager.fail(&mut txn).unwrap();
        assert_eq!(f.manager.status(txn.id()).unwrap(), TxnStatus::Error);
        assert!(!txn.is_active());
    }

    #[test]
    fn visibility_follows_commit_timestamps() {
        let f = fixture();
        let mut a = f.manager.begin().unwrap();
        f.manager.commit(&mut a).unwrap();
        let between = f.manager.begin_read_only().unwrap();
        let mut b = f.manager.begin().unwrap();
        f.manager.commit(&mut b).unwrap();
        let after = f.manager.begin_read_only().unwrap();

        assert!(f.manager.is_visible(&between, a.id()).unwrap());
        assert!(!f.manager.is_visible(&between, b.id()).unwrap());
        assert!(f.manager.is_visible(&after, a.id()).unwrap());
        assert!(f.manager.is_visible(&after, b.id()).unwrap());
    }

    #[test]
    fn own_writes_are_visible() {
        let f = fixture();
        let txn = f.manager.begin().unwrap();
        assert!(f.manager.is_visible(&txn, txn.id()).unwrap());
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let f = fixture();
        let writer = f.manager.begin().unwrap();
        let reader = f.manager.begin_read_only().unwrap();
        assert!(!f.manager.is_visible(&reader, writer.id()).unwrap());
    }

    #[test]
    fn expired_transaction_reads_as_abandoned() {
        let f = fixture();
        let txn = f.manager.begin().unwrap();
        f.clock.advance(TIMEOUT_MS + 1);
        assert_eq!(f.manager.status(txn.id()).unwrap(), TxnStatus::Abandoned);
        // Nothing written back yet.
        assert_eq!(
            f.store.get(txn.id()).unwrap().unwrap().state,
            TxnState::Active
        );
    }

    #[test]
    fn settle_writes_back_abandonment() {
        let f = fixture();
        let txn = f.manager.begin().unwrap();
        assert_eq!(f.manager.settle(txn.id()).unwrap(), None);

        f.clock.advance(TIMEOUT_MS + 1);
        assert_eq!(
            f.manager.settle(txn.id()).unwrap(),
            Some(FinalStatus::RolledBack)
        );
        assert_eq!(
            f.store.get(txn.id()).unwrap().unwrap().state,
            TxnState::RolledBack
        );
        assert_eq!(f.metrics.abandoned(), 1);
        assert_eq!(f.manager.active_count(), 0);
    }

    #[test]
    fn finished_records_are_cached() {
        let f = fixture();
        let mut txn = f.manager.begin().unwrap();
        f.manager.commit(&mut txn).unwrap();
        f.manager.status(txn.id()).unwrap();
        f.manager.status(txn.id()).unwrap();
        assert!(f.metrics.cache_hits() >= 2);
    }

    #[test]
    fn active_records_are_not_cached() {
        let f = fixture();
        let txn = f.manager.begin().unwrap();
        f.manager.status(txn.id()).unwrap();
        f.manager.status(txn.id()).unwrap();
        assert_eq!(f.metrics.cache_hits(), 0);
        assert!(f.manager.cache().is_empty());
    }

    #[test]
    fn read_only_commit_is_trivial() {
        let f = fixture();
        let mut txn = f.manager.begin_read_only().unwrap();
        assert_eq!(f.manager.commit(&mut txn).unwrap(), txn.snapshot());
        assert!(f.store.is_empty());
    }

    #[test]
    fn elevation_persists_record() {
        let f = fixture();
        let mut txn = f.manager.begin_read_only().unwrap();
        f.manager.elevate(&mut txn).unwrap();
        let rec = f.store.get(txn.id()).unwrap().unwrap();
        assert!(rec.read_only);
        assert_eq!(rec.state, TxnState::Active);
        f.manager.commit(&mut txn).unwrap();
    }

    #[test]
    fn oldest_active_is_low_watermark() {
        let f = fixture();
        let mut first = f.manager.begin().unwrap();
        let second = f.manager.begin().unwrap();
        assert_eq!(f.manager.oldest_active(), Some(first.id()));
        f.manager.commit(&mut first).unwrap();
        assert_eq!(f.manager.oldest_active(), Some(second.id()));
    }

    #[test]
    fn unknown_transaction_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.manager.status(TransactionId::new(77)),
            Err(CoreError::TransactionNotFound { .. })
        ));
    }
}
