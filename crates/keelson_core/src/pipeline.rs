//! Resilient batch writes.
//!
//! A [`WritePipeline`] sends a batch of row mutations for one partition and
//! drives each row to a final disposition:
//!
//! - success: counted as written
//! - retryable outcome: resubmitted on the next attempt, after invalidating
//!   routing when the outcome asks for it
//! - terminal reject: fails the batch in strict mode, goes to the
//!   bad-record sink in permissive mode
//! - fatal outcome: aborts the batch at once
//!
//! Attempts are bounded and spaced by capped exponential backoff. Rows
//! still retryable after the last attempt are thrown.

use crate::bad_records::{BadRecordSummary, BadRecordsRecorder};
use crate::config::{RetryConfig, WriteOptions};
use crate::error::{CoreError, CoreResult};
use crate::outcome::WriteOutcome;
use crate::stats::WriteStats;
use crate::substrate::{Mutation, PartitionLocator, Substrate};
use crate::transaction::Transaction;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::thread;

/// Where a pipeline is in processing its current (or last) batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// First attempt in progress.
    Attempting,
    /// Resubmitting retryable rows.
    Retrying,
    /// Every row written.
    Succeeded,
    /// Some rows written, the rest rejected or thrown.
    PartiallySucceeded,
    /// No row written, or a strict-mode reject or tolerance breach.
    Rejected,
    /// A fatal outcome or substrate error stopped the batch.
    Aborted,
}

impl PipelineState {
    /// Returns true for states a batch ends in.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Attempting | Self::Retrying)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Attempting => "ATTEMPTING",
            Self::Retrying => "RETRYING",
            Self::Succeeded => "SUCCEEDED",
            Self::PartiallySucceeded => "PARTIALLY_SUCCEEDED",
            Self::Rejected => "REJECTED",
            Self::Aborted => "ABORTED",
        })
    }
}

/// Result of one batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Final state of the batch.
    pub state: PipelineState,
    /// Rows written.
    pub written: u64,
    /// Counters of this batch alone.
    pub stats: WriteStats,
    /// Final outcome of every row, in input order.
    pub outcomes: Vec<WriteOutcome>,
    /// Bad-record sink of a permissive pipeline, after this batch.
    pub bad_records: Option<BadRecordSummary>,
}

impl BatchResult {
    /// Returns the indices of rows that were not written.
    pub fn failed_rows(&self) -> impl Iterator<Item = (usize, &WriteOutcome)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.is_success())
    }
}

/// Writes batches for one worker, accumulating [`WriteStats`].
///
/// Stats survive errors: [`WritePipeline::stats`] always reflects every
/// row disposition reached so far.
pub struct WritePipeline {
    substrate: Arc<dyn Substrate>,
    locator: Arc<dyn PartitionLocator>,
    retry: RetryConfig,
    options: WriteOptions,
    recorder: Option<BadRecordsRecorder>,
    stats: WriteStats,
    state: PipelineState,
}

impl WritePipeline {
    /// Creates a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] if `options` is permissive but
    /// no recorder is given, or `retry` fails [`RetryConfig::validate`].
    pub fn new(
        substrate: Arc<dyn Substrate>,
        locator: Arc<dyn PartitionLocator>,
        retry: RetryConfig,
        options: WriteOptions,
        recorder: Option<BadRecordsRecorder>,
    ) -> CoreResult<Self> {
        if options.permissive && recorder.is_none() {
            return Err(CoreError::invalid_config(
                "permissive writes need a bad-record recorder",
            ));
        }
        retry.validate()?;
        Ok(Self {
            substrate,
            locator,
            retry,
            options,
            recorder,
            stats: WriteStats::default(),
            state: PipelineState::Succeeded,
        })
    }

    /// Returns the stats of every batch submitted so far.
    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    /// Returns the state of the current or last batch.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Returns the write options.
    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Returns the bad-record recorder of a permissive pipeline.
    pub fn recorder(&self) -> Option<&BadRecordsRecorder> {
        self.recorder.as_ref()
    }

    /// Consumes the pipeline, returning its stats and recorder for merging.
    pub fn finish(mut self) -> CoreResult<(WriteStats, Option<BadRecordsRecorder>)> {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.close()?;
        }
        Ok((self.stats, self.recorder.take()))
    }

    /// Writes `mutations` under `txn` to the partition serving
    /// `partition_key`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::WriteAborted`] on a fatal outcome
    /// - [`CoreError::WriteRejected`] on a terminal reject in strict mode
    /// - [`CoreError::RetriesExhausted`] when rows are thrown in strict mode
    /// - [`CoreError::BadRecordToleranceExceeded`] when permissive rejects
    ///   exceed the tolerance
    /// - [`CoreError::Substrate`] when the substrate call fails for good
    pub fn submit(
        &mut self,
        txn: &Transaction,
        partition_key: &[u8],
        mutations: &[Mutation],
    ) -> CoreResult<BatchResult> {
        if !txn.is_active() {
            return Err(CoreError::invalid_operation("transaction not active"));
        }
        if txn.is_read_only() {
            return Err(CoreError::invalid_operation(
                "read-only transaction cannot write",
            ));
        }

        let mut batch = WriteStats::default();
        let result = self.run(txn, partition_key, mutations, &mut batch);
        self.stats.merge(&batch);
        if result.is_err() && !self.state.is_terminal() {
            self.state = PipelineState::Aborted;
        }
        result
    }

    fn run(
        &mut self,
        txn: &Transaction,
        partition_key: &[u8],
        mutations: &[Mutation],
        batch: &mut WriteStats,
    ) -> CoreResult<BatchResult> {
        let mut finals: Vec<Option<WriteOutcome>> = vec![None; mutations.len()];
        let mut pending: Vec<usize> = (0..mutations.len()).collect();
        let mut attempt = 0u32;

        while !pending.is_empty() && attempt < self.retry.max_attempts {
            if attempt == 0 {
                self.state = PipelineState::Attempting;
            } else {
                self.state = PipelineState::Retrying;
                batch.retried += pending.len() as u64;
                let delay = self.retry.delay_for_attempt(attempt);
                tracing::debug!(txn = %txn.id(), attempt, rows = pending.len(), ?delay, "retrying rows");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            attempt += 1;

            let rows: Cow<'_, [Mutation]> = if pending.len() == mutations.len() {
                Cow::Borrowed(mutations)
            } else {
                Cow::Owned(pending.iter().map(|&i| mutations[i].clone()).collect())
            };
            let address = self.locator.locate(partition_key)?;

            let response = match self.substrate.write(&address, txn.id(), &rows) {
                Ok(response) => response,
                Err(err) if err.is_retryable() => {
                    tracing::debug!(txn = %txn.id(), attempt, %address, error = %err, "substrate call failed, will retry");
                    for &i in &pending {
                        finals[i] = Some(WriteOutcome::NotRun(Some(err.to_string())));
                    }
                    continue;
                }
                Err(err) => {
                    self.state = PipelineState::Aborted;
                    tracing::warn!(txn = %txn.id(), %address, error = %err, "substrate call failed");
                    return Err(err);
                }
            };

            let outcomes: Vec<(usize, WriteOutcome)> = pending
                .iter()
                .enumerate()
                .map(|(pos, &i)| (i, response.outcome_for(pos)))
                .collect();

            if let Some((row, outcome)) = outcomes.iter().find(|(_, o)| o.should_cancel()) {
                self.state = PipelineState::Aborted;
                tracing::warn!(txn = %txn.id(), row, outcome = %outcome, "batch aborted");
                return Err(CoreError::WriteAborted {
                    row: *row,
                    outcome: outcome.clone(),
                });
            }

            let any_success = outcomes.iter().any(|(_, o)| o.is_success());
            let mixed = any_success && outcomes.iter().any(|(_, o)| !o.is_success());
            let mut refresh = false;
            let mut next = Vec::new();

            for (i, outcome) in outcomes {
                if outcome.is_success() {
                    batch.written += 1;
                    if mixed {
                        batch.partial_rows += 1;
                    }
                    finals[i] = Some(outcome);
                } else if outcome.can_retry() {
                    if outcome.code().is_busy() {
                        batch.region_too_busy += 1;
                    }
                    if mixed {
                        batch.partial_retried += 1;
                    }
                    refresh |= outcome.refresh_cache();
                    finals[i] = Some(outcome);
                    next.push(i);
                } else {
                    self.reject(i, &mutations[i], &outcome, mixed, batch)?;
                    finals[i] = Some(outcome);
                }
            }

            if refresh {
                tracing::debug!(%address, "invalidating partition route");
                self.locator.invalidate(partition_key);
            }
            pending = next;
        }

        if !pending.is_empty() {
            batch.thrown += pending.len() as u64;
            let first = pending[0];
            let last_outcome = finals[first]
                .clone()
                .unwrap_or_else(|| WriteOutcome::NotRun(None));
            tracing::info!(txn = %txn.id(), rows = pending.len(), attempts = attempt, outcome = %last_outcome, "retries exhausted");
            if !self.options.permissive {
                self.state = PipelineState::Rejected;
                return Err(CoreError::RetriesExhausted {
                    rows: pending.len(),
                    attempts: attempt,
                    outcome: last_outcome,
                });
            }
        }

        let outcomes: Vec<WriteOutcome> = finals
            .into_iter()
            .map(|o| o.unwrap_or_else(|| WriteOutcome::NotRun(None)))
            .collect();
        let written = batch.written;
        self.state = if written as usize == outcomes.len() {
            PipelineState::Succeeded
        } else if written > 0 {
            PipelineState::PartiallySucceeded
        } else {
            PipelineState::Rejected
        };

        Ok(BatchResult {
            state: self.state,
            written,
            stats: *batch,
            outcomes,
            bad_records: self.recorder.as_ref().map(BadRecordsRecorder::summary),
        })
    }

    /// Handles a terminal reject of row `index`.
    fn reject(
        &mut self,
        index: usize,
        mutation: &Mutation,
        outcome: &WriteOutcome,
        mixed: bool,
        batch: &mut WriteStats,
    ) -> CoreResult<()> {
        let recorder = match self.recorder.as_mut() {
            Some(recorder) if self.options.permissive => recorder,
            _ => {
                self.state = PipelineState::Rejected;
                tracing::info!(row = index, outcome = %outcome, "row rejected");
                return Err(CoreError::WriteRejected {
                    row: index,
                    outcome: outcome.clone(),
                });
            }
        };

        batch.ignored += 1;
        if mixed {
            batch.partial_ignored += 1;
        }
        let exceeded = recorder.record_bad_record(&mutation.report_text(), outcome.code().error_code())?;
        if exceeded {
            self.state = PipelineState::Rejected;
            return Err(recorder.tolerance_error());
        }
        Ok(())
    }
}

impl fmt::Debug for WritePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePipeline")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .field("recorder", &self.recorder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ConstraintContext, ConstraintKind, OutcomeCode};
    use crate::substrate::{ScriptedSubstrate, StaticLocator};
    use crate::transaction::Transaction;
    use crate::types::TransactionId;
    use keelson_storage::MemoryDirectory;

    fn busy() -> WriteOutcome {
        WriteOutcome::from_code(OutcomeCode::RegionTooBusy)
    }

    fn unique() -> WriteOutcome {
        WriteOutcome::constraint(
            ConstraintKind::Unique,
            ConstraintContext::new("orders_uq", "orders", ["order_no"]),
        )
    }

    fn rows(n: usize) -> Vec<Mutation> {
        (0..n)
            .map(|i| {
                Mutation::insert(format!("k{i}").into_bytes(), Vec::new())
                    .with_source_text(format!("{i},item-{i}"))
            })
            .collect()
    }

    fn txn() -> Transaction {
        Transaction::new(TransactionId::new(1), false)
    }

    struct Harness {
        substrate: Arc<ScriptedSubstrate>,
        locator: Arc<StaticLocator>,
        dir: MemoryDirectory,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                substrate: Arc::new(ScriptedSubstrate::new()),
                locator: Arc::new(StaticLocator::default()),
                dir: MemoryDirectory::default(),
            }
        }

        fn strict(&self, attempts: u32) -> WritePipeline {
            WritePipeline::new(
                self.substrate.clone(),
                self.locator.clone(),
                RetryConfig::no_delay(attempts),
                WriteOptions::strict(),
                None,
            )
            .unwrap()
        }

        fn permissive(&self, attempts: u32, tolerance: i64) -> WritePipeline {
            let recorder =
                BadRecordsRecorder::new(Arc::new(self.dir.clone()), "orders.csv", tolerance)
                    .unwrap();
            WritePipeline::new(
                self.substrate.clone(),
                self.locator.clone(),
                RetryConfig::no_delay(attempts),
                WriteOptions::permissive("orders.csv", tolerance),
                Some(recorder),
            )
            .unwrap()
        }
    }

    #[test]
    fn clean_batch_succeeds_in_one_attempt() {
        let h = Harness::new();
        let mut pipeline = h.strict(3);
        let result = pipeline.submit(&txn(), b"k", &rows(4)).unwrap();
        assert_eq!(result.state, PipelineState::Succeeded);
        assert_eq!(result.written, 4);
        assert_eq!(h.substrate.calls().len(), 1);
        assert_eq!(pipeline.stats().retried, 0);
    }

    #[test]
    fn busy_rows_are_retried() {
        let h = Harness::new();
        h.substrate.script(b"k1".to_vec(), [busy(), busy()]);
        let mut pipeline = h.strict(3);

        let result = pipeline.submit(&txn(), b"k", &rows(3)).unwrap();
        assert_eq!(result.written, 3);
        assert_eq!(result.stats.retried, 2);
        assert_eq!(result.stats.region_too_busy, 2);
        assert_eq!(result.stats.partial_rows, 2);
        assert_eq!(result.stats.partial_retried, 1);
        assert_eq!(h.substrate.attempts_for(b"k1"), 3);
        assert_eq!(h.substrate.attempts_for(b"k0"), 1);
    }

    #[test]
    fn wrong_region_invalidates_route() {
        let h = Harness::new();
        h.substrate
            .script(b"k0".to_vec(), [WriteOutcome::from_code(OutcomeCode::WrongRegion)]);
        let mut pipeline = h.strict(3);

        pipeline.submit(&txn(), b"k", &rows(1)).unwrap();
        assert_eq!(h.locator.invalidations(), 1);
        let calls = h.substrate.calls();
        assert_eq!(calls[0].address.generation, 0);
        assert_eq!(calls[1].address.generation, 1);
    }

    #[test]
    fn busy_does_not_invalidate_route() {
        let h = Harness::new();
        h.substrate.script(b"k0".to_vec(), [busy()]);
        h.strict(3).submit(&txn(), b"k", &rows(1)).unwrap();
        assert_eq!(h.locator.invalidations(), 0);
    }

    #[test]
    fn fatal_outcome_aborts_without_retry() {
        let h = Harness::new();
        h.substrate.script(b"k0".to_vec(), [busy()]);
        h.substrate
            .script(b"k2".to_vec(), [WriteOutcome::from_code(OutcomeCode::Interrupted)]);
        let mut pipeline = h.strict(5);

        let err = pipeline.submit(&txn(), b"k", &rows(3)).unwrap_err();
        assert!(matches!(err, CoreError::WriteAborted { row: 2, .. }));
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(h.substrate.calls().len(), 1);
        assert_eq!(pipeline.stats().retried, 0);
    }

    #[test]
    fn strict_reject_carries_constraint_context() {
        let h = Harness::new();
        h.substrate.script(b"k1".to_vec(), [unique()]);
        let mut pipeline = h.strict(3);

        match pipeline.submit(&txn(), b"k", &rows(3)).unwrap_err() {
            CoreError::WriteRejected { row, outcome } => {
                assert_eq!(row, 1);
                let ctx = outcome.constraint_context().unwrap();
                assert_eq!(ctx.constraint, "orders_uq");
            }
            other => panic!("expected reject, got {other}"),
        }
        assert_eq!(pipeline.state(), PipelineState::Rejected);
    }

    #[test]
    fn exhausted_rows_are_thrown_in_strict_mode() {
        let h = Harness::new();
        h.substrate.script(b"k0".to_vec(), vec![busy(); 10]);
        let mut pipeline = h.strict(3);

        match pipeline.submit(&txn(), b"k", &rows(2)).unwrap_err() {
            CoreError::RetriesExhausted {
                rows,
                attempts,
                outcome,
            } => {
                assert_eq!((rows, attempts), (1, 3));
                assert_eq!(outcome.code(), OutcomeCode::RegionTooBusy);
            }
            other => panic!("expected exhaustion, got {other}"),
        }
        let stats = pipeline.stats();
        assert_eq!(stats.thrown, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(stats.retried, 2);
    }

    #[test]
    fn exhausted_rows_are_reported_in_permissive_mode() {
        let h = Harness::new();
        h.substrate.script(b"k1".to_vec(), vec![busy(); 10]);
        let mut pipeline = h.permissive(2, 5);

        let result = pipeline.submit(&txn(), b"k", &rows(3)).unwrap();
        assert_eq!(result.state, PipelineState::PartiallySucceeded);
        assert_eq!(result.stats.thrown, 1);
        assert_eq!(result.outcomes[1].code(), OutcomeCode::RegionTooBusy);
        assert_eq!(result.failed_rows().count(), 1);
    }

    #[test]
    fn permissive_rejects_go_to_sink() {
        let h = Harness::new();
        h.substrate.script(b"k1".to_vec(), [unique()]);
        let mut pipeline = h.permissive(3, 5);

        let result = pipeline.submit(&txn(), b"k", &rows(3)).unwrap();
        assert_eq!(result.state, PipelineState::PartiallySucceeded);
        assert_eq!(result.stats.ignored, 1);
        assert_eq!(result.stats.partial_ignored, 1);
        assert_eq!(result.bad_records.unwrap().count, 1);
        assert_eq!(h.dir.contents("orders.bad").unwrap(), "UNIQUE 1,item-1\n");
    }

    #[test]
    fn tolerance_breach_fails_and_keeps_stats() {
        let h = Harness::new();
        for k in ["k0", "k1", "k2"] {
            h.substrate.script(k.as_bytes().to_vec(), [unique()]);
        }
        let mut pipeline = h.permissive(3, 1);

        let err = pipeline.submit(&txn(), b"k", &rows(4)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::BadRecordToleranceExceeded {
                count: 2,
                tolerance: 1,
                ..
            }
        ));
        assert_eq!(pipeline.stats().ignored, 2);
        assert!(pipeline.recorder().unwrap().is_closed());
    }

    #[test]
    fn retryable_substrate_error_consumes_an_attempt() {
        let h = Harness::new();
        h.substrate
            .fail_next_call(CoreError::substrate_retryable("connection reset"));
        let mut pipeline = h.strict(2);

        let result = pipeline.submit(&txn(), b"k", &rows(2)).unwrap();
        assert_eq!(result.written, 2);
        assert_eq!(result.stats.retried, 2);
        assert_eq!(h.substrate.calls().len(), 2);
    }

    #[test]
    fn fatal_substrate_error_aborts() {
        let h = Harness::new();
        h.substrate.fail_next_call(CoreError::substrate_fatal("table dropped"));
        let mut pipeline = h.strict(5);
        assert!(pipeline.submit(&txn(), b"k", &rows(2)).is_err());
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(h.substrate.calls().len(), 1);
    }

    #[test]
    fn global_busy_retries_every_row() {
        let h = Harness::new();
        h.substrate
            .answer_next_call(WriteOutcome::from_code(OutcomeCode::PipelineTooBusy));
        let result = h.strict(2).submit(&txn(), b"k", &rows(3)).unwrap();
        assert_eq!(result.written, 3);
        assert_eq!(result.stats.region_too_busy, 3);
        assert_eq!(result.stats.partial_retried, 0);
    }

    #[test]
    fn read_only_transactions_cannot_write() {
        let h = Harness::new();
        let ro = Transaction::new(TransactionId::new(1), true);
        assert!(matches!(
            h.strict(1).submit(&ro, b"k", &rows(1)),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn permissive_without_recorder_is_rejected() {
        let h = Harness::new();
        let result = WritePipeline::new(
            h.substrate.clone(),
            h.locator.clone(),
            RetryConfig::no_delay(1),
            WriteOptions::permissive("x.csv", 0),
            None,
        );
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn shrinking_backoff_is_rejected_up_front() {
        let h = Harness::new();
        let result = WritePipeline::new(
            h.substrate.clone(),
            h.locator.clone(),
            RetryConfig::new(5).with_backoff_multiplier(-2.0),
            WriteOptions::strict(),
            None,
        );
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn stats_accumulate_across_batches() {
        let h = Harness::new();
        let mut pipeline = h.strict(2);
        pipeline.submit(&txn(), b"k", &rows(2)).unwrap();
        pipeline.submit(&txn(), b"k", &rows(3)).unwrap();
        assert_eq!(pipeline.stats().written, 5);
        let (stats, recorder) = pipeline.finish().unwrap();
        assert_eq!(stats.written, 5);
        assert!(recorder.is_none());
    }
}
