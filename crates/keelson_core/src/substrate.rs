//! The key-value substrate writes are sent to, and how batches are routed.

use crate::error::{CoreError, CoreResult};
use crate::outcome::WriteOutcome;
use crate::types::{PartitionAddress, TransactionId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Insert a new row.
    Insert,
    /// Insert or overwrite.
    Upsert,
    /// Overwrite an existing row.
    Update,
    /// Delete a row.
    Delete,
}

/// One row mutation destined for the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Encoded row key.
    pub row_key: Vec<u8>,
    /// What to do with the row.
    pub kind: MutationKind,
    /// Encoded row value.
    pub payload: Vec<u8>,
    /// Original input text of the row, reported if it is rejected.
    pub source_text: Option<String>,
}

impl Mutation {
    /// Creates a mutation.
    pub fn new(kind: MutationKind, row_key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            row_key: row_key.into(),
            kind,
            payload: payload.into(),
            source_text: None,
        }
    }

    /// Creates an insert.
    pub fn insert(row_key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MutationKind::Insert, row_key, payload)
    }

    /// Creates a delete.
    pub fn delete(row_key: impl Into<Vec<u8>>) -> Self {
        Self::new(MutationKind::Delete, row_key, Vec::new())
    }

    /// Attaches the original input line.
    #[must_use]
    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    /// Returns the text to report for this row: the source text if known,
    /// otherwise the payload decoded lossily.
    pub fn report_text(&self) -> String {
        match &self.source_text {
            Some(text) => text.clone(),
            None => String::from_utf8_lossy(&self.payload).into_owned(),
        }
    }
}

/// The substrate's answer to one batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    /// Outcome applying to every row, when the batch failed as a whole.
    pub global: Option<WriteOutcome>,
    /// Per-row outcomes, in submission order.
    pub outcomes: Vec<WriteOutcome>,
}

impl BatchResponse {
    /// A response with one outcome per row.
    pub fn rows(outcomes: Vec<WriteOutcome>) -> Self {
        Self {
            global: None,
            outcomes,
        }
    }

    /// A response where every row got `outcome`.
    pub fn global(outcome: WriteOutcome) -> Self {
        Self {
            global: Some(outcome),
            outcomes: Vec::new(),
        }
    }

    /// Returns the outcome of row `index`.
    ///
    /// A row the substrate did not report on was not run.
    pub fn outcome_for(&self, index: usize) -> WriteOutcome {
        if let Some(global) = &self.global {
            return global.clone();
        }
        self.outcomes
            .get(index)
            .cloned()
            .unwrap_or_else(|| WriteOutcome::NotRun(Some("no outcome reported".into())))
    }
}

/// Non-transactional key-value store that accepts batch writes.
///
/// Implementations may retry internally; a row reported SUCCESS twice is
/// fine.
pub trait Substrate: Send + Sync {
    /// Writes `mutations` on behalf of `txn` to the partition at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Substrate`] if the call itself failed.
    fn write(
        &self,
        address: &PartitionAddress,
        txn: TransactionId,
        mutations: &[Mutation],
    ) -> CoreResult<BatchResponse>;
}

/// Resolves which partition serves a key.
///
/// Shared by all pipelines. Invalidation marks an entry stale; it never
/// blocks writers.
pub trait PartitionLocator: Send + Sync {
    /// Returns the address of the partition serving `key`.
    ///
    /// # Errors
    ///
    /// Fails if routing cannot be resolved.
    fn locate(&self, key: &[u8]) -> CoreResult<PartitionAddress>;

    /// Forgets the cached route for `key`.
    fn invalidate(&self, key: &[u8]);
}

/// A locator that routes every key to one partition.
///
/// Each invalidation bumps the routing generation, standing in for a move.
#[derive(Debug)]
pub struct StaticLocator {
    partition: String,
    server: String,
    generation: AtomicU64,
    invalidations: AtomicU64,
}

impl StaticLocator {
    /// Creates a locator for `partition` hosted on `server`.
    pub fn new(partition: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            server: server.into(),
            generation: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Returns how many times a route was invalidated.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl Default for StaticLocator {
    fn default() -> Self {
        Self::new("p0", "local")
    }
}

impl PartitionLocator for StaticLocator {
    fn locate(&self, _key: &[u8]) -> CoreResult<PartitionAddress> {
        Ok(PartitionAddress {
            partition: self.partition.clone(),
            server: self.server.clone(),
            generation: self.generation.load(Ordering::SeqCst),
        })
    }

    fn invalidate(&self, _key: &[u8]) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// One recorded call to a [`ScriptedSubstrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Where the batch was sent.
    pub address: PartitionAddress,
    /// Transaction it was written under.
    pub txn: TransactionId,
    /// Row keys, in submission order.
    pub row_keys: Vec<Vec<u8>>,
}

/// A substrate that replays scripted outcomes.
///
/// Each row key has a queue of outcomes consumed one per attempt; once a
/// queue is empty the row succeeds. Whole-call failures and global
/// outcomes can be queued too and take precedence.
#[derive(Debug, Default)]
pub struct ScriptedSubstrate {
    scripts: Mutex<HashMap<Vec<u8>, VecDeque<WriteOutcome>>>,
    call_errors: Mutex<VecDeque<CoreError>>,
    globals: Mutex<VecDeque<WriteOutcome>>,
    calls: Mutex<Vec<RecordedCall>>,
    written: Mutex<HashMap<Vec<u8>, u64>>,
}

impl ScriptedSubstrate {
    /// Creates a substrate on which every row succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for `row_key`, one per attempt.
    pub fn script(&self, row_key: impl Into<Vec<u8>>, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        self.scripts
            .lock()
            .entry(row_key.into())
            .or_default()
            .extend(outcomes);
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next_call(&self, error: CoreError) {
        self.call_errors.lock().push_back(error);
    }

    /// Makes the next call answer `outcome` for every row.
    pub fn answer_next_call(&self, outcome: WriteOutcome) {
        self.globals.lock().push_back(outcome);
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns how many calls included `row_key`.
    pub fn attempts_for(&self, row_key: &[u8]) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.row_keys.iter().any(|k| k == row_key))
            .count()
    }

    /// Returns how many times `row_key` was written successfully.
    pub fn writes_of(&self, row_key: &[u8]) -> u64 {
        self.written.lock().get(row_key).copied().unwrap_or(0)
    }

    /// Returns the number of distinct rows written.
    pub fn distinct_rows_written(&self) -> usize {
        self.written.lock().len()
    }
}

impl Substrate for ScriptedSubstrate {
    fn write(
        &self,
        address: &PartitionAddress,
        txn: TransactionId,
        mutations: &[Mutation],
    ) -> CoreResult<BatchResponse> {
        self.calls.lock().push(RecordedCall {
            address: address.clone(),
            txn,
            row_keys: mutations.iter().map(|m| m.row_key.clone()).collect(),
        });

        if let Some(err) = self.call_errors.lock().pop_front() {
            return Err(err);
        }
        if let Some(outcome) = self.globals.lock().pop_front() {
            if outcome.is_success() {
                let mut written = self.written.lock();
                for m in mutations {
                    *written.entry(m.row_key.clone()).or_default() += 1;
                }
            }
            return Ok(BatchResponse::global(outcome));
        }

        let mut scripts = self.scripts.lock();
        let mut written = self.written.lock();
        let outcomes = mutations
            .iter()
            .map(|m| {
                let outcome = scripts
                    .get_mut(&m.row_key)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(WriteOutcome::Success);
                if outcome.is_success() {
                    *written.entry(m.row_key.clone()).or_default() += 1;
                }
                outcome
            })
            .collect();
        Ok(BatchResponse::rows(outcomes))
    }
}
