//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use keelson_core::{
    ConstraintContext, ConstraintKind, Mutation, OutcomeCode, Timestamp, TxnRecord, TxnState,
    WriteOutcome, WriteStats,
};
use proptest::prelude::*;

/// Strategy for write stats with counters small enough to sum safely.
pub fn write_stats_strategy() -> impl Strategy<Value = WriteStats> {
    (
        prop::array::uniform4(0u64..1_000_000),
        prop::array::uniform4(0u64..1_000_000),
    )
        .prop_map(|(a, b)| WriteStats {
            written: a[0],
            retried: a[1],
            thrown: a[2],
            region_too_busy: a[3],
            partial_rows: b[0],
            partial_retried: b[1],
            partial_ignored: b[2],
            ignored: b[3],
        })
}

/// Strategy for the stats of a group of workers.
pub fn worker_stats_strategy(max_workers: usize) -> impl Strategy<Value = Vec<WriteStats>> {
    prop::collection::vec(write_stats_strategy(), 0..max_workers)
}

/// Strategy for constraint kinds.
pub fn constraint_kind_strategy() -> impl Strategy<Value = ConstraintKind> {
    prop_oneof![
        Just(ConstraintKind::PrimaryKey),
        Just(ConstraintKind::Unique),
        Just(ConstraintKind::ForeignKey),
        Just(ConstraintKind::Check),
        Just(ConstraintKind::NotNull),
    ]
}

/// Strategy for outcome codes the pipeline resubmits.
pub fn retryable_code_strategy() -> impl Strategy<Value = OutcomeCode> {
    prop_oneof![
        Just(OutcomeCode::Partial),
        Just(OutcomeCode::NotRun),
        Just(OutcomeCode::WrongRegion),
        Just(OutcomeCode::NotServingRegion),
        Just(OutcomeCode::RegionTooBusy),
        Just(OutcomeCode::PipelineTooBusy),
    ]
}

/// Strategy for outcome codes that reject a row for good.
pub fn terminal_code_strategy() -> impl Strategy<Value = OutcomeCode> {
    prop_oneof![
        1 => Just(OutcomeCode::IndexNotSetup),
        4 => constraint_kind_strategy().prop_map(OutcomeCode::Constraint),
    ]
}

/// Strategy for every outcome code.
pub fn outcome_code_strategy() -> impl Strategy<Value = OutcomeCode> {
    prop_oneof![
        4 => Just(OutcomeCode::Success),
        3 => retryable_code_strategy(),
        2 => terminal_code_strategy(),
        1 => prop_oneof![Just(OutcomeCode::Interrupted), Just(OutcomeCode::WriteConflict)],
    ]
}

/// Strategy for outcomes with optional messages and constraint context.
pub fn write_outcome_strategy() -> impl Strategy<Value = WriteOutcome> {
    (
        outcome_code_strategy(),
        prop::option::of("[a-z ]{1,20}"),
        prop::option::of("[a-z_]{1,12}"),
    )
        .prop_map(|(code, message, constraint)| {
            let outcome = match (code, constraint) {
                (OutcomeCode::Constraint(kind), Some(name)) => {
                    WriteOutcome::constraint(kind, ConstraintContext::new(name, "t", ["c"]))
                }
                (code, _) => WriteOutcome::from_code(code),
            };
            match message {
                Some(text) => outcome.with_message(text),
                None => outcome,
            }
        })
}

/// Per-row outcome scripts for a non-fatal load.
///
/// Each row gets up to `max_failures` retryable outcomes, optionally
/// followed by a terminal reject. Rows without a reject eventually
/// succeed.
pub fn load_script_strategy(
    rows: std::ops::Range<usize>,
    max_failures: usize,
) -> impl Strategy<Value = Vec<Vec<WriteOutcome>>> {
    let row = (
        prop::collection::vec(retryable_code_strategy(), 0..=max_failures),
        prop::option::weighted(0.2, terminal_code_strategy()),
    )
        .prop_map(|(retries, reject)| {
            retries
                .into_iter()
                .chain(reject)
                .map(WriteOutcome::from_code)
                .collect::<Vec<_>>()
        });
    prop::collection::vec(row, rows)
}

/// Strategy for a batch of inserts with distinct keys.
pub fn mutation_batch_strategy(
    min_rows: usize,
    max_rows: usize,
) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), min_rows..max_rows).prop_map(
        |payloads| {
            payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| Mutation::insert(format!("row-{i:05}").into_bytes(), payload))
                .collect()
        },
    )
}

/// Strategy for bad-record tolerances, including unlimited ones.
pub fn tolerance_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![
        1 => -5i64..0,
        4 => 0i64..20,
    ]
}

/// Strategy for transaction records that satisfy the record invariants.
pub fn txn_record_strategy() -> impl Strategy<Value = TxnRecord> {
    (
        1u64..u64::MAX / 2,
        0u64..1_000_000,
        any::<u64>(),
        any::<bool>(),
        prop_oneof![
            Just(TxnState::Active),
            Just(TxnState::Committed),
            Just(TxnState::RolledBack),
            Just(TxnState::Error),
        ],
    )
        .prop_map(|(begin, commit_gap, keep_alive, read_only, state)| {
            let mut record = TxnRecord::begin(Timestamp::new(begin), keep_alive, read_only);
            record.state = state;
            if state == TxnState::Committed {
                record.commit_ts = Some(Timestamp::new(begin + 1 + commit_gap));
            }
            record
        })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
