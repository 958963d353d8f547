//! # Keelson Core
//!
//! Snapshot-isolation transactions and resilient batch writes on top of a
//! non-transactional, partitioned key-value substrate.
//!
//! This crate provides:
//! - Transaction lifecycle with a persisted record log
//! - A cache of completed transactions for visibility checks
//! - Keep-alive renewal so crashed writers are detected as abandoned
//! - Asynchronous resolution of unresolved version stamps
//! - Write pipelines with retry, backoff and bad-record tolerance
//! - Mergeable write statistics
//!
//! ## Example
//!
//! ```rust,no_run
//! use keelson_core::{Collaborators, Config, Engine, Mutation};
//!
//! let engine = Engine::open_in_memory(Config::default(), Collaborators::local())?;
//! let mut txn = engine.begin_transaction()?;
//! let result = engine.submit_write_batch(
//!     &mut txn,
//!     b"orders",
//!     &[Mutation::insert(b"k1".to_vec(), b"v1".to_vec())],
//!     false,
//!     0,
//! )?;
//! assert_eq!(result.written, 1);
//! engine.commit(&mut txn)?;
//! # Ok::<(), keelson_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bad_records;
mod clock;
mod config;
mod engine;
mod error;
mod keepalive;
mod metrics;
mod oracle;
mod outcome;
mod pipeline;
mod resolver;
mod stats;
mod substrate;
mod transaction;
mod types;
mod visibility;

pub use bad_records::{exceeds, BadRecordSummary, BadRecordsRecorder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RetryConfig, WriteOptions};
pub use engine::{Collaborators, Engine, TXN_LOG_FILE};
pub use error::{CoreError, CoreResult};
pub use keepalive::KeepAliveScheduler;
pub use metrics::{TxnMetrics, TxnMetricsSnapshot};
pub use oracle::{MonotonicOracle, TimestampOracle};
pub use outcome::{ConstraintContext, ConstraintKind, ConstraintViolation, OutcomeCode, WriteOutcome};
pub use pipeline::{BatchResult, PipelineState, WritePipeline};
pub use resolver::{MemoryStamps, ReadResolver, TxnSettler, VersionStamper};
pub use stats::{WriteStats, WriteStatsAggregator};
pub use substrate::{
    BatchResponse, Mutation, MutationKind, PartitionLocator, RecordedCall, ScriptedSubstrate,
    StaticLocator, Substrate,
};
pub use transaction::{
    CacheStats, CompletedTxnCache, FinalStatus, LogTxnStore, Transaction, TransactionManager,
    TransactionState, Transition, TransitionOutcome, TxnRecord, TxnState, TxnStatus, TxnStore,
    RECORD_MAGIC, RECORD_VERSION,
};
pub use types::{CellLocation, PartitionAddress, TableId, Timestamp, TransactionId};
pub use visibility::{CellStamp, VisibilityChecker};
