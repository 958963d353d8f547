//! Snapshot-isolation transactions.
//!
//! Keelson layers transactions over a substrate that has none:
//! - **Snapshots**: a transaction reads as of its begin timestamp
//! - **Commit order**: visibility is defined purely by commit timestamps
//! - **Durable state**: one record per transaction, changed only through
//!   atomic [`Transition`]s on the [`TxnStore`]
//! - **Liveness**: records are kept alive by periodic renewal; an expired
//!   record counts as rolled back

mod cache;
mod manager;
mod record;
mod state;
mod store;

pub(crate) use manager::duration_millis;

pub use cache::{CacheStats, CompletedTxnCache};
pub use manager::TransactionManager;
pub use record::{
    FinalStatus, Transition, TransitionOutcome, TxnRecord, TxnState, TxnStatus, RECORD_MAGIC,
    RECORD_VERSION,
};
pub use state::{Transaction, TransactionState};
pub use store::{LogTxnStore, TxnStore};
