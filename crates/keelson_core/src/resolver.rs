//! Asynchronous read resolution.
//!
//! When a reader finds a version whose writer has finished but whose stamp
//! still says "unresolved", it can hand the pair to the [`ReadResolver`].
//! The resolver settles the writer (writing back abandonment if needed) and
//! stamps the final status onto the version, so later readers skip the
//! transaction lookup.
//!
//! Resolution is best-effort. Submissions are dropped when the queue is
//! full and failures are only logged; a reader that meets an unresolved
//! stamp resolves it itself and gets the same answer.

use crate::error::{CoreError, CoreResult};
use crate::metrics::TxnMetrics;
use crate::transaction::{FinalStatus, TransactionManager};
use crate::types::{CellLocation, TransactionId};
use crate::visibility::CellStamp;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Settles a transaction to its final status.
pub trait TxnSettler: Send + Sync {
    /// Returns the final status of `id`, or `None` while it is live.
    ///
    /// # Errors
    ///
    /// Fails if the transaction record cannot be read or written.
    fn settle(&self, id: TransactionId) -> CoreResult<Option<FinalStatus>>;
}

impl TxnSettler for TransactionManager {
    fn settle(&self, id: TransactionId) -> CoreResult<Option<FinalStatus>> {
        TransactionManager::settle(self, id)
    }
}

/// Rewrites the out-of-band status stamp of a stored version.
///
/// Stamping must be idempotent, must not create a new visible version and
/// must not alter the version's data. Fencing against concurrent compaction
/// is the implementor's concern.
pub trait VersionStamper: Send + Sync {
    /// Records that the version of `location` written by `txn_id` has
    /// final status `status`.
    ///
    /// # Errors
    ///
    /// Fails if the stamp cannot be written.
    fn stamp(&self, location: &CellLocation, txn_id: TransactionId, status: FinalStatus)
        -> CoreResult<()>;
}

/// An in-memory [`VersionStamper`].
#[derive(Debug, Default)]
pub struct MemoryStamps {
    stamps: RwLock<HashMap<(CellLocation, TransactionId), FinalStatus>>,
}

impl MemoryStamps {
    /// Creates an empty stamp table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stamp of the version of `location` written by `txn_id`.
    pub fn cell_stamp(&self, location: &CellLocation, txn_id: TransactionId) -> CellStamp {
        CellStamp {
            txn_id,
            status: self.stamps.read().get(&(location.clone(), txn_id)).copied(),
        }
    }

    /// Returns the number of resolved versions.
    pub fn len(&self) -> usize {
        self.stamps.read().len()
    }

    /// Returns true if nothing has been stamped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VersionStamper for MemoryStamps {
    fn stamp(
        &self,
        location: &CellLocation,
        txn_id: TransactionId,
        status: FinalStatus,
    ) -> CoreResult<()> {
        let mut stamps = self.stamps.write();
        match stamps.get(&(location.clone(), txn_id)) {
            Some(existing) if *existing != status => Err(CoreError::corruption(format!(
                "version {location} of {txn_id} already stamped {existing:?}, refusing {status:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                stamps.insert((location.clone(), txn_id), status);
                Ok(())
            }
        }
    }
}

struct Job {
    location: CellLocation,
    txn_id: TransactionId,
}

/// Bounded background queue of versions awaiting a status stamp.
pub struct ReadResolver {
    queue: Mutex<Option<SyncSender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<TxnMetrics>,
}

impl ReadResolver {
    /// Starts `workers` resolution threads behind a queue of `capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if a thread cannot be spawned.
    pub fn start(
        settler: Arc<dyn TxnSettler>,
        stamper: Arc<dyn VersionStamper>,
        metrics: Arc<TxnMetrics>,
        capacity: usize,
        workers: usize,
    ) -> CoreResult<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let settler = Arc::clone(&settler);
            let stamper = Arc::clone(&stamper);
            let metrics = Arc::clone(&metrics);
            threads.push(
                thread::Builder::new()
                    .name(format!("keelson-resolver-{i}"))
                    .spawn(move || work(&rx, settler.as_ref(), stamper.as_ref(), &metrics))?,
            );
        }

        Ok(Self {
            queue: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
            metrics,
        })
    }

    /// Queues a version for resolution without blocking.
    ///
    /// Returns false if the queue is full or the resolver is stopped.
    pub fn submit(&self, location: CellLocation, txn_id: TransactionId) -> bool {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return false;
        };
        match tx.try_send(Job { location, txn_id }) {
            Ok(()) => {
                self.metrics.record_resolver_submit();
                true
            }
            Err(TrySendError::Full(job)) => {
                self.metrics.record_resolver_drop();
                tracing::debug!(txn = %job.txn_id, location = %job.location, "resolver queue full, dropping");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stops accepting work, drains the queue and joins the workers.
    pub fn shutdown(&self) {
        drop(self.queue.lock().take());
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("resolver thread panicked");
            }
        }
    }
}

impl Drop for ReadResolver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReadResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResolver")
            .field("running", &self.queue.lock().is_some())
            .finish()
    }
}

fn work(
    jobs: &Mutex<Receiver<Job>>,
    settler: &dyn TxnSettler,
    stamper: &dyn VersionStamper,
    metrics: &TxnMetrics,
) {
    loop {
        let next = jobs.lock().recv();
        let Ok(job) = next else { break };

        let result = settler.settle(job.txn_id).and_then(|status| match status {
            Some(status) => stamper
                .stamp(&job.location, job.txn_id, status)
                .map(|()| true),
            None => Ok(false),
        });
        match result {
            Ok(true) => metrics.record_resolved(),
            Ok(false) => {
                tracing::debug!(txn = %job.txn_id, "transaction still live, leaving version unresolved");
            }
            Err(err) => {
                metrics.record_resolver_failure();
                tracing::warn!(txn = %job.txn_id, location = %job.location, error = %err, "read resolution failed");
            }
        }
    }
}
