//! Engine facade.

use crate::bad_records::BadRecordsRecorder;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, WriteOptions};
use crate::error::{CoreError, CoreResult};
use crate::keepalive::KeepAliveScheduler;
use crate::metrics::{TxnMetrics, TxnMetricsSnapshot};
use crate::oracle::{MonotonicOracle, TimestampOracle};
use crate::pipeline::{BatchResult, WritePipeline};
use crate::resolver::{MemoryStamps, ReadResolver, TxnSettler, VersionStamper};
use crate::substrate::{Mutation, PartitionLocator, ScriptedSubstrate, StaticLocator, Substrate};
use crate::transaction::{CacheStats, LogTxnStore, Transaction, TransactionManager, TxnStatus, TxnStore};
use crate::types::{CellLocation, Timestamp, TransactionId};
use crate::visibility::{CellStamp, VisibilityChecker};
use keelson_storage::{MemoryDirectory, SinkDirectory};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// File name of the transaction log inside an engine directory.
pub const TXN_LOG_FILE: &str = "txn.log";

/// External services the engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Source of begin and commit timestamps.
    pub oracle: Arc<dyn TimestampOracle>,
    /// Store batches are written to.
    pub substrate: Arc<dyn Substrate>,
    /// Partition routing.
    pub locator: Arc<dyn PartitionLocator>,
    /// Writes resolved status stamps onto stored versions.
    pub stamper: Arc<dyn VersionStamper>,
    /// Wall clock for keep-alive stamps.
    pub clock: Arc<dyn Clock>,
    /// Status directory bad-record sinks are created in.
    pub status_dir: Arc<dyn SinkDirectory>,
}

impl Collaborators {
    /// Wires the required services; the rest default to in-process ones.
    pub fn new(
        oracle: Arc<dyn TimestampOracle>,
        substrate: Arc<dyn Substrate>,
        locator: Arc<dyn PartitionLocator>,
    ) -> Self {
        Self {
            oracle,
            substrate,
            locator,
            stamper: Arc::new(MemoryStamps::new()),
            clock: Arc::new(SystemClock),
            status_dir: Arc::new(MemoryDirectory::default()),
        }
    }

    /// Fully in-process services, for tests and single-process use.
    pub fn local() -> Self {
        Self::new(
            Arc::new(MonotonicOracle::new()),
            Arc::new(ScriptedSubstrate::new()),
            Arc::new(StaticLocator::default()),
        )
    }

    /// Replaces the version stamper.
    #[must_use]
    pub fn with_stamper(mut self, stamper: Arc<dyn VersionStamper>) -> Self {
        self.stamper = stamper;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the status directory.
    #[must_use]
    pub fn with_status_dir(mut self, status_dir: Arc<dyn SinkDirectory>) -> Self {
        self.status_dir = status_dir;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("status_dir", &self.status_dir)
            .finish_non_exhaustive()
    }
}

/// The main engine handle.
///
/// `Engine` wires the transaction manager, keep-alive scheduler, read
/// resolver and write pipelines to the external services and exposes the
/// consumer-facing operations.
///
/// ```rust,ignore
/// use keelson_core::{Collaborators, Config, Engine, Mutation};
///
/// let engine = Engine::open_in_memory(Config::default(), Collaborators::local())?;
/// let mut txn = engine.begin_transaction()?;
/// engine.submit_write_batch(&mut txn, b"orders", &[Mutation::insert("k1", "v1")], false, 0)?;
/// engine.commit(&mut txn)?;
/// ```
pub struct Engine {
    config: Config,
    manager: Arc<TransactionManager>,
    resolver: Arc<ReadResolver>,
    visibility: VisibilityChecker,
    collaborators: Collaborators,
    metrics: Arc<TxnMetrics>,
    batch_pipelines: Mutex<HashMap<TransactionId, WritePipeline>>,
    is_open: RwLock<bool>,
}

impl Engine {
    /// Opens an engine whose transaction log lives in `dir`.
    ///
    /// Records left ACTIVE by a previous process are not renewed and read
    /// as abandoned once their timeout passes.
    pub fn open(dir: &Path, config: Config, collaborators: Collaborators) -> CoreResult<Self> {
        let store = LogTxnStore::open(&dir.join(TXN_LOG_FILE))?;
        let leftover = store.active_ids();
        if !leftover.is_empty() {
            tracing::info!(count = leftover.len(), "transaction log has unfinished transactions from a previous run");
        }
        Self::open_with_store(Arc::new(store), config, collaborators)
    }

    /// Opens an engine over an in-memory transaction log.
    pub fn open_in_memory(config: Config, collaborators: Collaborators) -> CoreResult<Self> {
        Self::open_with_store(Arc::new(LogTxnStore::in_memory()), config, collaborators)
    }

    /// Opens an engine over an existing transaction store.
    pub fn open_with_store(
        store: Arc<dyn TxnStore>,
        config: Config,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        config.validate()?;
        let metrics = Arc::new(TxnMetrics::new());

        let scheduler = KeepAliveScheduler::start(
            Arc::clone(&store),
            Arc::clone(&collaborators.clock),
            Arc::clone(&metrics),
            config.keep_alive_interval,
            config.transaction_timeout,
            config.keep_alive_workers,
        )?;
        let manager = Arc::new(
            TransactionManager::new(
                store,
                Arc::clone(&collaborators.oracle),
                Arc::clone(&collaborators.clock),
                &config,
                Arc::clone(&metrics),
            )
            .with_keep_alive(scheduler),
        );
        let settler: Arc<dyn TxnSettler> = manager.clone();
        let resolver = Arc::new(ReadResolver::start(
            settler,
            Arc::clone(&collaborators.stamper),
            Arc::clone(&metrics),
            config.resolver_queue_capacity,
            config.resolver_workers,
        )?);
        let visibility = VisibilityChecker::new(Arc::clone(&manager), Some(Arc::clone(&resolver)));

        tracing::debug!("engine opened");
        Ok(Self {
            config,
            manager,
            resolver,
            visibility,
            collaborators,
            metrics,
            batch_pipelines: Mutex::new(HashMap::new()),
            is_open: RwLock::new(true),
        })
    }

    /// Begins a writing transaction.
    pub fn begin_transaction(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        self.manager.begin()
    }

    /// Begins a read-only transaction.
    pub fn begin_read_only(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        self.manager.begin_read_only()
    }

    /// Lets a read-only transaction write.
    pub fn elevate(&self, txn: &mut Transaction) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.elevate(txn)
    }

    /// Commits a transaction.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Timestamp> {
        self.ensure_open()?;
        self.retire_batch_pipeline(txn.id());
        self.manager.commit(txn)
    }

    /// Rolls a transaction back.
    pub fn rollback(&self, txn: &mut Transaction) -> CoreResult<()> {
        self.ensure_open()?;
        self.retire_batch_pipeline(txn.id());
        self.manager.rollback(txn)
    }

    /// Runs `f` in a new transaction.
    ///
    /// Commits if `f` returns `Ok`, rolls back if it returns `Err`.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Engine, &mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.begin_transaction()?;
        match f(self, &mut txn) {
            Ok(value) => {
                self.commit(&mut txn)?;
                Ok(value)
            }
            Err(err) => {
                if txn.is_active() {
                    if let Err(rollback_err) = self.rollback(&mut txn) {
                        tracing::warn!(txn = %txn.id(), error = %rollback_err, "rollback after error failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Returns the effective status of a transaction.
    pub fn status(&self, id: TransactionId) -> CoreResult<TxnStatus> {
        self.ensure_open()?;
        self.manager.status(id)
    }

    /// Returns true if writes of `candidate` are visible to `reader`.
    pub fn is_visible(&self, reader: &Transaction, candidate: TransactionId) -> CoreResult<bool> {
        self.ensure_open()?;
        self.manager.is_visible(reader, candidate)
    }

    /// Returns true if the stored version at `location` is visible to
    /// `reader`, queueing unresolved stamps for resolution.
    pub fn is_visible_version(
        &self,
        reader: &Transaction,
        location: &CellLocation,
        stamp: &CellStamp,
    ) -> CoreResult<bool> {
        self.ensure_open()?;
        self.visibility.is_visible_version(reader, location, stamp)
    }

    /// Creates a write pipeline for one worker.
    ///
    /// Permissive pipelines get a bad-record sink in the status directory,
    /// named after `options.source_name`.
    pub fn write_pipeline(&self, options: WriteOptions) -> CoreResult<WritePipeline> {
        self.ensure_open()?;
        let recorder = if options.permissive {
            let source = options.source_name.as_deref().unwrap_or("batch");
            Some(BadRecordsRecorder::new(
                Arc::clone(&self.collaborators.status_dir),
                source,
                options.tolerance,
            )?)
        } else {
            None
        };
        WritePipeline::new(
            Arc::clone(&self.collaborators.substrate),
            Arc::clone(&self.collaborators.locator),
            self.config.retry.clone(),
            options,
            recorder,
        )
    }

    /// Writes one batch under `txn`.
    ///
    /// Permissive batches of one transaction share a pipeline, so they
    /// share one bad-record sink (`txn-<id>.bad`, created on the first
    /// reject) and the tolerance counts rejects across all of them. The
    /// pipeline is retired on commit, rollback or a fatal outcome; a call
    /// with a different mode or tolerance retires it early and starts a new
    /// one. Strict batches use a single-use pipeline.
    ///
    /// A fatal outcome marks the transaction failed.
    pub fn submit_write_batch(
        &self,
        txn: &mut Transaction,
        partition_key: &[u8],
        mutations: &[Mutation],
        permissive: bool,
        tolerance: i64,
    ) -> CoreResult<BatchResult> {
        self.ensure_open()?;
        let id = txn.id();
        let cached = self.batch_pipelines.lock().remove(&id);
        let mut pipeline = match cached {
            Some(pipeline)
                if permissive
                    && pipeline.options().permissive
                    && pipeline.options().tolerance == tolerance =>
            {
                pipeline
            }
            stale => {
                if let Some(stale) = stale {
                    finish_batch_pipeline(id, stale);
                }
                self.write_pipeline(WriteOptions {
                    permissive,
                    tolerance,
                    source_name: Some(format!("txn-{}", id.as_u64())),
                })?
            }
        };
        let result = pipeline.submit(txn, partition_key, mutations);

        if let Err(CoreError::WriteAborted { .. }) = &result {
            if let Err(err) = self.manager.fail(txn) {
                tracing::warn!(txn = %id, error = %err, "could not mark transaction failed");
            }
        }
        if permissive && txn.is_active() {
            self.batch_pipelines.lock().insert(id, pipeline);
        } else {
            finish_batch_pipeline(id, pipeline);
        }
        result
    }

    fn retire_batch_pipeline(&self, id: TransactionId) {
        let pipeline = self.batch_pipelines.lock().remove(&id);
        if let Some(pipeline) = pipeline {
            finish_batch_pipeline(id, pipeline);
        }
    }

    /// Returns a snapshot of the transaction metrics.
    pub fn metrics(&self) -> TxnMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns completed-transaction cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.manager.cache().stats()
    }

    /// Returns the number of unfinished transactions begun here.
    pub fn active_count(&self) -> usize {
        self.manager.active_count()
    }

    /// Returns the oldest unfinished transaction begun here.
    pub fn oldest_active(&self) -> Option<TransactionId> {
        self.manager.oldest_active()
    }

    /// Returns the transaction manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns true until [`Engine::shutdown`] is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Stops background services. Idempotent.
    pub fn shutdown(&self) {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return;
        }
        for (id, pipeline) in self.batch_pipelines.lock().drain() {
            finish_batch_pipeline(id, pipeline);
        }
        self.manager.shutdown();
        self.resolver.shutdown();
        *is_open = false;
        tracing::debug!("engine shut down");
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::Shutdown)
        }
    }
}

fn finish_batch_pipeline(id: TransactionId, pipeline: WritePipeline) {
    match pipeline.finish() {
        Ok((stats, Some(recorder))) if recorder.number_of_bad_records() > 0 => {
            tracing::debug!(txn = %id, written = stats.written, bad_records = %recorder.summary(), "batch pipeline retired");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(txn = %id, error = %err, "failed to close bad-record sink");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("is_open", &self.is_open())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
