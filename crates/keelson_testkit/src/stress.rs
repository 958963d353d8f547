//! Stress helpers for concurrent use of the engine.
//!
//! These helpers drive many threads through the same engine and return
//! what happened, leaving the assertions to the caller.

use crate::fixtures::TestEngine;
use keelson_core::{
    BadRecordSummary, BadRecordsRecorder, CoreError, CoreResult, Engine, FinalStatus, Mutation,
    TransactionId, WriteOptions, WritePipeline, WriteStats, WriteStatsAggregator,
};
use keelson_storage::SinkDirectory;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions per thread.
    pub transactions: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Rows written per transaction.
    pub rows_per_batch: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            transactions: 50,
            threads: 4,
            rows_per_batch: 8,
        }
    }
}

/// Runs write transactions from several threads at once.
///
/// Each transaction writes one strict batch and commits.
pub fn stress_write_transactions(engine: &Engine, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let results: Vec<(usize, usize)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|worker| {
                scope.spawn(move || {
                    let mut ok = 0usize;
                    let mut failed = 0usize;
                    for n in 0..config.transactions {
                        let rows: Vec<_> = (0..config.rows_per_batch)
                            .map(|i| {
                                Mutation::insert(
                                    format!("w{worker}-t{n}-r{i}").into_bytes(),
                                    b"v".to_vec(),
                                )
                            })
                            .collect();
                        let outcome = engine.transaction(|engine, txn| {
                            engine.submit_write_batch(txn, b"stress", &rows, false, 0)
                        });
                        match outcome {
                            Ok(_) => ok += 1,
                            Err(_) => failed += 1,
                        }
                    }
                    (ok, failed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or((0, config.transactions)))
            .collect()
    });

    let (ok, failed) = results
        .into_iter()
        .fold((0, 0), |(a, b), (x, y)| (a + x, b + y));
    StressTestResult::new(ok, failed, start.elapsed())
}

/// Settles the same transaction from `threads` threads at once.
///
/// Returns what each settler observed.
pub fn race_settlers(
    engine: &Engine,
    id: TransactionId,
    threads: usize,
) -> Vec<CoreResult<Option<FinalStatus>>> {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| scope.spawn(move || engine.manager().settle(id)))
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .collect()
    })
}

/// Outcome of a multi-worker permissive load.
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Stats merged across workers.
    pub stats: WriteStats,
    /// Number of worker stats merged.
    pub workers: usize,
    /// Coordinator view of the bad-record sink.
    pub bad_records: BadRecordSummary,
    /// Physical sink files of the workers.
    pub worker_files: Vec<String>,
    /// Errors of workers that stopped early, rendered.
    pub errors: Vec<String>,
}

struct WorkerRun {
    stats: WriteStats,
    recorder: Option<BadRecordsRecorder>,
    error: Option<CoreError>,
}

/// Loads `rows_per_worker` rows from each of `workers` threads under one
/// transaction per worker, then merges stats and bad-record counts the
/// way a coordinator would.
///
/// Row keys are `w<worker>-row-<i>`, so outcomes can be scripted per row.
/// A worker whose batch fails rolls back and still contributes its stats.
pub fn parallel_load(
    t: &TestEngine,
    source_name: &str,
    workers: usize,
    rows_per_worker: usize,
    tolerance: i64,
) -> CoreResult<LoadReport> {
    let directory: Arc<dyn SinkDirectory> = Arc::new(t.status_dir.clone());
    let mut coordinator = BadRecordsRecorder::new(directory, source_name, tolerance)?;
    let worker_recorders = (0..workers)
        .map(|w| coordinator.for_worker(w))
        .collect::<CoreResult<Vec<_>>>()?;

    let runs: Vec<CoreResult<WorkerRun>> = thread::scope(|scope| {
        let handles: Vec<_> = worker_recorders
            .into_iter()
            .enumerate()
            .map(|(w, recorder)| {
                let options = WriteOptions::permissive(source_name, tolerance);
                scope.spawn(move || load_worker(t, w, rows_per_worker, options, recorder))
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    });

    let mut aggregator = WriteStatsAggregator::new();
    let mut worker_files = Vec::new();
    let mut errors = Vec::new();
    for run in runs {
        let run = run?;
        aggregator.add(&run.stats);
        if let Some(recorder) = run.recorder {
            coordinator.merge(&recorder);
            worker_files.push(recorder.physical_file_name());
        }
        if let Some(err) = run.error {
            errors.push(err.to_string());
        }
    }

    Ok(LoadReport {
        workers: aggregator.contributions(),
        stats: aggregator.finish(),
        bad_records: coordinator.summary(),
        worker_files,
        errors,
    })
}

fn load_worker(
    t: &TestEngine,
    worker: usize,
    rows: usize,
    options: WriteOptions,
    recorder: BadRecordsRecorder,
) -> CoreResult<WorkerRun> {
    let mut txn = t.begin_transaction()?;
    let mut pipeline = WritePipeline::new(
        t.substrate.clone(),
        t.locator.clone(),
        t.config().retry.clone(),
        options,
        Some(recorder),
    )?;
    let batch: Vec<_> = (0..rows)
        .map(|i| {
            Mutation::insert(format!("w{worker}-row-{i}").into_bytes(), b"v".to_vec())
                .with_source_text(format!("{worker},{i}"))
        })
        .collect();

    let error = match pipeline.submit(&txn, b"load", &batch) {
        Ok(_) => {
            t.commit(&mut txn)?;
            None
        }
        Err(err) => {
            tracing::debug!(worker, error = %err, "load worker stopped");
            t.rollback(&mut txn)?;
            Some(err)
        }
    };
    let (stats, recorder) = pipeline.finish()?;
    Ok(WorkerRun {
        stats,
        recorder,
        error,
    })
}
