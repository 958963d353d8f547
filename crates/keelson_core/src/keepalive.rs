//! Keep-alive renewal of active transactions.
//!
//! A dispatcher thread owns a deadline heap and hands due transactions to a
//! fixed pool of renewal workers over a channel. Registration and shutdown
//! reach the dispatcher through a command channel.
//!
//! Unregistering only removes the id from the live set: the dispatcher
//! stops scheduling it and workers skip it. A renewal already in flight
//! when its transaction finishes is rejected by the store and does nothing.
//! An id holds at most one deadline, so unregistering and registering again
//! before the old deadline fires keeps a single renewal per interval.

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::metrics::TxnMetrics;
use crate::transaction::{duration_millis, Transition, TransitionOutcome, TxnStore};
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Command {
    Register(TransactionId),
    Shutdown,
}

/// Periodically re-stamps `last_keep_alive` on registered transactions.
pub struct KeepAliveScheduler {
    commands: Mutex<Option<Sender<Command>>>,
    registered: Arc<Mutex<HashSet<TransactionId>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    interval: Duration,
}

/// Everything a renewal worker needs.
struct Renewer {
    store: Arc<dyn TxnStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<TxnMetrics>,
    registered: Arc<Mutex<HashSet<TransactionId>>>,
    timeout_ms: u64,
}

impl KeepAliveScheduler {
    /// Starts the dispatcher and `workers` renewal threads.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if a thread cannot be spawned.
    pub fn start(
        store: Arc<dyn TxnStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<TxnMetrics>,
        interval: Duration,
        timeout: Duration,
        workers: usize,
    ) -> CoreResult<Self> {
        if interval.is_zero() {
            return Err(CoreError::invalid_config("keep-alive interval must be positive"));
        }

        let registered = Arc::new(Mutex::new(HashSet::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (work_tx, work_rx) = mpsc::channel();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let mut threads = Vec::with_capacity(workers + 1);

        let dispatch_set = Arc::clone(&registered);
        threads.push(
            thread::Builder::new()
                .name("keelson-keepalive".into())
                .spawn(move || dispatch(&cmd_rx, &work_tx, &dispatch_set, interval))?,
        );

        for i in 0..workers.max(1) {
            let renewer = Renewer {
                store: Arc::clone(&store),
                clock: Arc::clone(&clock),
                metrics: Arc::clone(&metrics),
                registered: Arc::clone(&registered),
                timeout_ms: duration_millis(timeout),
            };
            let work_rx = Arc::clone(&work_rx);
            threads.push(
                thread::Builder::new()
                    .name(format!("keelson-keepalive-{i}"))
                    .spawn(move || renewer.run(&work_rx))?,
            );
        }

        tracing::debug!(?interval, ?timeout, workers, "keep-alive scheduler started");
        Ok(Self {
            commands: Mutex::new(Some(cmd_tx)),
            registered,
            threads: Mutex::new(threads),
            interval,
        })
    }

    /// Starts renewing `id` every interval.
    pub fn register(&self, id: TransactionId) {
        if !self.registered.lock().insert(id) {
            return;
        }
        let sent = self
            .commands
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Register(id)).is_ok());
        if !sent {
            self.registered.lock().remove(&id);
            tracing::warn!(txn = %id, "keep-alive scheduler is shut down, not registering");
        }
    }

    /// Stops renewing `id`.
    pub fn unregister(&self, id: TransactionId) {
        self.registered.lock().remove(&id);
    }

    /// Returns true if `id` is being renewed.
    pub fn is_registered(&self, id: TransactionId) -> bool {
        self.registered.lock().contains(&id)
    }

    /// Returns the number of transactions being renewed.
    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Returns the renewal interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stops all threads and waits for them. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(tx) = self.commands.lock().take() {
            // The dispatcher may already be gone; dropping tx is enough then.
            let _ = tx.send(Command::Shutdown);
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("keep-alive thread panicked");
            }
        }
        self.registered.lock().clear();
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for KeepAliveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveScheduler")
            .field("interval", &self.interval)
            .field("registered", &self.registered_count())
            .finish()
    }
}

/// Pending renewal deadlines, at most one per transaction.
#[derive(Default)]
struct Deadlines {
    heap: BinaryHeap<Reverse<(Instant, TransactionId)>>,
    scheduled: HashSet<TransactionId>,
}

impl Deadlines {
    /// Schedules `id` at `at` unless it already has a deadline.
    fn schedule(&mut self, id: TransactionId, at: Instant) -> bool {
        if !self.scheduled.insert(id) {
            return false;
        }
        self.heap.push(Reverse((at, id)));
        true
    }

    fn wait(&self, now: Instant, idle: Duration) -> Duration {
        self.heap
            .peek()
            .map_or(idle, |Reverse((at, _))| at.saturating_duration_since(now))
    }

    /// Pops every deadline due at `now`. Live ids are returned and
    /// rescheduled one `interval` later; the rest are dropped.
    fn take_due(
        &mut self,
        now: Instant,
        interval: Duration,
        is_live: impl Fn(TransactionId) -> bool,
    ) -> Vec<TransactionId> {
        let mut due = Vec::new();
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if at > now {
                break;
            }
            self.heap.pop();
            if is_live(id) {
                due.push(id);
                self.heap.push(Reverse((now + interval, id)));
            } else {
                self.scheduled.remove(&id);
            }
        }
        due
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.heap.len()
    }
}

fn dispatch(
    commands: &Receiver<Command>,
    work: &Sender<TransactionId>,
    registered: &Mutex<HashSet<TransactionId>>,
    interval: Duration,
) {
    let mut deadlines = Deadlines::default();

    loop {
        match commands.recv_timeout(deadlines.wait(Instant::now(), interval)) {
            Ok(Command::Register(id)) => {
                deadlines.schedule(id, Instant::now() + interval);
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let due = deadlines.take_due(Instant::now(), interval, |id| {
            registered.lock().contains(&id)
        });
        for id in due {
            if work.send(id).is_err() {
                return;
            }
        }
    }
}

impl Renewer {
    fn run(&self, work: &Mutex<Receiver<TransactionId>>) {
        loop {
            let next = work.lock().recv();
            let Ok(id) = next else { break };
            if self.registered.lock().contains(&id) {
                self.renew(id);
            }
        }
    }

    fn renew(&self, id: TransactionId) {
        let transition = Transition::KeepAlive {
            now: self.clock.now_millis(),
            timeout_ms: self.timeout_ms,
        };
        match self.store.transition(id, &transition) {
            Ok(TransitionOutcome::Applied(_)) => self.metrics.record_keep_alive(),
            Ok(TransitionOutcome::Unchanged(_)) => {}
            Ok(TransitionOutcome::Rejected(record)) => {
                self.registered.lock().remove(&id);
                tracing::debug!(txn = %id, state = %record.state, "stopped renewing finished transaction");
            }
            Err(CoreError::TransactionNotFound { .. }) => {
                self.registered.lock().remove(&id);
            }
            Err(err) => {
                self.metrics.record_keep_alive_failure();
                tracing::warn!(txn = %id, error = %err, "keep-alive renewal failed, retrying next tick");
            }
        }
    }
}
