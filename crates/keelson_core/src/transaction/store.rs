//! Durable store of transaction records.

use super::record::{parse_header, verify_checksum, HEADER_LEN, TRAILER_LEN};
use super::{Transition, TransitionOutcome, TxnRecord};
use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use keelson_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// Durable, atomically updatable table of transaction records.
///
/// `transition` is the only way to change an existing record. It must read
/// the current image, apply the transition and persist the result as one
/// atomic step, so that concurrent finalizers observe a single winner.
pub trait TxnStore: Send + Sync {
    /// Persists a brand-new record.
    ///
    /// # Errors
    ///
    /// Fails if a record with the same id exists or the write fails.
    fn create(&self, record: TxnRecord) -> CoreResult<()>;

    /// Reads the current record, if any.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    fn get(&self, id: TransactionId) -> CoreResult<Option<TxnRecord>>;

    /// Applies `transition` to the record atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if there is no record, or
    /// a storage error if the new image cannot be persisted.
    fn transition(&self, id: TransactionId, transition: &Transition)
        -> CoreResult<TransitionOutcome>;
}

/// A [`TxnStore`] that appends every record image to a log.
///
/// The latest image per id is kept in memory. On open the log is replayed;
/// a torn or corrupt tail is truncated away.
pub struct LogTxnStore {
    inner: Mutex<Inner>,
}

struct Inner {
    log: Box<dyn StorageBackend>,
    records: HashMap<TransactionId, TxnRecord>,
}

impl LogTxnStore {
    /// Creates a store over an empty in-memory log.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                log: Box::new(InMemoryBackend::new()),
                records: HashMap::new(),
            }),
        }
    }

    /// Opens (or creates) a store backed by the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or replayed.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::with_backend(Box::new(backend))
    }

    /// Opens a store over an existing backend, replaying its contents.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot be read or truncated.
    pub fn with_backend(mut log: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let records = replay(log.as_mut())?;
        tracing::debug!(records = records.len(), "replayed transaction log");
        Ok(Self {
            inner: Mutex::new(Inner { log, records }),
        })
    }

    /// Returns the number of known transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if no transactions are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the ids of records stored as ACTIVE.
    pub fn active_ids(&self) -> Vec<TransactionId> {
        let inner = self.inner.lock();
        let mut ids: Vec<_> = inner
            .records
            .values()
            .filter(|r| !r.is_finished())
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }

    /// Returns the size of the underlying log in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot report its size.
    pub fn log_size(&self) -> CoreResult<u64> {
        Ok(self.inner.lock().log.size()?)
    }
}

impl Inner {
    fn persist(&mut self, record: &TxnRecord) -> CoreResult<()> {
        self.log.append(&record.encode())?;
        self.log.flush()?;
        if record.is_finished() {
            self.log.sync()?;
        }
        self.records.insert(record.id, *record);
        Ok(())
    }
}

impl TxnStore for LogTxnStore {
    fn create(&self, record: TxnRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.records.contains_key(&record.id) {
            return Err(CoreError::invalid_operation(format!(
                "transaction {} already exists",
                record.id
            )));
        }
        inner.persist(&record)
    }

    fn get(&self, id: TransactionId) -> CoreResult<Option<TxnRecord>> {
        Ok(self.inner.lock().records.get(&id).copied())
    }

    fn transition(
        &self,
        id: TransactionId,
        transition: &Transition,
    ) -> CoreResult<TransitionOutcome> {
        let mut inner = self.inner.lock();
        let current = *inner
            .records
            .get(&id)
            .ok_or(CoreError::TransactionNotFound { txn_id: id })?;

        let outcome = current.apply(transition);
        match outcome {
            TransitionOutcome::Applied(ref next) => inner.persist(next)?,
            // An expiry discovered while rejecting is written back too.
            TransitionOutcome::Rejected(ref next) if *next != current => inner.persist(next)?,
            _ => {}
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for LogTxnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTxnStore")
            .field("records", &self.len())
            .finish()
    }
}

fn replay(log: &mut dyn StorageBackend) -> CoreResult<HashMap<TransactionId, TxnRecord>> {
    let size = log.size()?;
    let mut records = HashMap::new();
    let mut offset = 0u64;

    while offset < size {
        match read_one(log, offset, size) {
            Ok((record, used)) => {
                records.insert(record.id, record);
                offset += used;
            }
            Err(err) => {
                tracing::warn!(
                    offset,
                    size,
                    error = %err,
                    "truncating damaged transaction log tail"
                );
                log.truncate(offset)?;
                log.sync()?;
                break;
            }
        }
    }

    Ok(records)
}

fn read_one(log: &dyn StorageBackend, offset: u64, size: u64) -> CoreResult<(TxnRecord, u64)> {
    let remaining = size - offset;
    if remaining < (HEADER_LEN + TRAILER_LEN) as u64 {
        return Err(CoreError::corruption("truncated record header"));
    }
    let header = log.read_at(offset, HEADER_LEN)?;
    let payload_len = parse_header(&header)?;
    let total = (HEADER_LEN + payload_len + TRAILER_LEN) as u64;
    if remaining < total {
        return Err(CoreError::corruption("truncated record body"));
    }

    let body = log.read_at(offset + HEADER_LEN as u64, payload_len + TRAILER_LEN)?;
    let (payload, crc) = body.split_at(payload_len);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    verify_checksum(payload, expected)?;
    Ok((TxnRecord::decode_payload(payload)?, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxnState;
    use crate::types::Timestamp;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: u64 = 1_000;

    fn begin(store: &LogTxnStore, ts: u64) -> TransactionId {
        let rec = TxnRecord::begin(Timestamp::new(ts), 0, false);
        store.create(rec).unwrap();
        rec.id
    }

    fn commit(ts: u64) -> Transition {
        Transition::Commit {
            commit_ts: Timestamp::new(ts),
            now: 10,
            timeout_ms: TIMEOUT,
        }
    }

    #[test]
    fn create_and_get() {
        let store = LogTxnStore::in_memory();
        let id = begin(&store, 1);
        let rec = store.get(id).unwrap().unwrap();
        assert_eq!(rec.state, TxnState::Active);
        assert!(store.get(TransactionId::new(99)).unwrap().is_none());
        assert_eq!(store.active_ids(), vec![id]);
    }

    #[test]
    fn duplicate_create_fails() {
        let store = LogTxnStore::in_memory();
        begin(&store, 1);
        let again = TxnRecord::begin(Timestamp::new(1), 0, false);
        assert!(store.create(again).is_err());
    }

    #[test]
    fn transition_on_missing_record() {
        let store = LogTxnStore::in_memory();
        let result = store.transition(TransactionId::new(7), &Transition::Rollback);
        assert!(matches!(
            result,
            Err(CoreError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn rejected_expiry_is_persisted() {
        let store = LogTxnStore::in_memory();
        let id = begin(&store, 1);
        let outcome = store
            .transition(
                id,
                &Transition::KeepAlive {
                    now: TIMEOUT + 5,
                    timeout_ms: TIMEOUT,
                },
            )
            .unwrap();
        assert!(!outcome.is_accepted());
        assert_eq!(store.get(id).unwrap().unwrap().state, TxnState::RolledBack);
    }

    #[test]
    fn concurrent_finalizers_have_one_winner() {
        let store = Arc::new(LogTxnStore::in_memory());
        let id = begin(&store, 1);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let t = if i % 2 == 0 {
                        commit(100 + i)
                    } else {
                        Transition::Rollback
                    };
                    matches!(
                        store.transition(id, &t).unwrap(),
                        TransitionOutcome::Applied(_)
                    )
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|applied| *applied)
            .count();
        assert_eq!(winners, 1);
        assert!(store.get(id).unwrap().unwrap().is_finished());
    }

    #[test]
    fn reopen_replays_latest_images() {
        let log = InMemoryBackend::new();
        {
            let store = LogTxnStore::with_backend(Box::new(log.clone())).unwrap();
            let a = begin(&store, 1);
            let b = begin(&store, 2);
            store.transition(a, &commit(3)).unwrap();
            store.transition(b, &Transition::Rollback).unwrap();
            begin(&store, 4);
        }

        let store = LogTxnStore::with_backend(Box::new(log)).unwrap();
        assert_eq!(store.len(), 3);
        let a = store.get(TransactionId::new(1)).unwrap().unwrap();
        assert_eq!(a.commit_ts, Some(Timestamp::new(3)));
        assert_eq!(
            store.get(TransactionId::new(2)).unwrap().unwrap().state,
            TxnState::RolledBack
        );
        assert_eq!(store.active_ids(), vec![TransactionId::new(4)]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let log = InMemoryBackend::new();
        let good_len = {
            let store = LogTxnStore::with_backend(Box::new(log.clone())).unwrap();
            let id = begin(&store, 1);
            store.transition(id, &commit(2)).unwrap();
            store.log_size().unwrap()
        };

        let mut torn = log.clone();
        let partial = TxnRecord::begin(Timestamp::new(5), 0, false).encode();
        torn.append(&partial[..partial.len() / 2]).unwrap();

        let store = LogTxnStore::with_backend(Box::new(log)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.log_size().unwrap(), good_len);
        assert!(store.get(TransactionId::new(5)).unwrap().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn").join("records.log");
        {
            let store = LogTxnStore::open(&path).unwrap();
            let id = begin(&store, 10);
            store.transition(id, &commit(11)).unwrap();
        }
        let store = LogTxnStore::open(&path).unwrap();
        let rec = store.get(TransactionId::new(10)).unwrap().unwrap();
        assert_eq!(rec.state, TxnState::Committed);
    }
}
