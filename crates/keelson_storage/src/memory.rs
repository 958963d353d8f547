//! In-memory store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory append-only store.
///
/// Clones are handles onto the same buffer. A test can keep one handle,
/// give another to a transaction log or bad-record sink, and inspect the
/// bytes afterwards. Reopening a log over a clone simulates a restart.
///
/// ```rust
/// use keelson_storage::{InMemoryBackend, StorageBackend};
///
/// let observer = InMemoryBackend::new();
/// let mut writer = observer.clone();
/// writer.append(b"E101 bad,row").unwrap();
/// assert_eq!(observer.data(), b"E101 bad,row");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `data`, e.g. a log with a torn tail.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Returns the stored bytes as lossy UTF-8 text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data.read()).into_owned()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                size,
                requested: new_size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}
