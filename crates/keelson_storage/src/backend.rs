//! The append-only store abstraction.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// Stores do not know what they hold. The transaction log frames and
/// checksums its records itself; the bad-record sink writes plain text lines.
///
/// # Invariants
///
/// - `append` returns the offset the bytes were written at
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `flush` returns, appended bytes survive process exit
/// - implementations are `Send + Sync` so a store can sit behind a shared lock
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] when the range is not
    /// fully written, or with an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it starts at.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes appended bytes to durable storage.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the number of bytes written, which is also the next append offset.
    ///
    /// # Errors
    ///
    /// Fails when the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Like [`flush`](Self::flush), but also makes metadata durable.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn sync(&mut self) -> StorageResult<()>;

    /// Drops every byte at or after `new_size`.
    ///
    /// Used to cut a torn tail off the transaction log during replay.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::InvalidTruncate`] if `new_size` is
    /// larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
