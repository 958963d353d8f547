//! Storage error types.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by stores and sink directories.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read extended beyond the bytes written so far.
    #[error("read beyond end of store: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Current store size.
        size: u64,
    },

    /// A truncation tried to grow the store.
    #[error("cannot truncate store of size {size} to {requested}")]
    InvalidTruncate {
        /// Current store size.
        size: u64,
        /// Requested size.
        requested: u64,
    },

    /// A store with this name already exists.
    #[error("store already exists: {0}")]
    AlreadyExists(String),

    /// The name is not usable inside a sink directory.
    #[error("invalid sink name: {0}")]
    InvalidName(String),
}
