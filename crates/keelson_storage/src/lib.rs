//! # Keelson Storage
//!
//! Durable byte stores used by the Keelson transaction core.
//!
//! The core persists two kinds of data locally: the transaction record log
//! and the bad-record sink files written during permissive bulk loads. Both
//! are append-only and both are interpreted exclusively by `keelson_core`;
//! the stores in this crate never look inside the bytes they hold.
//!
//! ## Stores
//!
//! - [`InMemoryBackend`] - shared in-memory buffer, for tests and ephemeral engines
//! - [`FileBackend`] - a single OS file
//!
//! ## Directories
//!
//! A [`SinkDirectory`] hands out named stores and answers whether a name is
//! already taken, which is what sink naming needs to avoid collisions.
//!
//! - [`MemoryDirectory`]
//! - [`FsDirectory`]
//!
//! ## Example
//!
//! ```rust
//! use keelson_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let offset = log.append(b"KTXN").unwrap();
//! assert_eq!(log.read_at(offset, 4).unwrap(), b"KTXN");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod directory;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use directory::{FsDirectory, MemoryDirectory, SinkDirectory};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
