//! Named stores inside a directory.
//!
//! Bad-record sinks live in a job's status directory. Several workers of the
//! same job write there concurrently, and files from earlier runs may still
//! be present. A sink claims its name with [`SinkDirectory::reserve`] and only
//! creates the store on its first write, through
//! [`SinkDirectory::create`], which never reuses an existing store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A flat namespace of append-only stores.
pub trait SinkDirectory: Send + Sync + fmt::Debug {
    /// Returns true if a store named `name` already exists.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or the directory cannot be inspected.
    fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Claims `name` without creating a store.
    ///
    /// Returns false if a store with that name exists or the name was already
    /// reserved through this directory. Check and claim are atomic.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or the directory cannot be inspected.
    fn reserve(&self, name: &str) -> StorageResult<bool>;

    /// Gives up a reservation made by [`reserve`](Self::reserve).
    fn release(&self, name: &str);

    /// Creates a new store named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if a store with that name is
    /// present, or fails if the name is invalid or the store cannot be
    /// created.
    fn create(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Opens `name` for appending, creating it if missing.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid or the store cannot be created.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns the user-facing location of `name` (a path for file systems).
    fn location(&self, name: &str) -> String;
}

fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A [`SinkDirectory`] over a directory on the local file system.
///
/// The directory is created when the first store is. Clones share
/// reservations.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
    reserved: Arc<Mutex<BTreeSet<String>>>,
}

impl FsDirectory {
    /// Creates a directory handle rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Returns the root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SinkDirectory for FsDirectory {
    fn exists(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        Ok(self.root.join(name).exists())
    }

    fn reserve(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        let mut reserved = self.reserved.lock();
        if reserved.contains(name) || self.root.join(name).exists() {
            return Ok(false);
        }
        reserved.insert(name.to_string());
        Ok(true)
    }

    fn release(&self, name: &str) {
        self.reserved.lock().remove(name);
    }

    fn create(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let backend = FileBackend::create_new(&self.root.join(name))?;
        tracing::debug!(path = %backend.path().display(), "created sink file");
        Ok(Box::new(backend))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let backend = FileBackend::open_with_create_dirs(&self.root.join(name))?;
        tracing::debug!(path = %backend.path().display(), "opened sink file");
        Ok(Box::new(backend))
    }

    fn location(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }
}

/// An in-memory [`SinkDirectory`].
///
/// Clones share the same namespace, so tests can inspect what a sink wrote.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    label: String,
    files: Arc<RwLock<BTreeMap<String, InMemoryBackend>>>,
    reserved: Arc<Mutex<BTreeSet<String>>>,
}

impl MemoryDirectory {
    /// Creates an empty directory whose locations are prefixed with `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            files: Arc::new(RwLock::new(BTreeMap::new())),
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Creates an empty store named `name`, simulating a leftover file.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid.
    pub fn touch(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        self.files.write().entry(name.to_string()).or_default();
        Ok(())
    }

    /// Returns the text written to `name`, if it exists.
    #[must_use]
    pub fn contents(&self, name: &str) -> Option<String> {
        self.files.read().get(name).map(InMemoryBackend::text)
    }

    /// Returns true if `name` is reserved but not necessarily created.
    #[must_use]
    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.lock().contains(name)
    }

    /// Returns every name in the directory, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new("mem:")
    }
}

impl SinkDirectory for MemoryDirectory {
    fn exists(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        Ok(self.files.read().contains_key(name))
    }

    fn reserve(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        let mut reserved = self.reserved.lock();
        if reserved.contains(name) || self.files.read().contains_key(name) {
            return Ok(false);
        }
        reserved.insert(name.to_string());
        Ok(true)
    }

    fn release(&self, name: &str) {
        self.reserved.lock().remove(name);
    }

    fn create(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let mut files = self.files.write();
        if files.contains_key(name) {
            return Err(StorageError::AlreadyExists(self.location(name)));
        }
        let handle = InMemoryBackend::default();
        files.insert(name.to_string(), handle.clone());
        Ok(Box::new(handle))
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let handle = self
            .files
            .write()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(handle))
    }

    fn location(&self, name: &str) -> String {
        format!("{}{}", self.label, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_directory_tracks_names() {
        let dir = MemoryDirectory::new("status/");
        assert!(!dir.exists("orders.bad").unwrap());

        let mut sink = dir.open("orders.bad").unwrap();
        sink.append(b"UNIQUE 1,a\n").unwrap();

        assert!(dir.exists("orders.bad").unwrap());
        assert_eq!(dir.contents("orders.bad").unwrap(), "UNIQUE 1,a\n");
        assert_eq!(dir.location("orders.bad"), "status/orders.bad");
    }

    #[test]
    fn reopening_appends_to_same_store() {
        let dir = MemoryDirectory::default();
        dir.open("a.bad").unwrap().append(b"x").unwrap();
        dir.open("a.bad").unwrap().append(b"y").unwrap();
        assert_eq!(dir.contents("a.bad").unwrap(), "xy");
    }

    #[test]
    fn reservation_is_exclusive_and_creates_nothing() {
        let dir = MemoryDirectory::default();
        dir.touch("old.bad").unwrap();

        assert!(!dir.reserve("old.bad").unwrap());
        assert!(dir.reserve("new.bad").unwrap());
        assert!(!dir.reserve("new.bad").unwrap());
        assert!(!dir.exists("new.bad").unwrap());
        assert!(dir.is_reserved("new.bad"));

        dir.release("new.bad");
        assert!(dir.reserve("new.bad").unwrap());
    }

    #[test]
    fn create_refuses_existing_store() {
        let dir = MemoryDirectory::default();
        dir.create("a.bad").unwrap().append(b"x").unwrap();
        assert!(matches!(
            dir.create("a.bad"),
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(dir.contents("a.bad").unwrap(), "x");
    }

    #[test]
    fn fs_create_refuses_file_made_after_reserve() {
        let tmp = tempdir().unwrap();
        let dir = FsDirectory::new(tmp.path());
        assert!(dir.reserve("orders.bad").unwrap());

        // Another process takes the name between reserve and first write.
        std::fs::write(tmp.path().join("orders.bad"), "UNIQUE other\n").unwrap();

        assert!(matches!(
            dir.create("orders.bad"),
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("orders.bad")).unwrap(),
            "UNIQUE other\n"
        );
    }

    #[test]
    fn concurrent_fs_reservations_get_distinct_names() {
        let tmp = tempdir().unwrap();
        let dir = FsDirectory::new(tmp.path());
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let dir = dir.clone();
                    s.spawn(move || dir.reserve("orders.bad").unwrap())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn rejects_names_that_escape_the_directory() {
        let dir = MemoryDirectory::default();
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(dir.exists(bad), Err(StorageError::InvalidName(_))));
        }
    }

    #[test]
    fn fs_directory_creates_root_lazily() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("bad-records");
        let dir = FsDirectory::new(&root);

        assert!(!dir.exists("x.bad").unwrap());
        dir.open("x.bad").unwrap().append(b"CHECK row\n").unwrap();

        assert!(dir.exists("x.bad").unwrap());
        assert_eq!(
            std::fs::read_to_string(root.join("x.bad")).unwrap(),
            "CHECK row\n"
        );
        assert_eq!(dir.location("x.bad"), root.join("x.bad").display().to_string());
    }
}
