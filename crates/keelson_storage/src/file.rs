//! File-backed store.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An append-only store over one OS file.
///
/// `flush` pushes buffered bytes to the OS; `sync` additionally calls
/// `sync_all`. The file handle and the cached size move together under a
/// single lock.
///
/// ```no_run
/// use keelson_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut log = FileBackend::open(Path::new("txn.log")).unwrap();
/// log.append(b"...").unwrap();
/// log.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens `path` for reading and appending, creating it if missing.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, size }),
        })
    }

    /// Like [`open`](Self::open), creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Fails if the directories or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Creates `path` and its missing parent directories, failing if the
    /// file already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the file is present, or an
    /// I/O error if it cannot be created.
    pub fn create_new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, size: 0 }),
        })
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let inner = self.inner.get_mut();
        let offset = inner.size;
        if !data.is_empty() {
            inner.file.seek(SeekFrom::End(0))?;
            inner.file.write_all(data)?;
            inner.size += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        inner.file.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        if new_size > inner.size {
            return Err(StorageError::InvalidTruncate {
                size: inner.size,
                requested: new_size,
            });
        }
        inner.file.set_len(new_size)?;
        inner.file.sync_all()?;
        inner.size = new_size;
        Ok(())
    }
}
