use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::traits::{StorageBackend, StorageHandle};

/// File-per-object storage backend rooted at a directory.
///
/// Relative paths map directly to files under the root; parent directories
/// are created on first write. Objects whose path ends in `/bitfield` are
/// opened with an advisory exclusive lock so an on-disk chain has a single
/// writer per process tree; on platforms without lock support the open
/// proceeds unlocked.
#[derive(Clone, Debug)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Create a backend rooted at `root`. The directory itself is created
    /// lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        if path.is_empty() {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
                reason: "path must not be empty".into(),
            });
        }
        if path.starts_with('/') || path.contains('\\') || path.contains('\0') {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
                reason: "path must be relative and slash-separated".into(),
            });
        }
        for component in path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(StorageError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("invalid path component: {component:?}"),
                });
            }
        }
        Ok(self.root.join(path))
    }
}

impl StorageBackend for DiskStorage {
    fn open(&self, path: &str) -> StorageResult<Box<dyn StorageHandle>> {
        let abs = self.resolve(path)?;

        // Lock files are opened (and created) eagerly so the lock is held
        // for the lifetime of the handle, not the first write.
        let file = if path == "bitfield" || path.ends_with("/bitfield") {
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&abs)?;
            match file.try_lock() {
                Ok(()) => {}
                Err(TryLockError::WouldBlock) => {
                    return Err(StorageError::Locked(path.to_string()));
                }
                Err(TryLockError::Error(e)) => {
                    // Advisory locking is best-effort; filesystems without
                    // it still get a working handle.
                    debug!(path, error = %e, "file lock unavailable; continuing unlocked");
                }
            }
            Some(file)
        } else {
            None
        };

        Ok(Box::new(DiskHandle {
            rel: path.to_string(),
            path: abs,
            file: Mutex::new(file),
        }))
    }
}

struct DiskHandle {
    rel: String,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl DiskHandle {
    /// Open the backing file into the slot if it is not open yet.
    ///
    /// With `create` false, an absent file surfaces as `NotFound`.
    fn ensure_open(&self, slot: &mut Option<File>, create: bool) -> StorageResult<()> {
        if slot.is_some() {
            return Ok(());
        }
        if create {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&self.path);
        match opened {
            Ok(file) => {
                *slot = Some(file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.rel.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl StorageHandle for DiskHandle {
    fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>> {
        let mut guard = self.file.lock().expect("lock poisoned");
        self.ensure_open(&mut guard, false)?;
        let mut file = guard.as_ref().expect("file just opened");

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length];
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let size = file.metadata()?.len();
                Err(StorageError::OutOfRange {
                    path: self.rel.clone(),
                    offset,
                    length,
                    size,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut guard = self.file.lock().expect("lock poisoned");
        self.ensure_open(&mut guard, true)?;
        let mut file = guard.as_ref().expect("file just opened");

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        let guard = self.file.lock().expect("lock poisoned");
        if let Some(file) = guard.as_ref() {
            return Ok(file.metadata()?.len());
        }
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(self.rel.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&self) -> StorageResult<()> {
        let guard = self.file.lock().expect("lock poisoned");
        if let Some(file) = guard.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> (tempfile::TempDir, DiskStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path());
        (dir, storage)
    }

    // -----------------------------------------------------------------------
    // Read / write
    // -----------------------------------------------------------------------

    #[test]
    fn write_creates_parents_and_reads_back() {
        let (_dir, storage) = temp_storage();
        let handle = storage.open("ab/cd/deadbeef/log").unwrap();
        handle.write(0, b"hello").unwrap();
        assert_eq!(handle.read(0, 5).unwrap(), b"hello");
        assert_eq!(handle.len().unwrap(), 5);
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_dir, storage) = temp_storage();
        let handle = storage.open("nope").unwrap();
        assert!(matches!(handle.read(0, 1), Err(StorageError::NotFound(_))));
        assert!(matches!(handle.len(), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn short_read_is_out_of_range() {
        let (_dir, storage) = temp_storage();
        let handle = storage.open("obj").unwrap();
        handle.write(0, b"abc").unwrap();
        assert!(matches!(
            handle.read(1, 5),
            Err(StorageError::OutOfRange { size: 3, .. })
        ));
    }

    #[test]
    fn sparse_write_zero_fills() {
        let (_dir, storage) = temp_storage();
        let handle = storage.open("obj").unwrap();
        handle.write(4, b"xy").unwrap();
        assert_eq!(handle.read(0, 6).unwrap(), b"\0\0\0\0xy");
    }

    #[test]
    fn persists_across_handles() {
        let (dir, storage) = temp_storage();
        storage.open("keep").unwrap().write(0, b"durable").unwrap();

        let reopened = DiskStorage::new(dir.path());
        let handle = reopened.open("keep").unwrap();
        assert_eq!(handle.read(0, 7).unwrap(), b"durable");
    }

    // -----------------------------------------------------------------------
    // Path validation
    // -----------------------------------------------------------------------

    #[test]
    fn rejects_escaping_paths() {
        let (_dir, storage) = temp_storage();
        for bad in ["", "/abs", "a/../b", "./x", "a//b", "a\\b"] {
            assert!(
                matches!(storage.open(bad), Err(StorageError::InvalidPath { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Bitfield locking
    // -----------------------------------------------------------------------

    #[test]
    fn bitfield_is_exclusively_locked() {
        let (_dir, storage) = temp_storage();
        let held = storage.open("ab/cd/dead/bitfield").unwrap();
        assert!(matches!(
            storage.open("ab/cd/dead/bitfield"),
            Err(StorageError::Locked(_))
        ));

        // Dropping the handle releases the lock.
        drop(held);
        assert!(storage.open("ab/cd/dead/bitfield").is_ok());
    }

    #[test]
    fn distinct_bitfields_do_not_conflict() {
        let (_dir, storage) = temp_storage();
        let _a = storage.open("aa/aa/a/bitfield").unwrap();
        let _b = storage.open("bb/bb/b/bitfield").unwrap();
    }

    #[test]
    fn non_bitfield_paths_are_unlocked() {
        let (_dir, storage) = temp_storage();
        let _h1 = storage.open("x/log").unwrap();
        let _h2 = storage.open("x/log").unwrap();
    }
}
