use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{StorageError, StorageResult};
use crate::traits::{StorageBackend, StorageHandle};

/// In-memory, HashMap-based storage backend.
///
/// Intended for tests and embedding. Cloning the backend clones a handle to
/// the *same* object map, so one `MemoryStorage` can back several stores or
/// be inspected while a store is using it.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Returns `true` if an object exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(path)
    }

    /// Sorted list of all object paths, for tests.
    pub fn paths(&self) -> Vec<String> {
        let map = self.objects.read().expect("lock poisoned");
        let mut paths: Vec<String> = map.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl StorageBackend for MemoryStorage {
    fn open(&self, path: &str) -> StorageResult<Box<dyn StorageHandle>> {
        Ok(Box::new(MemoryHandle {
            objects: Arc::clone(&self.objects),
            path: path.to_string(),
        }))
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("object_count", &self.len())
            .finish()
    }
}

struct MemoryHandle {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    path: String,
}

impl StorageHandle for MemoryHandle {
    fn read(&self, offset: u64, length: usize) -> StorageResult<Vec<u8>> {
        let map = self.objects.read().expect("lock poisoned");
        let data = map
            .get(&self.path)
            .ok_or_else(|| StorageError::NotFound(self.path.clone()))?;
        let start = offset as usize;
        let end = start.checked_add(length).unwrap_or(usize::MAX);
        if end > data.len() {
            return Err(StorageError::OutOfRange {
                path: self.path.clone(),
                offset,
                length,
                size: data.len() as u64,
            });
        }
        Ok(data[start..end].to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut map = self.objects.write().expect("lock poisoned");
        let object = map.entry(self.path.clone()).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        let map = self.objects.read().expect("lock poisoned");
        map.get(&self.path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(self.path.clone()))
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
