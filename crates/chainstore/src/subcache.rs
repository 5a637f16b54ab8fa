//! Shared block sub-caches, namespaced per chain.
//!
//! A user may hand the store one cache to be shared by every chain it
//! opens. Chains address cached blocks by index, so the store mints a fresh
//! namespace id for each chain; two chains looking up index 0 can never
//! collide on a cache key.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;

/// A shared LRU of block bytes, keyed by `(namespace, index)`.
#[derive(Clone)]
pub struct SharedCache {
    blocks: Arc<Mutex<LruCache<(u64, u64), Vec<u8>>>>,
    next_namespace: Arc<AtomicU64>,
    namespace: u64,
}

impl SharedCache {
    /// Create a cache bounded to `capacity` blocks (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            blocks: Arc::new(Mutex::new(LruCache::new(capacity))),
            next_namespace: Arc::new(AtomicU64::new(1)),
            namespace: 0,
        }
    }

    /// A view of the same cache under a fresh namespace.
    pub fn namespace(&self) -> Self {
        Self {
            blocks: Arc::clone(&self.blocks),
            next_namespace: Arc::clone(&self.next_namespace),
            namespace: self.next_namespace.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Cache a block under this namespace.
    pub fn insert(&self, index: u64, block: Vec<u8>) {
        let mut blocks = self.blocks.lock().expect("lock poisoned");
        blocks.put((self.namespace, index), block);
    }

    /// Look up a block under this namespace, touching its recency.
    pub fn get(&self, index: u64) -> Option<Vec<u8>> {
        let mut blocks = self.blocks.lock().expect("lock poisoned");
        blocks.get(&(self.namespace, index)).cloned()
    }

    /// Number of blocks currently cached across all namespaces.
    pub fn len(&self) -> usize {
        self.blocks.lock().expect("lock poisoned").len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache")
            .field("namespace", &self.namespace)
            .field("blocks", &self.len())
            .finish()
    }
}

/// The user-suppliable sub-caches: block data and hash tree nodes.
#[derive(Clone, Debug, Default)]
pub struct CacheSet {
    pub data: Option<SharedCache>,
    pub tree: Option<SharedCache>,
}

impl CacheSet {
    /// Namespace both sub-caches for one chain.
    pub fn namespace(&self) -> Self {
        Self {
            data: self.data.as_ref().map(SharedCache::namespace),
            tree: self.tree.as_ref().map(SharedCache::namespace),
        }
    }
}
