//! Reference-counted chain cache with LRU eviction of idle entries.
//!
//! Entries live on one of two sides: *pinned* (held by at least one view)
//! or *idle* (zero references, eviction-eligible). An entry moves between
//! the sides as its reference count crosses zero. Eviction happens on
//! insert, never on decrement, and only ever takes idle entries: when every
//! entry is pinned the cache simply exceeds its soft cap.
//!
//! The cache never closes what it evicts: evicted values are handed back
//! to the caller, which keeps every operation synchronous and re-entrancy
//! trivial (removing an id that is already gone is a no-op).

use std::collections::HashMap;

use chainstore_crypto::DiscoveryKey;
use lru::LruCache;

/// A cached value with its view reference count.
#[derive(Debug)]
struct Pinned<T> {
    value: T,
    refs: u32,
}

/// Reference-counted map from discovery key to live chain state.
pub struct ChainCache<T> {
    capacity: usize,
    pinned: HashMap<DiscoveryKey, Pinned<T>>,
    idle: LruCache<DiscoveryKey, T>,
}

impl<T: Clone> ChainCache<T> {
    /// Create a cache with the given soft capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pinned: HashMap::new(),
            idle: LruCache::unbounded(),
        }
    }

    /// Look up an entry, refreshing its recency if it is idle.
    pub fn get(&mut self, id: &DiscoveryKey) -> Option<T> {
        if let Some(entry) = self.pinned.get(id) {
            return Some(entry.value.clone());
        }
        self.idle.get(id).cloned()
    }

    /// Membership test with no recency effect.
    pub fn contains(&self, id: &DiscoveryKey) -> bool {
        self.pinned.contains_key(id) || self.idle.contains(id)
    }

    /// Entry with its reference count, no recency effect.
    pub fn entry(&self, id: &DiscoveryKey) -> Option<(T, u32)> {
        if let Some(entry) = self.pinned.get(id) {
            return Some((entry.value.clone(), entry.refs));
        }
        self.idle.peek(id).map(|value| (value.clone(), 0))
    }

    /// Insert a fresh entry with zero references.
    ///
    /// Returns the idle entries evicted to make room; the caller is
    /// responsible for closing them. The entry being inserted is never its
    /// own victim: a cache full of pinned entries overflows instead.
    pub fn insert(&mut self, id: DiscoveryKey, value: T) -> Vec<T> {
        self.idle.put(id, value);
        self.shrink(Some(id))
    }

    /// Insert a fresh entry that is referenced by one view from the start,
    /// so it is never eviction-eligible between insert and first use.
    ///
    /// Returns the idle entries evicted to make room.
    pub fn insert_pinned(&mut self, id: DiscoveryKey, value: T) -> Vec<T> {
        self.idle.pop(&id);
        self.pinned.insert(id, Pinned { value, refs: 1 });
        self.shrink(None)
    }

    /// Look up an entry and take a reference in one step, pinning it if it
    /// was idle. Returns the entry, or `None` when the id is not cached
    /// (in which case no reference was taken).
    pub fn get_and_increment(&mut self, id: &DiscoveryKey) -> Option<T> {
        if let Some(entry) = self.pinned.get_mut(id) {
            entry.refs += 1;
            return Some(entry.value.clone());
        }
        let value = self.idle.pop(id)?;
        self.pinned.insert(
            *id,
            Pinned {
                value: value.clone(),
                refs: 1,
            },
        );
        Some(value)
    }

    /// Add one reference, pinning the entry if it was idle.
    ///
    /// Returns `false` if the id is not cached.
    pub fn increment(&mut self, id: &DiscoveryKey) -> bool {
        self.get_and_increment(id).is_some()
    }

    /// Drop one reference; at zero the entry becomes idle (eviction-eligible
    /// on a later insert, never evicted here).
    ///
    /// Returns `false` if the id is not pinned.
    pub fn decrement(&mut self, id: &DiscoveryKey) -> bool {
        let Some(entry) = self.pinned.get_mut(id) else {
            return false;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = self.pinned.remove(id) {
                self.idle.put(*id, entry.value);
            }
        }
        true
    }

    /// Current reference count (zero for idle or absent ids).
    pub fn refs(&self, id: &DiscoveryKey) -> u32 {
        self.pinned.get(id).map(|entry| entry.refs).unwrap_or(0)
    }

    /// Remove an entry unconditionally. Absent ids are tolerated.
    pub fn remove(&mut self, id: &DiscoveryKey) -> Option<T> {
        if let Some(entry) = self.pinned.remove(id) {
            return Some(entry.value);
        }
        self.idle.pop(id)
    }

    /// All pinned values (the entries some view currently owns).
    pub fn pinned_values(&self) -> Vec<T> {
        self.pinned.values().map(|entry| entry.value.clone()).collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values: Vec<T> = self.pinned.drain().map(|(_, entry)| entry.value).collect();
        while let Some((_, value)) = self.idle.pop_lru() {
            values.push(value);
        }
        values
    }

    /// Total entries, pinned and idle.
    pub fn len(&self) -> usize {
        self.pinned.len() + self.idle.len()
    }

    /// Evict least-recently-used idle entries until the cache fits its
    /// capacity. `keep` names an entry that must survive this pass (the
    /// one just inserted); once only pinned entries and `keep` remain the
    /// cache overflows softly.
    fn shrink(&mut self, keep: Option<DiscoveryKey>) -> Vec<T> {
        let mut evicted = Vec::new();
        while self.len() > self.capacity {
            match self.idle.pop_lru() {
                Some((victim_id, victim)) if keep != Some(victim_id) => evicted.push(victim),
                Some((victim_id, victim)) => {
                    self.idle.put(victim_id, victim);
                    break;
                }
                None => break,
            }
        }
        evicted
    }

    /// Returns `true` if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for ChainCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCache")
            .field("capacity", &self.capacity)
            .field("pinned", &self.pinned.len())
            .field("idle", &self.idle.len())
            .finish()
    }
}
