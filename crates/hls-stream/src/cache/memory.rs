//! # Memory Cache
//!
//! Size-bounded in-memory cache with first-in first-out eviction.
//!
//! Reads never change eviction order: the entry evicted next is always the
//! oldest *inserted* one still present, however often it has been read.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::cache::types::{CacheEntry, Resource};

/// Default capacity: 10 MiB
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug)]
pub struct MemoryCache {
    /// Maximum accounted size in bytes
    capacity: u64,
    /// Sum of the sizes of all entries
    size: u64,
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order, oldest first
    fifo: VecDeque<String>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_SIZE)
    }
}

impl MemoryCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity: capacity_bytes,
            size: 0,
            entries: HashMap::new(),
            fifo: VecDeque::new(),
        }
    }

    /// Inserts a resource, evicting the oldest entries until it fits.
    ///
    /// An entry larger than the whole capacity empties the cache and is still
    /// inserted. Re-inserting a present key replaces it and moves the key to the
    /// back of the eviction order. Raw bodies are not cacheable; returns `false`
    /// for them.
    pub fn put(&mut self, key: impl Into<String>, resource: Resource) -> bool {
        let key = key.into();
        let Some(size) = resource.data.weight() else {
            trace!(key = %key, "Skipping uncacheable raw body");
            return false;
        };

        if self.entries.contains_key(&key) {
            self.remove(&key);
        }

        while self.size + size > self.capacity {
            let Some(oldest) = self.fifo.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.size -= evicted.size;
                trace!(key = %oldest, size = evicted.size, "Evicted cache entry");
            }
        }

        if size > self.capacity {
            debug!(
                key = %key,
                size = size,
                max_size = self.capacity,
                "Entry exceeds cache capacity, keeping it as the only entry"
            );
        }

        self.entries.insert(key.clone(), CacheEntry { resource, size });
        self.fifo.push_back(key);
        self.size += size;
        true
    }

    pub fn get(&self, key: &str) -> Option<Resource> {
        self.entries.get(key).map(|entry| entry.resource.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Resource> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.size;
        if let Some(position) = self.fifo.iter().position(|k| k == key) {
            self.fifo.remove(position);
        }
        Some(entry.resource)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.fifo.clear();
        self.size = 0;
        debug!("Memory cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current accounted size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Keys from oldest to newest insertion
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fifo.iter().map(String::as_str)
    }
}
