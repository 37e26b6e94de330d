//! Bounded least-recently-used map with an eviction hook.
//!
//! Backs the UDP relay's per-client sessions: every entry pushed out of the
//! cache (by capacity, by replacement of its key, or by [`LruCache::clear`])
//! is handed to the hook, which closes it. The hook runs after the lock is
//! released, so it may take as long as it needs.

use std::hash::Hash;
use std::num::NonZeroUsize;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Hit/miss/eviction counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found their key
    pub hits: u64,
    /// Lookups that did not
    pub misses: u64,
    /// Entries handed to the eviction hook on insert
    pub evictions: u64,
}

struct Inner<K, V> {
    map: lru::LruCache<K, V>,
    stats: CacheStats,
}

type EvictHook<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

/// Thread-safe LRU cache.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    on_evict: EvictHook<K, V>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new<F>(capacity: usize, on_evict: F) -> Result<Self>
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        let capacity =
            NonZeroUsize::new(capacity).ok_or(Error::config("cache capacity must be > 0"))?;
        Ok(Self {
            inner: Mutex::new(Inner {
                map: lru::LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            on_evict: Box::new(on_evict),
        })
    }

    /// Look up `key`, promoting it to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let found = inner.map.get(key).cloned();
        if found.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        found
    }

    /// Insert `value` under `key` as most recently used.
    ///
    /// A previous value for the same key, or the least recently used entry
    /// when full, is passed to the eviction hook.
    pub fn insert(&self, key: K, value: V) {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = inner.map.push(key, value);
            if evicted.is_some() {
                inner.stats.evictions += 1;
            }
            evicted
        };
        if let Some((k, v)) = evicted {
            (self.on_evict)(k, v);
        }
    }

    /// Remove `key` without invoking the hook.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().map.pop(key)
    }

    /// Whether `key` is present, without promoting it.
    #[cfg(test)]
    fn contains(&self, key: &K) -> bool {
        self.inner.lock().map.contains(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.inner.lock().map.cap().get()
    }

    /// Counters since creation.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Drop every entry, passing each to the eviction hook.
    pub fn clear(&self) {
        let drained: Vec<(K, V)> = {
            let mut inner = self.inner.lock();
            let mut drained = Vec::with_capacity(inner.map.len());
            while let Some(entry) = inner.map.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for (k, v) in drained {
            (self.on_evict)(k, v);
        }
    }
}
