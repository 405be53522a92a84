//! The sharded store itself

use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use xxhash_rust::xxh3::Xxh3Builder;

/// Errors raised while building a store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A store needs at least one shard
    #[error("shard count must be at least 1")]
    ZeroShards,
}

/// A value plus the instant after which it must be treated as absent
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// One independently locked partition of the keyspace
struct Shard<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    swept: AtomicU64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a live entry
    pub hits: u64,
    /// Reads that found nothing, or only an expired entry
    pub misses: u64,
    /// Expired entries removed by reads
    pub expired: u64,
    /// Expired entries removed by sweeps
    pub swept: u64,
    /// Entries currently stored, expired or not
    pub entries: usize,
}

impl CacheStats {
    /// Share of reads that were hits, 0.0 when nothing was read
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 {
            0.0
        } else {
            self.hits as f64 / reads as f64
        }
    }
}

/// Partitioned key/value cache with per-entry TTL
pub struct ShardStore<K, V> {
    shards: Box<[Shard<K, V>]>,
    hasher: Xxh3Builder,
    counters: Counters,
}

impl<K, V> fmt::Debug for ShardStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardStore")
            .field("shards", &self.shards.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl<K, V> ShardStore<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Create a store with `shard_count` shards.
    ///
    /// The shard count is fixed for the lifetime of the store, so the
    /// key-to-shard mapping never changes.
    pub fn new(shard_count: usize) -> Result<Self, CacheError> {
        if shard_count == 0 {
            return Err(CacheError::ZeroShards);
        }

        Ok(Self {
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            hasher: Xxh3Builder::new(),
            counters: Counters::default(),
        })
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard a key belongs to
    pub fn shard_index<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// Insert or overwrite `key`; the entry expires `ttl` from now.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let shard = &self.shards[self.shard_index(&key)];
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        shard.entries.write().insert(key, entry);
    }

    /// Read a live value.
    ///
    /// An entry past its expiry is reported as absent even if no sweep has
    /// removed it yet; it is removed here under the shard's own lock.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let shard = &self.shards[self.shard_index(key)];
        let now = Instant::now();

        {
            let entries = shard.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // Re-check under the write lock: a concurrent set may have refreshed it
        let mut entries = shard.entries.write();
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Remove `key`, returning its value if it was still live
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let shard = &self.shards[self.shard_index(key)];
        let entry = shard.entries.write().remove(key)?;
        (!entry.is_expired(Instant::now())).then_some(entry.value)
    }

    /// Drop every expired entry, one shard at a time.
    ///
    /// Each shard's lock is held only while that shard is scanned. Returns the
    /// number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut entries = shard.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            removed += before - entries.len();
        }

        self.counters
            .swept
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Entries currently stored, including expired ones not yet removed
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().len()).sum()
    }

    /// Check whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.entries.read().is_empty())
    }

    /// Remove everything
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.entries.write().clear();
        }
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
