//! Memory-bounded LRU cache of successful executions.
//!
//! Entries are keyed by a SHA-256 digest of the target context and the
//! normalized statement, so formatting-only differences share an entry and
//! different targets never collide.
//!
//! Sizes are estimates: an entry costs the length of its JSON serialization.
//! That tracks payload growth closely enough to bound memory, but it is not
//! the exact heap footprint.
//!
//! One mutex guards the whole store. `get` takes it too, because a hit moves
//! the entry to the most-recently-used position.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::core::types::ExecutionResult;

/// Default capacity (100 MiB).
pub const DEFAULT_CAPACITY_BYTES: usize = 100 * 1024 * 1024;

/// Fixed-length cache key (SHA-256 digest).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &hex::encode(self.0)[..16])
    }
}

/// Trim, collapse internal whitespace, and case-fold a statement.
pub fn normalize_statement(statement: &str) -> String {
    statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Derive the cache key for a statement run against `target`.
pub fn cache_key(target: &str, statement: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    // Length prefix keeps (target, statement) pairs unambiguous.
    hasher.update((target.len() as u64).to_be_bytes());
    hasher.update(target.as_bytes());
    hasher.update(normalize_statement(statement).as_bytes());
    CacheKey(hasher.finalize().into())
}

/// Estimated size of a result in bytes (length of its JSON encoding).
pub fn estimate_size(result: &ExecutionResult) -> usize {
    serde_json::to_vec(result)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub current_size_bytes: usize,
    pub max_size_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or `None` before the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        (total > 0).then(|| self.hits as f64 / total as f64)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = match self.hit_rate() {
            Some(rate) => format!("{:.1}%", rate * 100.0),
            None => "N/A".to_string(),
        };
        write!(
            f,
            "entries={} size={}/{} bytes hits={} misses={} hit_rate={}",
            self.entries,
            self.current_size_bytes,
            self.max_size_bytes,
            self.hits,
            self.misses,
            rate
        )
    }
}

struct CacheEntry {
    value: ExecutionResult,
    size: usize,
    /// Position in `Store::recency`.
    tick: u64,
}

#[derive(Default)]
struct Store {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Recency order: smallest tick is least recently used.
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    current_size: usize,
    hits: u64,
    misses: u64,
}

impl Store {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: CacheKey) {
        let tick = self.bump();
        if let Some(entry) = self.entries.get_mut(&key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        self.current_size -= entry.size;
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<CacheKey> {
        let (_, key) = self.recency.pop_first()?;
        if let Some(entry) = self.entries.remove(&key) {
            self.current_size -= entry.size;
        }
        Some(key)
    }
}

/// Thread-safe LRU cache bounded by estimated payload size.
pub struct ResultCache {
    capacity: usize,
    store: Mutex<Store>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES)
    }
}

impl ResultCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity: capacity_bytes,
            store: Mutex::new(Store::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Store mutations never leave it half-updated across a panic point, so a
    // poisoned lock still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a result, promoting it to most-recently-used on a hit.
    pub fn get(&self, target: &str, statement: &str) -> Option<ExecutionResult> {
        let key = cache_key(target, statement);
        let mut store = self.lock();
        if store.entries.contains_key(&key) {
            store.touch(key);
            store.hits += 1;
            trace!(key = ?key, "cache hit");
            return store.entries.get(&key).map(|entry| entry.value.clone());
        }
        store.misses += 1;
        trace!(key = ?key, "cache miss");
        None
    }

    /// Store a successful result, evicting least-recently-used entries to make room.
    ///
    /// Failed results are ignored, and a result larger than the whole capacity
    /// is skipped without touching existing entries.
    pub fn put(&self, target: &str, statement: &str, result: &ExecutionResult) {
        if !result.success {
            return;
        }
        let size = estimate_size(result);
        if size > self.capacity {
            debug!(size, capacity = self.capacity, "skipping oversized cache entry");
            return;
        }

        let key = cache_key(target, statement);
        let mut store = self.lock();
        store.remove(&key);
        while store.current_size + size > self.capacity {
            match store.evict_lru() {
                Some(evicted) => trace!(key = ?evicted, "evicted cache entry"),
                None => break,
            }
        }
        let tick = store.bump();
        store.entries.insert(
            key,
            CacheEntry {
                value: result.clone(),
                size,
                tick,
            },
        );
        store.recency.insert(tick, key);
        store.current_size += size;
    }

    /// Read an entry without changing recency or counters.
    pub fn peek(&self, target: &str, statement: &str) -> Option<ExecutionResult> {
        let key = cache_key(target, statement);
        self.lock().entries.get(&key).map(|entry| entry.value.clone())
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        self.lock().recency.values().copied().collect()
    }

    /// Drop every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        let mut store = self.lock();
        store.entries.clear();
        store.recency.clear();
        store.current_size = 0;
        store.hits = 0;
        store.misses = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.lock();
        CacheStats {
            entries: store.entries.len(),
            current_size_bytes: store.current_size,
            max_size_bytes: self.capacity,
            hits: store.hits,
            misses: store.misses,
        }
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("stats", &self.stats())
            .finish()
    }
}
