//! Cache storage.
//!
//! A process-wide keyed store mapping canonical keys to `(data, stored_at)`
//! entries. Freshness is a property of the query, not the data: the TTL is
//! supplied per call by the reader, so the same entry can be fresh for one
//! caller and stale for another. There is no size or LRU eviction; only
//! explicit invalidation and caller-side TTL decide relevance.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::key::CanonicalKey;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "store";

/// A type-erased cached value.
///
/// One store serves heterogeneous query result types; a hit hands back the
/// same `Arc`, so repeat reads of a cached entry are reference-equal.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// A single cache entry. Replaced atomically in full, never partially updated.
#[derive(Clone)]
pub struct CacheEntry {
    pub data: CachedValue,
    pub stored_at: Instant,
}

/// Keyed entry store shared by every executor of a coordinator instance.
pub struct CacheStore {
    entries: RwLock<HashMap<CanonicalKey, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<CacheEntry> {
        rw_read(&self.entries, SOURCE, "get").get(key).cloned()
    }

    /// Store a value under `key`, stamping it with the current time and
    /// overwriting any previous entry. Returns the stamp.
    pub fn put(&self, key: CanonicalKey, data: CachedValue) -> Instant {
        let stored_at = Instant::now();
        rw_write(&self.entries, SOURCE, "put").insert(key, CacheEntry { data, stored_at });
        stored_at
    }

    /// True iff the entry is younger than the caller's TTL.
    pub fn is_valid(&self, entry: &CacheEntry, ttl: Duration) -> bool {
        entry.stored_at.elapsed() < ttl
    }

    /// Remove entries outright; a subsequent `get` is a miss.
    pub fn invalidate(&self, keys: &[CanonicalKey]) {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
        for key in keys {
            entries.remove(key);
        }
    }

    pub fn invalidate_one(&self, key: &CanonicalKey) {
        rw_write(&self.entries, SOURCE, "invalidate_one").remove(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Get the number of cached entries.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
