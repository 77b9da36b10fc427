use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::cache::entry::CacheEntry;

// ---------------------------------------------------------------------------
// NearCache
// ---------------------------------------------------------------------------

/// Bounded in-process cache tier.
///
/// Entries are evicted LRU when the cache is full; per-entry TTL is
/// enforced on read (an expired entry is dropped and reported as absent).
/// The near tier also owns the `refresh:{K}` marks used to de-duplicate
/// stale-while-revalidate scheduling.
pub struct NearCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    refresh_marks: Mutex<HashMap<String, Instant>>,
    refresh_mark_ttl: Duration,
}

impl NearCache {
    pub fn new(capacity: usize, refresh_mark_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            refresh_marks: Mutex::new(HashMap::new()),
            refresh_mark_ttl,
        }
    }

    /// Fetch a fresh entry.  An expired entry is removed and `None` returned.
    pub fn get(&self, key: &str, now: i64) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_fresh(now) {
                return Some(entry.clone());
            }
        } else {
            return None;
        }
        entries.pop(key);
        None
    }

    pub fn insert(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().put(key.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // -- refresh marks ------------------------------------------------------

    /// Set-if-absent on the refresh mark for `mark_key`.
    ///
    /// Returns `true` when this caller placed the mark and therefore owns
    /// scheduling the refresh.  Marks expire after the configured TTL so a
    /// crashed refresh task cannot wedge the key.
    pub fn try_mark_refresh(&self, mark_key: &str) -> bool {
        let mut marks = self.refresh_marks.lock();
        let now = Instant::now();
        marks.retain(|_, expires| *expires > now);
        match marks.entry(mark_key.to_string()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                slot.insert(now + self.refresh_mark_ttl);
                true
            }
        }
    }

    pub fn clear_refresh(&self, mark_key: &str) {
        self.refresh_marks.lock().remove(mark_key);
    }
}
