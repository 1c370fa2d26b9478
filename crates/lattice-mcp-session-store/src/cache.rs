//! Per-node read cache for session records.
//!
//! Bounded LRU with a per-entry TTL. Writes always hit the store first; the
//! cache is refreshed with whatever version the store returned, and any CAS
//! conflict invalidates the entry. The admission path never consults it.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::record::SessionRecord;

struct CacheEntry {
    record: SessionRecord,
    cached_at: Instant,
}

/// LRU + TTL cache of session records.
pub struct ReadCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl ReadCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// Fresh entry for `id`, if present and within TTL. Expired entries are
    /// dropped on access.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.record.clone()),
            Some(_) => {
                entries.pop(id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, record: SessionRecord) {
        let mut entries = self.entries.lock();
        entries.put(
            record.id.clone(),
            CacheEntry {
                record,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, id: &str) {
        self.entries.lock().pop(id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(id: &str, version: u64) -> SessionRecord {
        let mut r = SessionRecord::new(id, HashMap::new(), 0);
        r.version = version;
        r
    }

    #[test]
    fn hit_miss_and_invalidate() {
        let cache = ReadCache::new(4, Duration::from_secs(5));
        assert!(cache.get("s-1").is_none());

        cache.put(record("s-1", 1));
        assert_eq!(cache.get("s-1").unwrap().version, 1);

        cache.put(record("s-1", 2));
        assert_eq!(cache.get("s-1").unwrap().version, 2);

        cache.invalidate("s-1");
        assert!(cache.get("s-1").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ReadCache::new(4, Duration::from_millis(10));
        cache.put(record("s-1", 1));
        assert!(cache.get("s-1").is_some());

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("s-1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_evicts_oldest_beyond_capacity() {
        let cache = ReadCache::new(2, Duration::from_secs(5));
        cache.put(record("s-1", 1));
        cache.put(record("s-2", 1));
        cache.put(record("s-3", 1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("s-1").is_none());
        assert!(cache.get("s-3").is_some());
    }
}
