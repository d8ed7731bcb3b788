use crate::services::logger::Logger;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry<T> {
    value: T,
    created_at: Instant,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Inner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    hits: u64,
    misses: u64,
}

/// In-memory TTL cache for slow-changing EMS metadata (field IDs, database
/// name maps, field groups). One mutex serializes all operations; call
/// volume is low enough that finer locking would buy nothing.
pub struct TtlCache<T> {
    logger: Logger,
    default_ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(logger: Logger, default_ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            logger: logger.child("cache"),
            default_ttl: Duration::from_secs(default_ttl_secs),
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Returns the cached value, removing it if expired. An expired entry is
    /// indistinguishable from a missing one to the caller.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                None
            }
            Some(entry) if entry.is_expired(now) => {
                inner.entries.remove(key);
                inner.misses += 1;
                self.logger.debug("Cache miss (expired)", None);
                None
            }
            Some(entry) => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
        }
    }

    pub fn set(&self, key: &str, value: T) {
        self.set_with_ttl(key, value, self.default_ttl.as_secs());
    }

    pub fn set_with_ttl(&self, key: &str, value: T, ttl_secs: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if inner.entries.len() >= self.max_entries {
            Self::evict_expired(&mut inner, now);
        }
        if inner.entries.len() >= self.max_entries {
            let count = (inner.entries.len() / 10).max(1);
            Self::evict_oldest(&mut inner, count);
            self.logger.debug(
                "Evicted oldest cache entries",
                Some(&serde_json::json!({ "count": count })),
            );
        }

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
    }

    /// Entry count as stored. Expired-but-unswept entries are included.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.hits, inner.misses)
    }

    fn evict_expired(inner: &mut Inner<T>, now: Instant) {
        inner.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn evict_oldest(inner: &mut Inner<T>, count: usize) {
        let mut by_age: Vec<(String, Instant)> = inner
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);
        for (key, _) in by_age.into_iter().take(count) {
            inner.entries.remove(&key);
        }
    }
}

/// Build a cache key from heterogeneous parts.
pub fn make_cache_key(parts: &[&str]) -> String {
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn cache(max_entries: usize) -> TtlCache<String> {
        TtlCache::new(Logger::new("test"), 3_600, max_entries)
    }

    #[test]
    fn get_returns_what_was_set() {
        let cache = cache(16);
        cache.set("key", "value".to_string());
        assert_eq!(cache.get("key"), Some("value".to_string()));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = cache(16);
        cache.set_with_ttl("key", "value".to_string(), 0);
        sleep(Duration::from_millis(2));
        assert_eq!(cache.get("key"), None);
        // The expired entry was removed on lookup.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn len_counts_unswept_expired_entries() {
        let cache = cache(16);
        cache.set_with_ttl("stale", "value".to_string(), 0);
        cache.set("fresh", "value".to_string());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn delete_reports_presence() {
        let cache = cache(16);
        cache.set("key", "value".to_string());
        assert!(cache.delete("key"));
        assert!(!cache.delete("key"));
    }

    #[test]
    fn eviction_never_leaves_cache_over_capacity() {
        let cache = cache(10);
        for i in 0..25 {
            cache.set(&format!("key-{}", i), "value".to_string());
        }
        assert!(cache.len() <= 10);
    }

    #[test]
    fn eviction_prefers_expired_entries() {
        let cache = cache(4);
        cache.set_with_ttl("stale-1", "value".to_string(), 0);
        cache.set_with_ttl("stale-2", "value".to_string(), 0);
        cache.set("keep-1", "value".to_string());
        cache.set("keep-2", "value".to_string());
        sleep(Duration::from_millis(2));
        cache.set("new", "value".to_string());
        assert_eq!(cache.get("keep-1"), Some("value".to_string()));
        assert_eq!(cache.get("keep-2"), Some("value".to_string()));
        assert_eq!(cache.get("new"), Some("value".to_string()));
    }

    #[test]
    fn eviction_removes_oldest_created_first() {
        let cache = cache(4);
        for i in 0..4 {
            cache.set(&format!("key-{}", i), "value".to_string());
            sleep(Duration::from_millis(2));
        }
        cache.set("key-4", "value".to_string());
        // key-0 was created first and no entries were expired.
        assert_eq!(cache.get("key-0"), None);
        assert_eq!(cache.get("key-4"), Some("value".to_string()));
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = cache(16);
        cache.set("key", "value".to_string());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn make_cache_key_joins_parts() {
        assert_eq!(make_cache_key(&["field_resolve", "1", "db", "alt"]), "field_resolve:1:db:alt");
    }
}
