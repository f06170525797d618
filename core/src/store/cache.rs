use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{CACHE_CAPACITY, CACHE_TTL};

/// Read-through cache in front of the shared store. Bounded; entries
/// carry their own expiry so a disabled or reconfigured cache never
/// serves stale values past the agreed TTL.
pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    config: Mutex<CacheConfig>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheEntry {
    value: JsonValue,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "ttlSeconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: CACHE_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(CACHE_CAPACITY)
    }
}

impl LocalCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            config: Mutex::new(CacheConfig::default()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        if !self.config().enabled {
            return None;
        }

        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }

        // Expired entries are removed lazily here and by the sweeper.
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: &str, value: JsonValue) {
        let config = self.config();
        if !config.enabled {
            return;
        }

        if self.entries.len() >= self.capacity && !self.entries.contains_key(key) {
            self.evict_nearest_expiry();
        }

        self.entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                expires_at: Instant::now() + Duration::from_secs(config.ttl_seconds),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry; returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn config(&self) -> CacheConfig {
        *self.config.lock().expect("cache config lock poisoned")
    }

    /// Runtime reconfiguration from the admin endpoint. Disabling the
    /// cache clears it so re-enabling starts cold.
    pub fn reconfigure(&self, enabled: Option<bool>, ttl_seconds: Option<u64>) -> CacheConfig {
        let mut config = self.config.lock().expect("cache config lock poisoned");
        if let Some(enabled) = enabled {
            config.enabled = enabled;
        }
        if let Some(ttl) = ttl_seconds {
            config.ttl_seconds = ttl.max(1);
        }
        let snapshot = *config;
        drop(config);

        if !snapshot.enabled {
            self.clear();
        }
        snapshot
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn evict_nearest_expiry(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_after_put_counts_once() {
        let cache = LocalCache::new(16);
        cache.put("k", json!({"a": 1}));
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn miss_on_absent_key() {
        let cache = LocalCache::new(16);
        assert_eq!(cache.get("absent"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn disabled_cache_serves_nothing_and_clears() {
        let cache = LocalCache::new(16);
        cache.put("k", json!(1));
        let config = cache.reconfigure(Some(false), None);
        assert!(!config.enabled);
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.get("k"), None);

        cache.put("k", json!(1));
        assert_eq!(cache.stats().entries, 0, "puts are ignored while disabled");
    }

    #[test]
    fn ttl_reconfiguration_floors_at_one_second() {
        let cache = LocalCache::new(16);
        let config = cache.reconfigure(None, Some(0));
        assert_eq!(config.ttl_seconds, 1);
    }

    #[test]
    fn capacity_bound_evicts_instead_of_growing() {
        let cache = LocalCache::new(2);
        cache.put("a", json!(1));
        cache.put("b", json!(2));
        cache.put("c", json!(3));
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn evict_expired_removes_only_dead_entries() {
        let cache = LocalCache::new(16);
        cache.reconfigure(None, Some(3600));
        cache.put("live", json!(1));
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.stats().entries, 1);
    }
}
