//! Bounded TTL cache used by both caching layers.
//!
//! The check pipeline keeps a short-lived outcome cache in front of the
//! storage layer, and each persistent backend keeps a longer-lived response
//! cache in front of its durable reads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() > ttl
    }
}

/// Thread-safe TTL cache with a bounded entry count.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Get a cached value if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;

        if entry.is_expired(self.ttl) {
            // Don't remove here to avoid the write lock, cleanup will handle it
            None
        } else {
            Some(entry.value.clone())
        }
    }

    /// Store a value, evicting expired entries and then the oldest entry if
    /// the cache is at capacity.
    pub fn insert(&self, key: K, value: V) {
        let entry = Entry {
            value,
            stored_at: Instant::now(),
        };

        if let Ok(mut entries) = self.entries.write() {
            if entries.len() >= self.max_entries && !entries.contains_key(&key) {
                let ttl = self.ttl;
                entries.retain(|_, e| !e.is_expired(ttl));

                if entries.len() >= self.max_entries {
                    if let Some(oldest) = entries
                        .iter()
                        .min_by_key(|(_, e)| e.stored_at)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&oldest);
                    }
                }
            }

            entries.insert(key, entry);
        }
    }

    pub fn remove(&self, key: &K) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Remove expired entries.
    pub fn cleanup(&self) {
        if let Ok(mut entries) = self.entries.write() {
            let ttl = self.ttl;
            entries.retain(|_, e| !e.is_expired(ttl));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cache_set_and_get() {
        let cache = TtlCache::new(Duration::from_secs(3600), 1000);
        cache.insert("10.0.0.1", 75u8);

        assert_eq!(cache.get(&"10.0.0.1"), Some(75));
    }

    #[test]
    fn test_cache_miss() {
        let cache: TtlCache<&str, u8> = TtlCache::new(Duration::from_secs(3600), 1000);
        assert!(cache.get(&"10.0.0.1").is_none());
    }

    #[test]
    fn test_cache_expiration() {
        let cache = TtlCache::new(Duration::ZERO, 1000);
        cache.insert("10.0.0.1", 75u8);

        thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&"10.0.0.1").is_none());
    }

    #[test]
    fn test_cache_max_entries() {
        let cache = TtlCache::new(Duration::from_secs(3600), 2);

        cache.insert("a", 10u8);
        thread::sleep(Duration::from_millis(1)); // Ensure different timestamps
        cache.insert("b", 20);
        thread::sleep(Duration::from_millis(1));
        cache.insert("c", 30);

        // Should have evicted the oldest
        assert!(cache.len() <= 2);
        assert_eq!(cache.get(&"c"), Some(30));
    }

    #[test]
    fn test_cache_cleanup() {
        let cache = TtlCache::new(Duration::ZERO, 1000);
        cache.insert("a", 10u8);
        cache.insert("b", 20);

        thread::sleep(Duration::from_millis(10));
        cache.cleanup();

        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_cache_remove() {
        let cache = TtlCache::new(Duration::from_secs(3600), 1000);
        cache.insert("a", 10u8);
        cache.remove(&"a");

        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn test_cache_clear() {
        let cache = TtlCache::new(Duration::from_secs(3600), 1000);
        cache.insert("a", 10u8);
        cache.insert("b", 20);

        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
