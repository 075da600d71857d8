//! Route cache
//!
//! Bounded LRU + TTL cache of `(service, routing key) -> instance_id`
//! resolutions. A secondary index from `(service, instance_id)` to cached keys
//! lets the router drop exactly the entries that point at a removed instance
//! without flushing the rest of the service.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    service: Arc<str>,
    routing_key: Arc<str>,
}

impl CacheKey {
    fn new(service: &str, routing_key: &str) -> Self {
        Self {
            service: Arc::from(service),
            routing_key: Arc::from(routing_key),
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    instance_id: Arc<str>,
    inserted_at: Instant,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<CacheKey, CacheEntry>,
    /// (service, instance_id) -> keys resolved to that instance
    by_instance: HashMap<(Arc<str>, Arc<str>), HashSet<Arc<str>>>,
}

impl CacheInner {
    fn unindex(&mut self, key: &CacheKey, instance_id: &Arc<str>) {
        let index_key = (Arc::clone(&key.service), Arc::clone(instance_id));
        if let Some(keys) = self.by_instance.get_mut(&index_key) {
            keys.remove(&key.routing_key);
            if keys.is_empty() {
                self.by_instance.remove(&index_key);
            }
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.unindex(key, &entry.instance_id);
        Some(entry)
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Arc<str>),
    Miss,
    /// Entry existed but its TTL had elapsed; it has been dropped
    Expired,
}

/// LRU + TTL route cache.
#[derive(Debug)]
pub struct RouteCache {
    inner: Mutex<CacheInner>,
    capacity: NonZeroUsize,
    ttl: Duration,
}

impl RouteCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                by_instance: HashMap::new(),
            }),
            capacity,
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a cached resolution, refreshing its recency on hit.
    pub fn get(&self, service: &str, routing_key: &str) -> CacheLookup {
        let key = CacheKey::new(service, routing_key);
        let mut inner = self.inner.lock();

        let expired = match inner.entries.peek(&key) {
            None => return CacheLookup::Miss,
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };
        if expired {
            inner.remove(&key);
            return CacheLookup::Expired;
        }

        match inner.entries.get(&key) {
            Some(entry) => CacheLookup::Hit(Arc::clone(&entry.instance_id)),
            None => CacheLookup::Miss,
        }
    }

    /// Inserts or replaces a resolution, evicting the least recently used entry
    /// when full.
    pub fn insert(&self, service: &str, routing_key: &str, instance_id: &str) {
        let key = CacheKey::new(service, routing_key);
        let instance_id: Arc<str> = Arc::from(instance_id);
        let mut inner = self.inner.lock();

        let displaced = inner.entries.push(
            key.clone(),
            CacheEntry {
                instance_id: Arc::clone(&instance_id),
                inserted_at: Instant::now(),
            },
        );
        // either the replaced value for this key or the evicted LRU entry
        if let Some((old_key, old)) = displaced {
            inner.unindex(&old_key, &old.instance_id);
        }
        inner
            .by_instance
            .entry((Arc::clone(&key.service), instance_id))
            .or_default()
            .insert(key.routing_key);
    }

    /// Removes one cached resolution.
    pub fn remove(&self, service: &str, routing_key: &str) -> bool {
        self.inner
            .lock()
            .remove(&CacheKey::new(service, routing_key))
            .is_some()
    }

    /// Drops every entry resolved to `instance_id` of `service`. Returns the
    /// number of entries removed.
    pub fn invalidate_instance(&self, service: &str, instance_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let index_key: (Arc<str>, Arc<str>) = (Arc::from(service), Arc::from(instance_id));
        let Some(keys) = inner.by_instance.remove(&index_key) else {
            return 0;
        };

        keys.into_iter()
            .filter(|routing_key| {
                let key = CacheKey {
                    service: Arc::clone(&index_key.0),
                    routing_key: Arc::clone(routing_key),
                };
                inner.entries.pop(&key).is_some()
            })
            .count()
    }

    /// Drops expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.by_instance.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache = RouteCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get("logic", "p1"), CacheLookup::Miss);

        cache.insert("logic", "p1", "logic-1");
        assert_eq!(cache.get("logic", "p1"), CacheLookup::Hit(Arc::from("logic-1")));
        assert_eq!(cache.get("chat", "p1"), CacheLookup::Miss);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = RouteCache::new(2, Duration::from_secs(60));
        cache.insert("logic", "a", "i1");
        cache.insert("logic", "b", "i1");

        // touch a so b becomes the eviction candidate
        assert!(matches!(cache.get("logic", "a"), CacheLookup::Hit(_)));
        cache.insert("logic", "c", "i2");

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.get("logic", "a"), CacheLookup::Hit(_)));
        assert_eq!(cache.get("logic", "b"), CacheLookup::Miss);
        assert!(matches!(cache.get("logic", "c"), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = RouteCache::new(10, Duration::from_millis(20));
        cache.insert("logic", "a", "i1");
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("logic", "a"), CacheLookup::Expired);
        assert_eq!(cache.get("logic", "a"), CacheLookup::Miss);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_instance_is_targeted() {
        let cache = RouteCache::new(100, Duration::from_secs(60));
        cache.insert("logic", "a", "i1");
        cache.insert("logic", "b", "i2");
        cache.insert("logic", "c", "i2");
        cache.insert("chat", "d", "i2");

        assert_eq!(cache.invalidate_instance("logic", "i2"), 2);
        assert!(matches!(cache.get("logic", "a"), CacheLookup::Hit(_)));
        assert_eq!(cache.get("logic", "b"), CacheLookup::Miss);
        assert_eq!(cache.get("logic", "c"), CacheLookup::Miss);
        // same instance id under another service is untouched
        assert!(matches!(cache.get("chat", "d"), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_reinsert_moves_index() {
        let cache = RouteCache::new(10, Duration::from_secs(60));
        cache.insert("logic", "a", "i1");
        cache.insert("logic", "a", "i2");

        assert_eq!(cache.invalidate_instance("logic", "i1"), 0);
        assert_eq!(cache.get("logic", "a"), CacheLookup::Hit(Arc::from("i2")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicted_entry_leaves_instance_index() {
        let cache = RouteCache::new(2, Duration::from_secs(60));
        cache.insert("logic", "a", "i1");
        cache.insert("logic", "b", "i2");
        cache.insert("logic", "c", "i2");

        // "a" fell off the LRU tail, so i1 has nothing left to invalidate
        assert_eq!(cache.get("logic", "a"), CacheLookup::Miss);
        assert_eq!(cache.invalidate_instance("logic", "i1"), 0);
        assert_eq!(cache.invalidate_instance("logic", "i2"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = RouteCache::new(10, Duration::from_millis(10));
        cache.insert("logic", "a", "i1");
        cache.insert("logic", "b", "i1");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.invalidate_instance("logic", "i1"), 0);
    }
}
