//! Bounded LRU store with optional TTL and stale-read semantics
//!
//! Thin wrapper over `lru::LruCache` that layers entry age on top, since
//! the container itself is age-less. Values are opaque; the store never
//! inspects or serializes them.
//!
//! A read of an expired entry drops it. With `allow_stale` the dropped
//! value is still returned that one time, so callers can serve stale data
//! while a reload is underway.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::config::LruOptions;

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

/// Bounded keyed container with least-recently-used eviction
pub(crate) struct LruStore<T> {
    entries: LruCache<String, Entry<T>>,
    max_age: Option<Duration>,
    allow_stale: bool,
}

fn is_expired(stored_at: Instant, max_age: Option<Duration>) -> bool {
    max_age.is_some_and(|ttl| stored_at.elapsed() >= ttl)
}

impl<T: Clone> LruStore<T> {
    pub fn new(options: &LruOptions) -> Self {
        let capacity = NonZeroUsize::new(options.max).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_age: options.max_age_ms.map(Duration::from_millis),
            allow_stale: options.allow_stale,
        }
    }

    /// Look up a key, refreshing its recency on a live hit
    pub fn get(&mut self, key: &str) -> Option<T> {
        let max_age = self.max_age;
        let (value, expired) = match self.entries.get(key) {
            Some(entry) => (entry.value.clone(), is_expired(entry.stored_at, max_age)),
            None => return None,
        };
        if expired {
            self.entries.pop(key);
            if self.allow_stale {
                Some(value)
            } else {
                None
            }
        } else {
            Some(value)
        }
    }

    pub fn set(&mut self, key: &str, value: T) {
        self.entries.put(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn del(&mut self, key: &str) {
        self.entries.pop(key);
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Whether a live (non-expired) entry exists; does not refresh recency
    pub fn has(&self, key: &str) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|entry| !is_expired(entry.stored_at, self.max_age))
    }

    /// Keys in most-recently-used-first order
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Eagerly drop every expired entry
    pub fn prune(&mut self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| is_expired(entry.stored_at, self.max_age))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }

    pub fn item_count(&self) -> usize {
        self.entries.len()
    }

    /// Aggregate size; every entry weighs one, so this equals `item_count`
    pub fn length(&self) -> usize {
        self.entries.len()
    }

    pub fn max(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn allow_stale(&self) -> bool {
        self.allow_stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: usize, max_age_ms: Option<u64>, allow_stale: bool) -> LruStore<String> {
        let options = LruOptions {
            max,
            max_age_ms,
            allow_stale,
        };
        LruStore::new(&options)
    }

    #[test]
    fn test_get_returns_none_on_miss() {
        let mut store = store(10, None, false);
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_set_and_get() {
        let mut store = store(10, None, false);
        store.set("k", "v".to_string());
        assert_eq!(store.get("k"), Some("v".to_string()));
        assert!(store.has("k"));
    }

    #[test]
    fn test_del_removes_entry() {
        let mut store = store(10, None, false);
        store.set("k", "v".to_string());
        store.del("k");
        assert!(!store.has("k"));
        assert_eq!(store.item_count(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = store(10, None, false);
        store.set("a", "1".to_string());
        store.set("b", "2".to_string());
        store.reset();
        assert_eq!(store.item_count(), 0);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let mut store = store(2, None, false);
        store.set("a", "1".to_string());
        store.set("b", "2".to_string());
        // Touch "a" so "b" becomes the eviction candidate
        store.get("a");
        store.set("c", "3".to_string());
        assert!(store.has("a"));
        assert!(!store.has("b"));
        assert!(store.has("c"));
        assert_eq!(store.item_count(), 2);
    }

    #[test]
    fn test_expired_read_drops_entry() {
        let mut store = store(10, Some(10), false);
        store.set("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.get("k"), None);
        assert_eq!(store.item_count(), 0);
    }

    #[test]
    fn test_stale_read_returns_value_exactly_once() {
        let mut store = store(10, Some(10), true);
        store.set("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.get("k"), Some("v".to_string()));
        // The stale entry is gone after the one read
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_has_is_false_for_expired_even_with_stale_allowed() {
        let mut store = store(10, Some(10), true);
        store.set("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!store.has("k"));
    }

    #[test]
    fn test_prune_drops_only_expired_entries() {
        let mut store = store(10, Some(50), false);
        store.set("old", "1".to_string());
        std::thread::sleep(Duration::from_millis(70));
        store.set("fresh", "2".to_string());
        store.prune();
        assert_eq!(store.keys(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_inspectors() {
        let mut store = store(5, Some(1_000), true);
        store.set("k", "v".to_string());
        assert_eq!(store.item_count(), 1);
        assert_eq!(store.length(), 1);
        assert_eq!(store.max(), 5);
        assert_eq!(store.max_age(), Some(Duration::from_millis(1_000)));
        assert!(store.allow_stale());
    }

    #[test]
    fn test_no_max_age_never_expires() {
        let mut store = store(10, None, false);
        store.set("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(20));
        store.prune();
        assert_eq!(store.get("k"), Some("v".to_string()));
    }
}
