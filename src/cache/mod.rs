//! # Document Cache
//!
//! Process-wide TTL cache of documents keyed by `doc:{collection}:{objectId}`.
//!
//! - Reads evict expired entries lazily, only when they discover them
//! - `set` is first-writer-wins while an entry is live
//! - Every committed mutation calls `invalidate` for the affected documents
//! - A global switch disables the cache entirely (`get` misses, `set` no-ops)
//!
//! Values are immutable snapshots; callers receive clones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::info;

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Build the cache key for a document
pub fn cache_key(collection: &str, object_id: &str) -> String {
    format!("doc:{}:{}", collection, object_id)
}

/// A cached document
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cached document
    pub value: Value,
    /// Instant after which the entry is dead
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Passive cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// TTL document cache
#[derive(Debug)]
pub struct DocumentCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DocumentCache {
    /// Create an enabled cache with the given entry lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Create a cache that starts disabled
    pub fn disabled(ttl: Duration) -> Self {
        let cache = Self::new(ttl);
        cache.enabled.store(false, Ordering::SeqCst);
        cache
    }

    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry
    pub fn get(&self, collection: &str, object_id: &str) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }

        let key = cache_key(collection, object_id);
        let now = Instant::now();

        let expired = {
            let entries = self.entries.read().ok()?;
            match entries.get(&key) {
                Some(entry) if entry.is_live(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            if let Ok(mut entries) = self.entries.write() {
                // Re-check under the write lock; a fresh set may have landed
                if entries.get(&key).is_some_and(|e| !e.is_live(now)) {
                    entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value unless a live entry already exists
    pub fn set(&self, collection: &str, object_id: &str, value: Value) {
        if !self.is_enabled() {
            return;
        }

        let key = cache_key(collection, object_id);
        let now = Instant::now();

        if let Ok(mut entries) = self.entries.write() {
            if entries.get(&key).is_some_and(|e| e.is_live(now)) {
                return;
            }
            entries.insert(
                key,
                CacheEntry {
                    value,
                    expires_at: now + self.ttl,
                },
            );
        }
    }

    /// Remove an entry regardless of remaining lifetime
    pub fn invalidate(&self, collection: &str, object_id: &str) -> bool {
        let key = cache_key(collection, object_id);
        let removed = self
            .entries
            .write()
            .map(|mut entries| entries.remove(&key).is_some())
            .unwrap_or(false);
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry of a collection whose value matches the predicate.
    /// Returns the number of removed entries.
    pub fn invalidate_where<F>(&self, collection: &str, predicate: F) -> usize
    where
        F: Fn(&Value) -> bool,
    {
        let prefix = format!("doc:{}:", collection);
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };

        let before = entries.len();
        entries.retain(|key, entry| !(key.starts_with(&prefix) && predicate(&entry.value)));
        let removed = before - entries.len();

        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Turn the cache on
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("document cache enabled");
        }
    }

    /// Turn the cache off and drop every entry
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            self.clear();
            info!("document cache disabled");
        }
    }

    /// Whether the cache is on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Drop every entry
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Number of stored entries (expired ones included until read)
    pub fn size(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Stored keys
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored values
    pub fn values(&self) -> Vec<Value> {
        self.entries
            .read()
            .map(|e| e.values().map(|entry| entry.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Stored entries
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .read()
            .map(|e| e.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    #[test]
    fn test_set_then_get() {
        let cache = DocumentCache::default();
        let doc = json!({"objectId": "abcdefghij", "name": "a"});
        cache.set("User", "abcdefghij", doc.clone());
        assert_eq!(cache.get("User", "abcdefghij"), Some(doc));
        assert_eq!(cache.keys(), vec!["doc:User:abcdefghij".to_string()]);
    }

    #[test]
    fn test_expired_entry_misses_and_is_evicted_lazily() {
        let cache = DocumentCache::new(Duration::from_millis(20));
        cache.set("User", "abcdefghij", json!({"n": 1}));
        sleep(Duration::from_millis(21));

        // Still stored until a read discovers it
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get("User", "abcdefghij"), None);
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_first_writer_wins() {
        let cache = DocumentCache::default();
        cache.set("Post", "abcdefghij", json!({"v": 1}));
        cache.set("Post", "abcdefghij", json!({"v": 2}));
        assert_eq!(cache.get("Post", "abcdefghij"), Some(json!({"v": 1})));
    }

    #[test]
    fn test_set_replaces_expired_entry() {
        let cache = DocumentCache::new(Duration::from_millis(10));
        cache.set("Post", "abcdefghij", json!({"v": 1}));
        sleep(Duration::from_millis(11));
        cache.set("Post", "abcdefghij", json!({"v": 2}));
        assert_eq!(cache.get("Post", "abcdefghij"), Some(json!({"v": 2})));
    }

    #[test]
    fn test_invalidate_forces_miss() {
        let cache = DocumentCache::default();
        cache.set("Post", "abcdefghij", json!({"v": 1}));
        assert!(cache.invalidate("Post", "abcdefghij"));
        assert_eq!(cache.get("Post", "abcdefghij"), None);
        assert!(!cache.invalidate("Post", "abcdefghij"));
    }

    #[test]
    fn test_invalidate_where_scoped_to_collection() {
        let cache = DocumentCache::default();
        cache.set("Session", "s1", json!({"_p_user": "User$abcdefghij"}));
        cache.set("Session", "s2", json!({"_p_user": "User$zzzzzzzzzz"}));
        cache.set("Post", "p1", json!({"_p_user": "User$abcdefghij"}));

        let removed = cache.invalidate_where("Session", |v| {
            v.get("_p_user") == Some(&json!("User$abcdefghij"))
        });
        assert_eq!(removed, 1);
        assert!(cache.get("Session", "s1").is_none());
        assert!(cache.get("Session", "s2").is_some());
        assert!(cache.get("Post", "p1").is_some());
    }

    #[test]
    fn test_disable_switch() {
        let cache = DocumentCache::default();
        cache.set("Post", "abcdefghij", json!({"v": 1}));
        cache.disable();
        assert!(cache.is_empty());

        cache.set("Post", "abcdefghij", json!({"v": 1}));
        assert_eq!(cache.get("Post", "abcdefghij"), None);

        cache.enable();
        cache.set("Post", "abcdefghij", json!({"v": 1}));
        assert!(cache.get("Post", "abcdefghij").is_some());
    }
}
