//! TTL + LRU cache for assembled contexts.
//!
//! Entries expire `ttl` after insertion (or never, when neither a per-entry
//! nor a default TTL is set). When the cache is full, inserting a new key
//! evicts the least-recently-used entry; reads refresh recency.
//!
//! All state lives behind one `std::sync::Mutex`. A poisoned lock is
//! recovered rather than propagated.
//!
//! ```text
//! entries: key ─▶ (value, expires_at, seq)
//! order:   seq ─▶ key          (smallest seq = least recently used)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Applied when `set` is called without an explicit TTL.
    pub default_ttl: Option<Duration>,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(Duration::from_secs(300)),
            max_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub size: usize,
    pub max_size: usize,
    /// `hits / (hits + misses)`, `0.0` before the first lookup.
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    expires_at: Option<Instant>,
    seq: u64,
    metadata: Option<Value>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expired: 0,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
            self.evictions += 1;
            debug!(key = %key, "Evicted least recently used cache entry");
        }
    }

    /// Look up a live entry, deleting it if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry<V>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            let age_ms = now.duration_since(entry.created_at).as_millis() as u64;
            trace!(key, age_ms, "Cache entry expired");
            self.remove(key);
            self.expired += 1;
            return None;
        }
        self.entries.get_mut(key)
    }
}

pub struct TtlCache<V> {
    inner: Mutex<Inner<V>>,
    config: CacheConfig,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();
        let seq = inner.bump();

        let Some(entry) = inner.live(key, now) else {
            inner.misses += 1;
            trace!(key, "Cache miss");
            return None;
        };
        let old_seq = std::mem::replace(&mut entry.seq, seq);
        let value = entry.value.clone();

        inner.order.remove(&old_seq);
        inner.order.insert(seq, key.to_string());
        inner.hits += 1;
        trace!(key, "Cache hit");
        Some(value)
    }

    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.insert(key, value, ttl, None);
    }

    pub fn set_with_metadata(&self, key: &str, value: V, ttl: Option<Duration>, metadata: Value) {
        self.insert(key, value, ttl, Some(metadata));
    }

    fn insert(&self, key: &str, value: V, ttl: Option<Duration>, metadata: Option<Value>) {
        let mut inner = self.lock();
        let now = Instant::now();

        if inner.remove(key).is_none() && inner.entries.len() >= self.config.max_size {
            inner.evict_lru();
        }

        let seq = inner.bump();
        let expires_at = ttl.or(self.config.default_ttl).map(|t| now + t);
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                expires_at,
                seq,
                metadata,
            },
        );
        inner.order.insert(seq, key.to_string());
        trace!(key, "Cache insert");
    }

    /// Returns true when the key was present.
    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry and reset statistics.
    pub fn clear(&self) {
        *self.lock() = Inner::new();
    }

    pub fn get_many(&self, keys: &[&str]) -> HashMap<String, V> {
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| (k.to_string(), v)))
            .collect()
    }

    pub fn set_many(&self, items: impl IntoIterator<Item = (String, V)>, ttl: Option<Duration>) {
        for (key, value) in items {
            self.set(&key, value, ttl);
        }
    }

    /// Metadata stored with a live entry. Does not count as a hit or miss.
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        let mut inner = self.lock();
        inner.live(key, Instant::now())?.metadata.clone()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.remove(key);
        }
        inner.expired += stale.len() as u64;
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expired: inner.expired,
            size: inner.entries.len(),
            max_size: self.config.max_size,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
    /// Start a background task that purges expired entries every `interval`.
    ///
    /// The task holds only a weak reference and exits on its own once the
    /// cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cache: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Cache sweep removed expired entries");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            trace!("Cache sweeper stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "Cache sweeper started");
        SweepHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }
}

/// Owns the background sweep task. Dropping it stops the sweep.
pub struct SweepHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Signal the sweeper and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Cache sweeper ended abnormally");
            }
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_size: usize, ttl: Option<Duration>) -> TtlCache<String> {
        TtlCache::new(CacheConfig {
            default_ttl: ttl,
            max_size,
        })
    }

    #[test]
    fn test_get_set_and_stats() {
        let c = cache(10, None);
        c.set("a", "1".into(), None);
        assert_eq!(c.get("a").as_deref(), Some("1"));
        assert_eq!(c.get("b"), None);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.max_size, 10);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_lru_eviction_respects_reads() {
        let c = cache(2, None);
        c.set("a", "1".into(), None);
        c.set("b", "2".into(), None);
        assert!(c.get("a").is_some());
        c.set("c", "3".into(), None);

        assert!(c.get("b").is_none());
        assert!(c.get("a").is_some());
        assert!(c.get("c").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let c = cache(2, None);
        c.set("a", "1".into(), None);
        c.set("b", "2".into(), None);
        c.set("a", "3".into(), None);
        assert_eq!(c.len(), 2);
        assert_eq!(c.stats().evictions, 0);
        assert_eq!(c.get("a").as_deref(), Some("3"));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let c = cache(10, Some(Duration::from_millis(20)));
        c.set("a", "1".into(), None);
        c.set("b", "2".into(), Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(c.get("a"), None);
        assert!(c.get("b").is_some());
        let stats = c.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let c = cache(10, None);
        c.set("a", "1".into(), None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(c.purge_expired(), 0);
        assert!(c.get("a").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let c = cache(10, None);
        c.set("a", "1".into(), Some(Duration::from_millis(10)));
        c.set("b", "2".into(), Some(Duration::from_millis(10)));
        c.set("c", "3".into(), None);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(c.purge_expired(), 2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.stats().expired, 2);
    }

    #[test]
    fn test_metadata_and_bulk_ops() {
        let c = cache(10, None);
        c.set_with_metadata("a", "1".into(), None, json!({"source": "loki"}));
        assert_eq!(c.get_metadata("a"), Some(json!({"source": "loki"})));
        assert_eq!(c.get_metadata("missing"), None);

        c.set_many(vec![("b".to_string(), "2".to_string()), ("c".to_string(), "3".to_string())], None);
        let found = c.get_many(&["a", "b", "zzz"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], "2");
    }

    #[test]
    fn test_delete_and_clear() {
        let c = cache(10, None);
        c.set("a", "1".into(), None);
        assert!(c.delete("a"));
        assert!(!c.delete("a"));
        c.set("b", "2".into(), None);
        c.get("b");
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_sweeper_purges_and_shuts_down() {
        let c = Arc::new(cache(10, Some(Duration::from_millis(10))));
        c.set("a", "1".into(), None);
        let handle = c.spawn_sweeper(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(c.len(), 0);
        assert_eq!(c.stats().expired, 1);

        handle.shutdown().await;
    }
}
