//! In-memory result cache keyed by request fingerprint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::provider::RawResult;

/// Defines how a single request interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read from the cache if a non-expired entry is present;
    /// otherwise, call the providers and write the result to the cache. (Default)
    #[default]
    Use,
    /// Always call the providers, bypassing any cached entry,
    /// and write the new result to the cache.
    Refresh,
    /// Always call the providers and do not read from or write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        !matches!(self, Self::Bypass)
    }
}

/// Size and lifetime limits for [`ResultCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            default_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Hit, miss and eviction counters since construction or the last clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: RawResult,
    created_at: Instant,
    /// `None` when the TTL reaches past the clock's range.
    expires_at: Option<Instant>,
    sequence: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<Fingerprint, CacheEntry>,
    config: CacheConfig,
    next_sequence: u64,
}

impl CacheInner {
    fn new(config: CacheConfig) -> Self {
        Self {
            map: HashMap::new(),
            config,
            next_sequence: 0,
        }
    }

    fn put(&mut self, key: Fingerprint, value: RawResult, ttl: Duration) -> bool {
        let mut evicted = false;
        if !self.map.contains_key(&key) && self.map.len() >= self.config.max_entries {
            evicted = self.evict_oldest();
        }

        let created_at = Instant::now();
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.map.insert(
            key,
            CacheEntry {
                value,
                created_at,
                expires_at: created_at.checked_add(ttl),
                sequence,
            },
        );
        evicted
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .map
            .iter()
            .min_by_key(|(_, entry)| (entry.created_at, entry.sequence))
            .map(|(key, _)| key.clone());

        match oldest {
            Some(key) => {
                debug!(fingerprint = key.short(), "evicting oldest cache entry");
                self.map.remove(&key);
                true
            }
            None => false,
        }
    }

    fn clear_expired(&mut self) {
        let now = Instant::now();
        self.map.retain(|_, entry| entry.is_live(now));
    }
}

/// Thread-safe, size-capped cache of provider results.
///
/// Entries expire by TTL. When the cache is full the single oldest-created
/// entry is evicted before an insert; reads never promote an entry.
#[derive(Debug, Clone)]
pub struct ResultCache {
    inner: Arc<RwLock<CacheInner>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::new(config))),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a disabled cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            max_entries: 0,
            default_ttl: Duration::ZERO,
        })
    }

    /// Returns the cached value for `key` if it exists and has not expired.
    ///
    /// An entry at or past its expiry is removed and reported as a miss.
    pub async fn get(&self, key: &Fingerprint) -> Option<RawResult> {
        let now = Instant::now();
        {
            let store = self.inner.read().await;
            match store.map.get(key) {
                Some(entry) if entry.is_live(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let mut store = self.inner.write().await;
        // Another writer may have refreshed the entry in between.
        if let Some(entry) = store.map.get(key) {
            if entry.is_live(Instant::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            store.map.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `value` under `key`. `ttl` overrides the default TTL.
    ///
    /// A disabled cache (zero capacity or zero TTL) ignores the call.
    pub async fn set(&self, key: Fingerprint, value: RawResult, ttl: Option<Duration>) {
        let mut store = self.inner.write().await;
        if self.is_disabled_locked(&store) {
            return;
        }

        let ttl = ttl.unwrap_or(store.config.default_ttl);
        if ttl.is_zero() {
            return;
        }
        if store.put(key, value, ttl) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn invalidate(&self, key: &Fingerprint) -> bool {
        self.inner.write().await.map.remove(key).is_some()
    }

    /// Remove expired entries from the cache.
    pub async fn clear_expired(&self) {
        self.inner.write().await.clear_expired();
    }

    /// Clear all entries and reset the counters.
    pub async fn clear(&self) {
        self.inner.write().await.map.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    /// Number of entries, including expired ones not yet removed.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_disabled(&self) -> bool {
        let store = self.inner.read().await;
        self.is_disabled_locked(&store)
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len().await,
        }
    }

    fn is_disabled_locked(&self, store: &CacheInner) -> bool {
        store.config.max_entries == 0 || store.config.default_ttl.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::provider::Capability;

    fn key(text: &str) -> Fingerprint {
        Fingerprint::builder(Capability::ImageGeneration).text(text).build()
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = ResultCache::default();

        assert!(cache.get(&key("a")).await.is_none());

        cache.set(key("a"), json!({"url": "one"}), None).await;
        assert_eq!(cache.get(&key("a")).await, Some(json!({"url": "one"})));

        cache.set(key("a"), json!({"url": "two"}), None).await;
        assert_eq!(cache.get(&key("a")).await, Some(json!({"url": "two"})));
        assert_eq!(cache.len().await, 1);

        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_exactly_at_ttl() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 10,
            default_ttl: Duration::from_secs(60),
        });
        cache.set(key("a"), json!(1), None).await;

        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(cache.get(&key("a")).await.is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(cache.len().await, 0, "expired entry is removed on read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_override() {
        let cache = ResultCache::default();
        cache
            .set(key("a"), json!(1), Some(Duration::from_millis(100)))
            .await;

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cache.get(&key("a")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_beyond_clock_range_never_expires() {
        let cache = ResultCache::default();
        cache.set(key("a"), json!(1), Some(Duration::MAX)).await;

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert_eq!(cache.get(&key("a")).await, Some(json!(1)));

        cache.clear_expired().await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_oldest_created_entry() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 2,
            default_ttl: Duration::from_secs(60),
        });
        cache.set(key("first"), json!(1), None).await;
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.set(key("second"), json!(2), None).await;

        // Reading does not promote the oldest entry.
        assert!(cache.get(&key("first")).await.is_some());

        cache.set(key("third"), json!(3), None).await;

        assert!(cache.get(&key("first")).await.is_none());
        assert!(cache.get(&key("second")).await.is_some());
        assert!(cache.get(&key("third")).await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_eviction_breaks_ties_by_insertion_order() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 2,
            default_ttl: Duration::from_secs(60),
        });
        cache.set(key("first"), json!(1), None).await;
        cache.set(key("second"), json!(2), None).await;
        cache.set(key("third"), json!(3), None).await;

        assert!(cache.get(&key("first")).await.is_none());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = ResultCache::default();
        cache.set(key("a"), json!(1), None).await;
        cache.set(key("b"), json!(2), None).await;

        assert!(cache.invalidate(&key("a")).await);
        assert!(!cache.invalidate(&key("a")).await);
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_expired() {
        let cache = ResultCache::new(CacheConfig {
            max_entries: 10,
            default_ttl: Duration::from_millis(100),
        });
        cache.set(key("a"), json!(1), None).await;
        cache.set(key("b"), json!(2), None).await;

        tokio::time::advance(Duration::from_millis(150)).await;
        cache.clear_expired().await;

        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let cache = ResultCache::disabled();

        assert!(cache.is_disabled().await);
        cache.set(key("a"), json!(1), None).await;
        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_share_one_store() {
        let cache = ResultCache::default();
        let mut handles = Vec::new();
        for index in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.set(key(&index.to_string()), json!(index), None).await;
            }));
        }
        for handle in handles {
            handle.await.expect("writer task completes");
        }

        assert_eq!(cache.len().await, 16);
    }

    #[test]
    fn test_cache_mode_default() {
        let mode = CacheMode::default();
        assert_eq!(mode, CacheMode::Use);
        assert!(mode.reads() && mode.writes());
        assert!(!CacheMode::Refresh.reads() && CacheMode::Refresh.writes());
        assert!(!CacheMode::Bypass.writes());
    }
}
