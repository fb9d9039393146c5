//! Generic moka-backed cache layer, grounded directly on
//! `store::cache::CacheLayer`: values are serialized to JSON strings so any
//! `Serialize + DeserializeOwned` type shares the same cache plumbing, and
//! hit/miss counters are tracked alongside.
//!
//! `adk-semantic`'s embedding cache is built the same way (a
//! `moka::future::Cache` with hit/miss counters) but against `Embedding`
//! directly rather than through this generic JSON-string layer — the two
//! are independent instances of the same idiom, not a shared dependency,
//! matching the teacher's own split between `store::cache::CacheLayer` and
//! the ad-hoc caching `agent`'s embedding paths do for themselves.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Hit/miss counters for a `CacheLayer`.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

/// A generic, async-aware cache over JSON-serializable values.
pub struct CacheLayer<T> {
    name: &'static str,
    inner: Cache<String, String>,
    stats: Arc<CacheStats>,
    _marker: PhantomData<T>,
}

impl<T> Clone for CacheLayer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
            _marker: PhantomData,
        }
    }
}

impl<T> CacheLayer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            name,
            inner: Cache::builder().max_capacity(max_capacity).time_to_live(ttl).build(),
            stats: Arc::new(CacheStats::default()),
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        match self.inner.get(key).await {
            Some(json) => match serde_json::from_str::<T>(&json) {
                Ok(val) => {
                    self.stats.record_hit();
                    Some(val)
                }
                Err(err) => {
                    tracing::warn!(cache = self.name, key, %err, "cache entry deserialization failed, evicting");
                    self.inner.invalidate(key).await;
                    self.stats.record_miss();
                    None
                }
            },
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    pub async fn insert(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => {
                self.inner.insert(key.to_string(), json).await;
                debug!(cache = self.name, key, "cache insert");
            }
            Err(err) => tracing::warn!(cache = self.name, key, %err, "cache value serialization failed"),
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Single-flight-adjacent convenience: check the cache, and on miss run
    /// `loader` and populate. Not itself coalescing concurrent misses for
    /// the same key (that guarantee lives in `adk-semantic::EmbeddingService`
    /// via `moka::try_get_with`); this helper is for callers that only need
    /// the simpler get-or-compute shape.
    pub async fn get_or_insert_with<F, Fut>(&self, key: &str, loader: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        if let Some(cached) = self.get(key).await {
            return cached;
        }
        let value = loader().await;
        self.insert(key, &value).await;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn miss_then_hit_updates_stats() {
        let cache: CacheLayer<String> = CacheLayer::new("test", 100, Duration::from_secs(60));
        assert!(cache.get("k1").await.is_none());
        cache.insert("k1", &"value".to_string()).await;
        assert_eq!(cache.get("k1").await.unwrap(), "value");
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_a_future_miss() {
        let cache: CacheLayer<i32> = CacheLayer::new("test", 100, Duration::from_secs(60));
        cache.insert("k1", &42).await;
        cache.invalidate("k1").await;
        assert!(cache.get("k1").await.is_none());
    }

    #[tokio::test]
    async fn get_or_insert_with_only_loads_once_per_key() {
        let cache: CacheLayer<i32> = CacheLayer::new("test", 100, Duration::from_secs(60));
        let first = cache.get_or_insert_with("k1", || async { 7 }).await;
        let second = cache.get_or_insert_with("k1", || async { 99 }).await;
        assert_eq!(first, 7);
        assert_eq!(second, 7);
    }
}
