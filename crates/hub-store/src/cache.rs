//! Hot cache layer using [`moka`].
//!
//! Used for values that are expensive to recompute but cheap to invalidate
//! wholesale, such as the flattened permission set for a combination of
//! groups. Every lookup is counted so operators can see whether the cache
//! pulls its weight.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

// ── cache stats ──────────────────────────────────────────────────────

/// Hit/miss counters.
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

    /// Hit rate between 0.0 and 1.0 (0.0 with no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── hot cache ────────────────────────────────────────────────────────

/// A named, bounded, TTL-limited async cache keyed by string.
pub struct HotCache<T> {
    name: &'static str,
    inner: Cache<String, T>,
    stats: Arc<CacheStats>,
}

impl<T> Clone for HotCache<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> HotCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `max_capacity` entries for `ttl`.
    pub fn new(name: &'static str, max_capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        debug!(cache = name, max_capacity, ttl_secs = ttl.as_secs(), "hot cache created");

        Self {
            name,
            inner,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Look up a value. Returns `None` on miss.
    pub async fn get(&self, key: &str) -> Option<T> {
        match self.inner.get(key).await {
            Some(v) => {
                self.stats.record_hit();
                Some(v)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    pub async fn insert(&self, key: impl Into<String>, value: T) {
        self.inner.insert(key.into(), value).await;
    }

    /// Drop every entry, e.g. after the underlying configuration changed.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
        debug!(cache = self.name, "cache invalidated");
    }

    /// Return the cached value or compute, cache, and return it. Errors from
    /// `loader` are passed through and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, loader: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let value = loader().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

// ── tests ────────────────────────────────────────────────────────────
