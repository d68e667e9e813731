//! Local backend - Moka in-memory cache
//!
//! Bounded concurrent cache for hot data. Eviction is approximately-LRU under
//! size pressure; TTL expiration is lazy (checked on access) with Moka's own
//! periodic maintenance as the sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use moka::notification::RemovalCause;
use tracing::debug;

use crate::config::LocalConfig;
use crate::error::{CacheError, CacheResult};
use crate::stats::{CacheStatistics, StatsRecorder};
use crate::traits::CacheContract;

/// Cache entry carrying its own expiration instant.
///
/// Moka's builder-level TTL applies uniformly to the whole cache; tracking
/// `expires_at` per entry lets the namespace default change between caches
/// sharing a backend.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() > expires_at)
    }
}

/// Bounded in-process cache backend (L1 tier).
///
/// Atomic counters are not supported: a process-local counter cannot provide
/// cluster-wide atomicity, so `increment`/`decrement` surface
/// [`CacheError::Unsupported`].
pub struct LocalBackend {
    cache: Cache<String, CacheEntry>,
    default_ttl: Option<Duration>,
    stats: Arc<StatsRecorder>,
    evictions: Arc<AtomicU64>,
}

impl LocalBackend {
    /// Build the backend from its configuration.
    #[must_use]
    pub fn new(config: &LocalConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let listener_evictions = Arc::clone(&evictions);

        let cache = Cache::builder()
            .max_capacity(config.maximum_size)
            .eviction_listener(move |_key: Arc<String>, _value: CacheEntry, cause| {
                if matches!(cause, RemovalCause::Size | RemovalCause::Expired) {
                    listener_evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        debug!(
            maximum_size = config.maximum_size,
            default_ttl_secs = config.ttl.map(|t| t.as_secs()),
            "local backend initialized"
        );

        Self {
            cache,
            default_ttl: config.ttl,
            stats: Arc::new(StatsRecorder::default()),
            evictions,
        }
    }

    /// Round-trip a probe key to verify the cache is operational.
    pub async fn health_check(&self) -> bool {
        let probe_key = "health:probe:local";
        let probe_value = Bytes::from_static(b"ok");
        if self
            .put_with_ttl(probe_key, probe_value.clone(), Duration::from_secs(60))
            .await
            .is_err()
        {
            return false;
        }
        let ok = matches!(self.get(probe_key).await, Ok(Some(v)) if v == probe_value);
        let _ = self.remove(probe_key).await;
        ok
    }

    /// Current entry count. Approximate until pending maintenance runs.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl CacheContract for LocalBackend {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        let entry = CacheEntry::new(value, self.default_ttl);
        self.cache.insert(key.to_string(), entry).await;
        self.stats.record_put();
        Ok(())
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        // Per-entry TTLs are not supported here: the entry lives under the
        // configured backend default instead.
        debug!(
            key = %key,
            requested_ttl_secs = ttl.as_secs(),
            "local backend ignores per-entry TTL; using configured default"
        );
        self.put(key, value).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        match self.cache.get(key).await {
            Some(entry) if entry.is_expired() => {
                self.cache.invalidate(key).await;
                self.stats.record_miss();
                Ok(None)
            }
            Some(entry) => {
                self.stats.record_hit();
                Ok(Some(entry.value))
            }
            None => {
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.cache.invalidate(key).await;
        self.stats.record_remove();
        Ok(())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.cache.invalidate_all();
        Ok(())
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .cache
            .get(key)
            .await
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        for (key, value) in entries {
            self.put(&key, value).await?;
        }
        Ok(())
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                result.insert(key.clone(), value);
            }
        }
        Ok(result)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        if ttl.is_some() {
            debug!(
                key = %key,
                "local backend ignores per-entry TTL; using configured default"
            );
        }
        let effective_ttl = self.default_ttl;
        if let Some(existing) = self.cache.get(key).await {
            if existing.is_expired() {
                self.cache.invalidate(key).await;
            }
        }
        let entry = self
            .cache
            .entry(key.to_string())
            .or_insert_with(async { CacheEntry::new(value, effective_ttl) })
            .await;
        let inserted = entry.is_fresh();
        if inserted {
            self.stats.record_put();
        }
        Ok(inserted)
    }

    async fn increment(&self, _key: &str, _delta: i64) -> CacheResult<i64> {
        Err(CacheError::Unsupported {
            operation: "increment",
            backend: "local",
        })
    }

    async fn decrement(&self, _key: &str, _delta: i64) -> CacheResult<i64> {
        Err(CacheError::Unsupported {
            operation: "decrement",
            backend: "local",
        })
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        // Flush pending maintenance so the iterator sees recent writes.
        self.cache.run_pending_tasks().await;
        let matching: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| Self::matches(pattern, key.as_str()))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        let removed = matching.len() as u64;
        for key in matching {
            self.cache.invalidate(&key).await;
        }
        debug!(pattern = %pattern, removed, "local backend pattern removal");
        Ok(removed)
    }

    fn statistics(&self) -> CacheStatistics {
        let mut snapshot = self.stats.snapshot("", self.cache.entry_count());
        snapshot.eviction_count += self.evictions.load(Ordering::Relaxed);
        snapshot
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
