//! Multi-tier coordinator - L1 + L2 composition
//!
//! Read-through with L1 warm-up from L2, write-through with L1-first
//! ordering, and an explicit partial-failure policy: remote failures on the
//! read and write paths are absorbed (counted and logged), local failures
//! propagate. Successful remote mutations publish eviction events so other
//! instances drop their L1 copies.
//!
//! Within one process, the L1 write happens-before the L2 write attempt, and
//! the L2 attempt happens-before the eviction publish. Divergence while L2 is
//! down is accepted; there is no outbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::eviction::{EvictionEvent, EvictionPublisher};
use crate::stats::CacheStatistics;
use crate::traits::{CacheContract, RemoteTier};

use super::LocalBackend;

/// Namespace used on events that affect every namespace at once (backend-wide
/// clear). The subscriber expands it against its own registry.
pub const ALL_NAMESPACES: &str = "*";

/// Per-tier breakdown the coordinator exposes on top of [`CacheStatistics`].
#[derive(Debug, Clone, Default)]
pub struct MultiTierStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l2_failures: u64,
    pub fallbacks: u64,
    pub warmups: u64,
}

#[derive(Debug, Default)]
struct TierCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    l2_failures: AtomicU64,
    fallbacks: AtomicU64,
    warmups: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
}

/// Coordinates a local L1 and a distributed L2 backend.
pub struct MultiTierCoordinator {
    l1: Arc<LocalBackend>,
    l2: Arc<dyn RemoteTier>,
    publisher: Option<Arc<EvictionPublisher>>,
    counters: TierCounters,
}

impl MultiTierCoordinator {
    #[must_use]
    pub fn new(
        l1: Arc<LocalBackend>,
        l2: Arc<dyn RemoteTier>,
        publisher: Option<Arc<EvictionPublisher>>,
    ) -> Self {
        Self {
            l1,
            l2,
            publisher,
            counters: TierCounters::default(),
        }
    }

    /// The local tier, shared with the eviction subscriber.
    #[must_use]
    pub fn l1(&self) -> &Arc<LocalBackend> {
        &self.l1
    }

    /// Liveness of the remote tier.
    pub async fn ping_l2(&self) -> bool {
        self.l2.ping().await
    }

    /// Per-tier hit/miss and failure breakdown.
    #[must_use]
    pub fn tier_stats(&self) -> MultiTierStats {
        MultiTierStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            l2_failures: self.counters.l2_failures.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            warmups: self.counters.warmups.load(Ordering::Relaxed),
        }
    }

    fn record_l2_failure(&self, operation: &str, key: &str, err: &CacheError) {
        self.counters.l2_failures.fetch_add(1, Ordering::Relaxed);
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation = operation,
            key = %key,
            error = %err,
            "L2 failure absorbed; serving from L1 only"
        );
    }

    /// Effective keys carry their namespace as a `<namespace>:` prefix; the
    /// eviction event must name that namespace so remote subscribers can
    /// route it.
    fn namespace_of(key: &str) -> &str {
        key.split_once(':').map_or("", |(namespace, _)| namespace)
    }

    async fn publish(&self, event: EvictionEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(&event).await;
        }
    }

    async fn warm_l1(&self, key: &str, value: &Bytes, ttl: Option<Duration>) {
        let result = match ttl {
            Some(ttl) => self.l1.put_with_ttl(key, value.clone(), ttl).await,
            None => self.l1.put(key, value.clone()).await,
        };
        match result {
            Ok(()) => {
                self.counters.warmups.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "warmed L1 from L2");
            }
            Err(err) => warn!(key = %key, error = %err, "failed to warm L1 from L2"),
        }
    }
}

#[async_trait]
impl CacheContract for MultiTierCoordinator {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        // L1 first; an L1 failure is fatal for the operation.
        self.l1.put(key, value.clone()).await?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.l2.put(key, value).await {
            self.record_l2_failure("put", key, &err);
        }
        Ok(())
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        self.l1.put_with_ttl(key, value.clone(), ttl).await?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.l2.put_with_ttl(key, value, ttl).await {
            self.record_l2_failure("put_with_ttl", key, &err);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        if let Some(value) = self.l1.get(key).await? {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(value));
        }

        match self.l2.get_with_remaining_ttl(key).await {
            Ok(Some((value, ttl))) => {
                self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                self.warm_l1(key, &value, ttl).await;
                Ok(Some(value))
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => {
                // Read-path L2 errors never propagate; the breaker above
                // works from counters, not exception flow at this layer.
                self.record_l2_failure("get", key, &err);
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.l1.remove(key).await?;
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        match self.l2.remove(key).await {
            Ok(()) => {
                if let Some(publisher) = &self.publisher {
                    self.publish(EvictionEvent::single_key(
                        Self::namespace_of(key),
                        key,
                        publisher.instance_id(),
                    ))
                    .await;
                }
                Ok(())
            }
            Err(err) => {
                self.record_l2_failure("remove", key, &err);
                Ok(())
            }
        }
    }

    async fn clear(&self) -> CacheResult<()> {
        self.l1.clear().await?;
        match self.l2.clear().await {
            Ok(()) => {
                if let Some(publisher) = &self.publisher {
                    self.publish(EvictionEvent::clear_all(
                        ALL_NAMESPACES,
                        publisher.instance_id(),
                    ))
                    .await;
                }
                Ok(())
            }
            Err(err) => {
                self.record_l2_failure("clear", "*", &err);
                Ok(())
            }
        }
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        if self.l1.contains_key(key).await? {
            return Ok(true);
        }
        match self.l2.contains_key(key).await {
            Ok(present) => Ok(present),
            Err(err) => {
                self.record_l2_failure("contains_key", key, &err);
                Ok(false)
            }
        }
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.l1.put_all(entries.clone()).await?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.l2.put_all(entries).await {
            self.record_l2_failure("put_all", "batch", &err);
        }
        Ok(())
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        let l1_results = self.l1.get_all(keys).await?;
        if l1_results.len() == keys.len() {
            self.counters
                .l1_hits
                .fetch_add(keys.len() as u64, Ordering::Relaxed);
            return Ok(l1_results);
        }

        // Fetch the full key set from L2, not just the misses: the remote
        // round trip dominates and L2 wins on duplicates anyway.
        match self.l2.get_all(keys).await {
            Ok(l2_results) => {
                self.counters
                    .l1_hits
                    .fetch_add(l1_results.len() as u64, Ordering::Relaxed);
                for (key, value) in &l2_results {
                    if !l1_results.contains_key(key) {
                        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    self.warm_l1(key, value, None).await;
                }
                let mut merged = l1_results;
                merged.extend(l2_results);
                let missing = keys.len().saturating_sub(merged.len()) as u64;
                self.counters.misses.fetch_add(missing, Ordering::Relaxed);
                Ok(merged)
            }
            Err(err) => {
                self.record_l2_failure("get_all", "batch", &err);
                Ok(l1_results)
            }
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        if self.l1.contains_key(key).await? {
            return Ok(false);
        }
        match self.l2.put_if_absent(key, value.clone(), ttl).await {
            Ok(true) => {
                self.warm_l1(key, &value, ttl).await;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                // Degraded mode: decide from L1 alone until L2 recovers.
                self.record_l2_failure("put_if_absent", key, &err);
                self.l1.put_if_absent(key, value, ttl).await
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        match self.l2.increment(key, delta).await {
            Ok(value) => {
                // Drop any L1 copy so reads go back to the authoritative L2.
                let _ = self.l1.remove(key).await;
                Ok(value)
            }
            Err(err) => {
                self.counters.l2_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "atomic increment unavailable without L2");
                Err(CacheError::Unsupported {
                    operation: "increment",
                    backend: "multi-tier",
                })
            }
        }
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        match self.l2.decrement(key, delta).await {
            Ok(value) => {
                let _ = self.l1.remove(key).await;
                Ok(value)
            }
            Err(err) => {
                self.counters.l2_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "atomic decrement unavailable without L2");
                Err(CacheError::Unsupported {
                    operation: "decrement",
                    backend: "multi-tier",
                })
            }
        }
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        let local_removed = self.l1.remove_matching(pattern).await?;
        match self.l2.remove_matching(pattern).await {
            Ok(removed) => {
                if let Some(publisher) = &self.publisher {
                    self.publish(EvictionEvent::pattern(
                        Self::namespace_of(pattern),
                        pattern,
                        publisher.instance_id(),
                    ))
                    .await;
                }
                Ok(removed)
            }
            Err(err) => {
                self.record_l2_failure("remove_matching", pattern, &err);
                Ok(local_removed)
            }
        }
    }

    fn statistics(&self) -> CacheStatistics {
        let mut snapshot = self.l1.statistics();
        let stats = self.tier_stats();
        snapshot.hit_count = stats.l1_hits + stats.l2_hits;
        snapshot.miss_count = stats.misses;
        let reads = snapshot.hit_count + snapshot.miss_count;
        #[allow(clippy::cast_precision_loss)]
        {
            snapshot.hit_rate = if reads > 0 {
                snapshot.hit_count as f64 / reads as f64
            } else {
                0.0
            };
        }
        snapshot.put_count = self.counters.puts.load(Ordering::Relaxed);
        snapshot.remove_count = self.counters.removes.load(Ordering::Relaxed);
        snapshot
    }

    fn backend_name(&self) -> &'static str {
        "multi-tier"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use crate::stats::StatsRecorder;
    use dashmap::DashMap;
    use std::sync::atomic::AtomicBool;

    /// Remote tier test double with a toggleable failure mode.
    struct MockTier {
        map: DashMap<String, Bytes>,
        failing: AtomicBool,
        stats: StatsRecorder,
    }

    impl MockTier {
        fn new() -> Self {
            Self {
                map: DashMap::new(),
                failing: AtomicBool::new(false),
                stats: StatsRecorder::default(),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> CacheResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheError::Connection {
                    host: "mock".to_string(),
                    port: 6379,
                    message: "injected failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheContract for MockTier {
        async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
            self.check()?;
            self.map.insert(key.to_string(), value);
            Ok(())
        }

        async fn put_with_ttl(&self, key: &str, value: Bytes, _ttl: Duration) -> CacheResult<()> {
            self.put(key, value).await
        }

        async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
            self.check()?;
            Ok(self.map.get(key).map(|entry| entry.value().clone()))
        }

        async fn remove(&self, key: &str) -> CacheResult<()> {
            self.check()?;
            self.map.remove(key);
            Ok(())
        }

        async fn clear(&self) -> CacheResult<()> {
            self.check()?;
            self.map.clear();
            Ok(())
        }

        async fn contains_key(&self, key: &str) -> CacheResult<bool> {
            self.check()?;
            Ok(self.map.contains_key(key))
        }

        async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
            self.check()?;
            for (key, value) in entries {
                self.map.insert(key, value);
            }
            Ok(())
        }

        async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
            self.check()?;
            Ok(keys
                .iter()
                .filter_map(|key| {
                    self.map
                        .get(key)
                        .map(|entry| (key.clone(), entry.value().clone()))
                })
                .collect())
        }

        async fn put_if_absent(
            &self,
            key: &str,
            value: Bytes,
            _ttl: Option<Duration>,
        ) -> CacheResult<bool> {
            self.check()?;
            match self.map.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(value);
                    Ok(true)
                }
            }
        }

        async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
            self.check()?;
            let mut entry = self
                .map
                .entry(key.to_string())
                .or_insert_with(|| Bytes::from_static(b"0"));
            let current: i64 = std::str::from_utf8(entry.value())
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let next = current + delta;
            *entry.value_mut() = Bytes::from(next.to_string());
            Ok(next)
        }

        async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
            self.increment(key, -delta).await
        }

        async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
            self.check()?;
            let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
            let keys: Vec<String> = self
                .map
                .iter()
                .filter(|entry| entry.key().starts_with(prefix))
                .map(|entry| entry.key().clone())
                .collect();
            let removed = keys.len() as u64;
            for key in keys {
                self.map.remove(&key);
            }
            Ok(removed)
        }

        fn statistics(&self) -> CacheStatistics {
            self.stats.snapshot("", self.map.len() as u64)
        }

        fn backend_name(&self) -> &'static str {
            "mock"
        }
    }

    #[async_trait]
    impl RemoteTier for MockTier {
        async fn get_with_remaining_ttl(
            &self,
            key: &str,
        ) -> CacheResult<Option<(Bytes, Option<Duration>)>> {
            self.check()?;
            Ok(self
                .map
                .get(key)
                .map(|entry| (entry.value().clone(), Some(Duration::from_secs(60)))))
        }

        async fn ping(&self) -> bool {
            self.check().is_ok()
        }
    }

    fn coordinator() -> (MultiTierCoordinator, Arc<MockTier>) {
        let l1 = Arc::new(LocalBackend::new(&LocalConfig::default()));
        let l2 = Arc::new(MockTier::new());
        let coordinator = MultiTierCoordinator::new(l1, Arc::clone(&l2) as Arc<dyn RemoteTier>, None);
        (coordinator, l2)
    }

    #[tokio::test]
    async fn l2_hit_warms_l1() {
        let (coordinator, l2) = coordinator();
        l2.map
            .insert("users:u2".to_string(), Bytes::from_static(b"grace"));

        // First read comes from L2 and warms L1.
        let value = coordinator.get("users:u2").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"grace")));
        let stats = coordinator.tier_stats();
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.warmups, 1);

        // Second read is an L1 hit even with L2 gone.
        l2.set_failing(true);
        let value = coordinator.get("users:u2").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"grace")));
        assert_eq!(coordinator.tier_stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn read_path_absorbs_l2_failure() {
        let (coordinator, l2) = coordinator();
        l2.set_failing(true);

        let value = coordinator.get("missing").await.unwrap();
        assert_eq!(value, None);
        let stats = coordinator.tier_stats();
        assert_eq!(stats.l2_failures, 1);
        assert_eq!(stats.fallbacks, 1);
    }

    #[tokio::test]
    async fn write_succeeds_on_l1_when_l2_is_down() {
        let (coordinator, l2) = coordinator();
        l2.set_failing(true);

        coordinator
            .put("users:u1", Bytes::from_static(b"ada"))
            .await
            .unwrap();
        // The value is readable from L1.
        assert_eq!(
            coordinator.get("users:u1").await.unwrap(),
            Some(Bytes::from_static(b"ada"))
        );
        let stats = coordinator.tier_stats();
        assert!(stats.l2_failures >= 1);
        assert!(stats.fallbacks >= 1);
    }

    #[tokio::test]
    async fn fallback_counters_strictly_increase_across_failures() {
        let (coordinator, l2) = coordinator();
        coordinator
            .put("k", Bytes::from_static(b"v"))
            .await
            .unwrap();

        l2.set_failing(true);
        let before = coordinator.tier_stats();
        // L1 still answers; the miss path is never reached.
        assert!(coordinator.get("k").await.unwrap().is_some());
        let _ = coordinator.get("other").await.unwrap();
        let after = coordinator.tier_stats();
        assert!(after.l2_failures > before.l2_failures);
        assert!(after.fallbacks > before.fallbacks);
    }

    #[tokio::test]
    async fn remove_drops_both_tiers() {
        let (coordinator, l2) = coordinator();
        coordinator
            .put("users:u1", Bytes::from_static(b"v"))
            .await
            .unwrap();
        coordinator.remove("users:u1").await.unwrap();
        assert_eq!(coordinator.get("users:u1").await.unwrap(), None);
        assert!(!l2.map.contains_key("users:u1"));
    }

    #[tokio::test]
    async fn put_if_absent_degrades_to_l1_when_l2_is_down() {
        let (coordinator, l2) = coordinator();
        l2.set_failing(true);

        assert!(coordinator
            .put_if_absent("k", Bytes::from_static(b"first"), None)
            .await
            .unwrap());
        assert!(!coordinator
            .put_if_absent("k", Bytes::from_static(b"second"), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn counters_delegate_to_l2_and_invalidate_l1() {
        let (coordinator, l2) = coordinator();
        // A stale L1 copy must not survive an increment.
        coordinator
            .put("counter", Bytes::from_static(b"0"))
            .await
            .unwrap();

        let value = coordinator.increment("counter", 5).await.unwrap();
        assert_eq!(value, 5);
        // L1 was invalidated; next read warms from L2's authoritative value.
        let bytes = coordinator.get("counter").await.unwrap();
        assert_eq!(bytes, Some(Bytes::from_static(b"5")));

        l2.set_failing(true);
        let err = coordinator.increment("counter", 1).await.unwrap_err();
        assert!(matches!(err, CacheError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn get_all_merges_tiers_with_l2_winning() {
        let (coordinator, l2) = coordinator();
        coordinator
            .put("a", Bytes::from_static(b"l1-a"))
            .await
            .unwrap();
        // L2 holds a newer value for "a" plus a key L1 never saw.
        l2.map.insert("a".to_string(), Bytes::from_static(b"l2-a"));
        l2.map.insert("b".to_string(), Bytes::from_static(b"l2-b"));

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = coordinator.get_all(&keys).await.unwrap();
        assert_eq!(result.get("a"), Some(&Bytes::from_static(b"l2-a")));
        assert_eq!(result.get("b"), Some(&Bytes::from_static(b"l2-b")));
        assert!(!result.contains_key("c"));
    }

    #[tokio::test]
    async fn get_all_falls_back_to_l1_results() {
        let (coordinator, l2) = coordinator();
        coordinator
            .put("a", Bytes::from_static(b"v"))
            .await
            .unwrap();
        l2.set_failing(true);

        let keys = vec!["a".to_string(), "b".to_string()];
        let result = coordinator.get_all(&keys).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("a"));
        assert!(coordinator.tier_stats().fallbacks >= 1);
    }

    #[tokio::test]
    async fn namespace_is_derived_from_effective_key() {
        assert_eq!(MultiTierCoordinator::namespace_of("users:u1"), "users");
        assert_eq!(MultiTierCoordinator::namespace_of("plain"), "");
    }
}
