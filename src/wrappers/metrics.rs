//! Metrics wrapper - latency timers and hit/miss counters
//!
//! Wraps each operation with a timer and counts outcomes, tagged with
//! `{cache, namespace, operation, status}`. Also owns the per-namespace
//! [`StatsRecorder`] that backs `getStatistics()` snapshots and emits one
//! structured log line per operation carrying the ambient correlation id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::CacheResult;
use crate::observability::{current_correlation_id, metric_names};
use crate::stats::{CacheStatistics, StatsRecorder};
use crate::traits::CacheContract;

const CACHE_LABEL: &str = "strata";

pub struct MetricsWrapper {
    inner: Arc<dyn CacheContract>,
    namespace: String,
    recorder: Arc<StatsRecorder>,
}

impl MetricsWrapper {
    #[must_use]
    pub fn new(
        inner: Arc<dyn CacheContract>,
        namespace: &str,
        recorder: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            inner,
            namespace: namespace.to_string(),
            recorder,
        }
    }

    fn count(&self, name: &'static str, operation: &'static str, status: &'static str) {
        metrics::counter!(
            name,
            "cache" => CACHE_LABEL,
            "namespace" => self.namespace.clone(),
            "operation" => operation,
            "status" => status,
        )
        .increment(1);
    }

    fn time(&self, timer: &'static str, elapsed: Duration) {
        metrics::histogram!(
            timer,
            "cache" => CACHE_LABEL,
            "namespace" => self.namespace.clone(),
        )
        .record(elapsed.as_secs_f64());
    }

    fn log(&self, operation: &'static str, key: &str, elapsed: Duration) {
        debug!(
            correlation_id = %current_correlation_id(),
            cache = CACHE_LABEL,
            namespace = %self.namespace,
            operation = operation,
            key = %key,
            duration_ms = elapsed.as_millis() as u64,
            "cache operation"
        );
    }

    fn observe_error(&self, operation: &'static str) {
        self.recorder.record_error();
        self.count(metric_names::ERRORS, operation, "error");
    }
}

#[async_trait]
impl CacheContract for MetricsWrapper {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        let start = Instant::now();
        let result = self.inner.put(key, value).await;
        let elapsed = start.elapsed();
        self.time(metric_names::PUT_TIMER, elapsed);
        self.recorder.record_put_latency(elapsed);
        match &result {
            Ok(()) => {
                self.recorder.record_put();
                self.count(metric_names::PUTS, "put", "ok");
            }
            Err(_) => self.observe_error("put"),
        }
        self.log("put", key, elapsed);
        result
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let start = Instant::now();
        let result = self.inner.put_with_ttl(key, value, ttl).await;
        let elapsed = start.elapsed();
        self.time(metric_names::PUT_TIMER, elapsed);
        self.recorder.record_put_latency(elapsed);
        match &result {
            Ok(()) => {
                self.recorder.record_put();
                self.count(metric_names::PUTS, "put", "ok");
            }
            Err(_) => self.observe_error("put"),
        }
        self.log("put", key, elapsed);
        result
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let start = Instant::now();
        let result = self.inner.get(key).await;
        let elapsed = start.elapsed();
        self.time(metric_names::GET_TIMER, elapsed);
        self.recorder.record_get_latency(elapsed);
        match &result {
            Ok(Some(_)) => {
                self.recorder.record_hit();
                self.count(metric_names::HITS, "get", "hit");
            }
            Ok(None) => {
                self.recorder.record_miss();
                self.count(metric_names::MISSES, "get", "miss");
            }
            Err(_) => self.observe_error("get"),
        }
        self.log("get", key, elapsed);
        result
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        let start = Instant::now();
        let result = self.inner.remove(key).await;
        let elapsed = start.elapsed();
        self.time(metric_names::REMOVE_TIMER, elapsed);
        match &result {
            Ok(()) => {
                self.recorder.record_remove();
                self.count(metric_names::REMOVES, "remove", "ok");
            }
            Err(_) => self.observe_error("remove"),
        }
        self.log("remove", key, elapsed);
        result
    }

    async fn clear(&self) -> CacheResult<()> {
        let start = Instant::now();
        let result = self.inner.clear().await;
        match &result {
            Ok(()) => self.count(metric_names::REMOVES, "clear", "ok"),
            Err(_) => self.observe_error("clear"),
        }
        self.log("clear", "*", start.elapsed());
        result
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        let result = self.inner.contains_key(key).await;
        if result.is_err() {
            self.observe_error("contains_key");
        }
        result
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        let start = Instant::now();
        let result = self.inner.put_all(entries).await;
        let elapsed = start.elapsed();
        self.time(metric_names::PUT_ALL_TIMER, elapsed);
        self.recorder.record_put_latency(elapsed);
        match &result {
            Ok(()) => {
                self.recorder.record_put();
                self.count(metric_names::PUTS, "put_all", "ok");
            }
            Err(_) => self.observe_error("put_all"),
        }
        self.log("put_all", "batch", elapsed);
        result
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        let start = Instant::now();
        let result = self.inner.get_all(keys).await;
        let elapsed = start.elapsed();
        self.time(metric_names::GET_ALL_TIMER, elapsed);
        self.recorder.record_get_latency(elapsed);
        match &result {
            Ok(found) => {
                for _ in 0..found.len() {
                    self.recorder.record_hit();
                }
                for _ in found.len()..keys.len() {
                    self.recorder.record_miss();
                }
                self.count(metric_names::HITS, "get_all", "ok");
            }
            Err(_) => self.observe_error("get_all"),
        }
        self.log("get_all", "batch", elapsed);
        result
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let start = Instant::now();
        let result = self.inner.put_if_absent(key, value, ttl).await;
        let elapsed = start.elapsed();
        self.time(metric_names::PUT_TIMER, elapsed);
        match &result {
            Ok(true) => {
                self.recorder.record_put();
                self.count(metric_names::PUTS, "put_if_absent", "ok");
            }
            Ok(false) => self.count(metric_names::PUTS, "put_if_absent", "skipped"),
            Err(_) => self.observe_error("put_if_absent"),
        }
        self.log("put_if_absent", key, elapsed);
        result
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let result = self.inner.increment(key, delta).await;
        if result.is_err() {
            self.observe_error("increment");
        }
        result
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let result = self.inner.decrement(key, delta).await;
        if result.is_err() {
            self.observe_error("decrement");
        }
        result
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        let start = Instant::now();
        let result = self.inner.remove_matching(pattern).await;
        match &result {
            Ok(_) => self.count(metric_names::REMOVES, "remove_matching", "ok"),
            Err(_) => self.observe_error("remove_matching"),
        }
        self.log("remove_matching", pattern, start.elapsed());
        result
    }

    fn statistics(&self) -> CacheStatistics {
        let inner = self.inner.statistics();
        let mut snapshot = self.recorder.snapshot(&self.namespace, inner.current_size);
        snapshot.eviction_count = inner.eviction_count;
        metrics::gauge!(
            metric_names::HIT_RATE,
            "cache" => CACHE_LABEL,
            "namespace" => self.namespace.clone(),
        )
        .set(snapshot.hit_rate);
        snapshot
    }

    fn backend_name(&self) -> &'static str {
        "metrics"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalBackend;
    use crate::config::LocalConfig;

    fn wrapped() -> MetricsWrapper {
        let backend = Arc::new(LocalBackend::new(&LocalConfig::default()));
        MetricsWrapper::new(
            backend as Arc<dyn CacheContract>,
            "users",
            Arc::new(StatsRecorder::default()),
        )
    }

    #[tokio::test]
    async fn hits_and_misses_reach_the_recorder() {
        let cache = wrapped();
        cache.put("u1", Bytes::from_static(b"ada")).await.unwrap();
        let _ = cache.get("u1").await.unwrap();
        let _ = cache.get("absent").await.unwrap();

        let stats = cache.statistics();
        assert_eq!(stats.namespace, "users");
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.put_count, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn latencies_are_observed() {
        let cache = wrapped();
        cache.put("k", Bytes::from_static(b"v")).await.unwrap();
        let _ = cache.get("k").await.unwrap();
        let stats = cache.statistics();
        assert!(stats.get_latency_p99_ms >= stats.get_latency_p50_ms);
    }

    #[tokio::test]
    async fn errors_are_counted() {
        let cache = wrapped();
        // Counters are unsupported on the local backend below.
        let _ = cache.increment("n", 1).await;
        assert_eq!(cache.statistics().error_count, 1);
    }

    #[tokio::test]
    async fn batch_reads_count_partial_hits() {
        let cache = wrapped();
        cache.put("a", Bytes::from_static(b"1")).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string()];
        let _ = cache.get_all(&keys).await.unwrap();
        let stats = cache.statistics();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }
}
