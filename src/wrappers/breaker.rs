//! Circuit breaker wrapper
//!
//! Count-based sliding window over call outcomes. When the observed failure
//! rate crosses the configured threshold (after a minimum number of calls),
//! the circuit opens: reads are answered by the optional fallback cache (or
//! come back empty), writes fail fast with `CircuitOpen`. After the open-wait
//! elapses the breaker probes in half-open state and closes again on
//! consecutive successes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{CacheError, CacheResult};
use crate::observability::metric_names;
use crate::stats::CacheStatistics;
use crate::traits::CacheContract;

/// Consecutive half-open successes needed to close the circuit again.
const HALF_OPEN_SUCCESS_TARGET: u32 = 3;

/// Breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Window {
    // true marks a failure
    outcomes: VecDeque<bool>,
    half_open_successes: u32,
}

pub struct CircuitBreakerWrapper {
    inner: Arc<dyn CacheContract>,
    /// Consulted for reads while the circuit is open; typically the L1 tier
    /// when this wrapper guards a remote-backed chain.
    fallback: Option<Arc<dyn CacheContract>>,
    namespace: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    opened_at: RwLock<Instant>,
    window: Mutex<Window>,
}

impl CircuitBreakerWrapper {
    #[must_use]
    pub fn new(
        inner: Arc<dyn CacheContract>,
        fallback: Option<Arc<dyn CacheContract>>,
        namespace: &str,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            inner,
            fallback,
            namespace: namespace.to_string(),
            config,
            state: RwLock::new(BreakerState::Closed),
            opened_at: RwLock::new(Instant::now()),
            window: Mutex::new(Window {
                outcomes: VecDeque::new(),
                half_open_successes: 0,
            }),
        }
    }

    /// Current state, transitioning open -> half-open when the wait elapsed.
    pub fn state(&self) -> BreakerState {
        let state = *self.state.read();
        if state == BreakerState::Open
            && self.opened_at.read().elapsed() >= self.config.wait_duration_in_open_state
        {
            self.transition(BreakerState::HalfOpen);
            return BreakerState::HalfOpen;
        }
        state
    }

    fn transition(&self, next: BreakerState) {
        let mut state = self.state.write();
        if *state == next {
            return;
        }
        info!(
            namespace = %self.namespace,
            from = ?*state,
            to = ?next,
            "circuit breaker state change"
        );
        *state = next;
        match next {
            BreakerState::Open => *self.opened_at.write() = Instant::now(),
            BreakerState::Closed | BreakerState::HalfOpen => {
                let mut window = self.window.lock();
                window.outcomes.clear();
                window.half_open_successes = 0;
            }
        }
    }

    /// Gate a call. `Err(CircuitOpen)` while the circuit rejects traffic.
    fn allow(&self) -> CacheResult<()> {
        match self.state() {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => Err(CacheError::CircuitOpen {
                namespace: self.namespace.clone(),
            }),
        }
    }

    fn on_success(&self) {
        match *self.state.read() {
            BreakerState::HalfOpen => {
                let close = {
                    let mut window = self.window.lock();
                    window.half_open_successes += 1;
                    window.half_open_successes >= HALF_OPEN_SUCCESS_TARGET
                };
                if close {
                    self.transition(BreakerState::Closed);
                }
            }
            BreakerState::Closed => self.record(false),
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        match *self.state.read() {
            BreakerState::HalfOpen => {
                warn!(namespace = %self.namespace, "half-open probe failed; reopening circuit");
                self.transition(BreakerState::Open);
            }
            BreakerState::Closed => {
                self.record(true);
                self.evaluate();
            }
            BreakerState::Open => {}
        }
    }

    fn record(&self, failure: bool) {
        let mut window = self.window.lock();
        window.outcomes.push_back(failure);
        while window.outcomes.len() > self.config.sliding_window_size {
            window.outcomes.pop_front();
        }
    }

    fn evaluate(&self) {
        let should_open = {
            let window = self.window.lock();
            let calls = window.outcomes.len() as u64;
            if calls < self.config.minimum_number_of_calls {
                false
            } else {
                let failures = window.outcomes.iter().filter(|f| **f).count();
                #[allow(clippy::cast_precision_loss)]
                let rate = failures as f64 / window.outcomes.len() as f64 * 100.0;
                rate >= self.config.failure_rate_threshold
            }
        };
        if should_open {
            self.transition(BreakerState::Open);
        }
    }

    /// Whether an error should count against the failure rate. Unsupported
    /// operations and open-circuit rejections say nothing about backend
    /// health.
    fn counts_as_failure(err: &CacheError) -> bool {
        !matches!(
            err,
            CacheError::Unsupported { .. } | CacheError::CircuitOpen { .. }
        )
    }

    fn observe<T>(&self, result: &CacheResult<T>) {
        match result {
            Ok(_) => self.on_success(),
            Err(err) if Self::counts_as_failure(err) => self.on_failure(),
            Err(_) => {}
        }
    }

    fn record_fallback(&self) {
        metrics::counter!(
            metric_names::BREAKER_FALLBACK,
            "namespace" => self.namespace.clone(),
        )
        .increment(1);
    }
}

#[async_trait]
impl CacheContract for CircuitBreakerWrapper {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        self.allow()?;
        let result = self.inner.put(key, value).await;
        self.observe(&result);
        result
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        self.allow()?;
        let result = self.inner.put_with_ttl(key, value, ttl).await;
        self.observe(&result);
        result
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        if self.allow().is_err() {
            // Open circuit: reads degrade to the fallback cache or empty.
            self.record_fallback();
            if let Some(fallback) = &self.fallback {
                return fallback.get(key).await;
            }
            return Ok(None);
        }
        let result = self.inner.get(key).await;
        self.observe(&result);
        result
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.allow()?;
        let result = self.inner.remove(key).await;
        self.observe(&result);
        result
    }

    async fn clear(&self) -> CacheResult<()> {
        self.allow()?;
        let result = self.inner.clear().await;
        self.observe(&result);
        result
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        if self.allow().is_err() {
            self.record_fallback();
            if let Some(fallback) = &self.fallback {
                return fallback.contains_key(key).await;
            }
            return Ok(false);
        }
        let result = self.inner.contains_key(key).await;
        self.observe(&result);
        result
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        self.allow()?;
        let result = self.inner.put_all(entries).await;
        self.observe(&result);
        result
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        if self.allow().is_err() {
            self.record_fallback();
            if let Some(fallback) = &self.fallback {
                return fallback.get_all(keys).await;
            }
            return Ok(HashMap::new());
        }
        let result = self.inner.get_all(keys).await;
        self.observe(&result);
        result
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.allow()?;
        let result = self.inner.put_if_absent(key, value, ttl).await;
        self.observe(&result);
        result
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.allow()?;
        let result = self.inner.increment(key, delta).await;
        self.observe(&result);
        result
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.allow()?;
        let result = self.inner.decrement(key, delta).await;
        self.observe(&result);
        result
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        self.allow()?;
        let result = self.inner.remove_matching(pattern).await;
        self.observe(&result);
        result
    }

    fn statistics(&self) -> CacheStatistics {
        self.inner.statistics()
    }

    fn backend_name(&self) -> &'static str {
        "circuit-breaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalBackend;
    use crate::config::LocalConfig;
    use crate::stats::StatsRecorder;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Inner cache that fails every operation while `failing` is set.
    struct FlakyCache {
        failing: AtomicBool,
        stats: StatsRecorder,
    }

    impl FlakyCache {
        fn new(failing: bool) -> Self {
            Self {
                failing: AtomicBool::new(failing),
                stats: StatsRecorder::default(),
            }
        }

        fn check(&self) -> CacheResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheError::Connection {
                    host: "flaky".to_string(),
                    port: 0,
                    message: "down".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheContract for FlakyCache {
        async fn put(&self, _key: &str, _value: Bytes) -> CacheResult<()> {
            self.check()
        }
        async fn put_with_ttl(&self, _key: &str, _value: Bytes, _ttl: Duration) -> CacheResult<()> {
            self.check()
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<Bytes>> {
            self.check().map(|()| None)
        }
        async fn remove(&self, _key: &str) -> CacheResult<()> {
            self.check()
        }
        async fn clear(&self) -> CacheResult<()> {
            self.check()
        }
        async fn contains_key(&self, _key: &str) -> CacheResult<bool> {
            self.check().map(|()| false)
        }
        async fn put_all(&self, _entries: Vec<(String, Bytes)>) -> CacheResult<()> {
            self.check()
        }
        async fn get_all(&self, _keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
            self.check().map(|()| HashMap::new())
        }
        async fn put_if_absent(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Option<Duration>,
        ) -> CacheResult<bool> {
            self.check().map(|()| true)
        }
        async fn increment(&self, _key: &str, _delta: i64) -> CacheResult<i64> {
            self.check().map(|()| 0)
        }
        async fn decrement(&self, _key: &str, _delta: i64) -> CacheResult<i64> {
            self.check().map(|()| 0)
        }
        fn statistics(&self) -> CacheStatistics {
            self.stats.snapshot("", 0)
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn config(min_calls: u64, wait: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_state: wait,
            sliding_window_size: 20,
            minimum_number_of_calls: min_calls,
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_minimum_calls() {
        let flaky = Arc::new(FlakyCache::new(true));
        let breaker = CircuitBreakerWrapper::new(
            Arc::clone(&flaky) as Arc<dyn CacheContract>,
            None,
            "users",
            config(5, Duration::from_secs(60)),
        );

        for _ in 0..5 {
            let _ = breaker.get("k").await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Open reads come back empty without touching the backend.
        let value = breaker.get("k").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn open_circuit_fails_writes_fast() {
        let flaky = Arc::new(FlakyCache::new(true));
        let breaker = CircuitBreakerWrapper::new(
            flaky as Arc<dyn CacheContract>,
            None,
            "users",
            config(3, Duration::from_secs(60)),
        );
        for _ in 0..3 {
            let _ = breaker.put("k", Bytes::from_static(b"v")).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker.put("k", Bytes::from_static(b"v")).await.unwrap_err();
        assert!(matches!(err, CacheError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn open_circuit_serves_reads_from_fallback() {
        let flaky = Arc::new(FlakyCache::new(true));
        let fallback = Arc::new(LocalBackend::new(&LocalConfig::default()));
        fallback
            .put("k", Bytes::from_static(b"from-l1"))
            .await
            .unwrap();

        let breaker = CircuitBreakerWrapper::new(
            flaky as Arc<dyn CacheContract>,
            Some(Arc::clone(&fallback) as Arc<dyn CacheContract>),
            "users",
            config(3, Duration::from_secs(60)),
        );
        for _ in 0..3 {
            let _ = breaker.get("k").await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let value = breaker.get("k").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"from-l1")));
    }

    #[tokio::test]
    async fn breaker_recovers_through_half_open() {
        let flaky = Arc::new(FlakyCache::new(true));
        let breaker = CircuitBreakerWrapper::new(
            Arc::clone(&flaky) as Arc<dyn CacheContract>,
            None,
            "users",
            config(3, Duration::from_millis(20)),
        );
        for _ in 0..3 {
            let _ = breaker.get("k").await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Backend heals; after the open-wait the breaker probes and closes.
        flaky.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        for _ in 0..HALF_OPEN_SUCCESS_TARGET {
            let _ = breaker.get("k").await.unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn unsupported_operations_do_not_trip_the_breaker() {
        let local = Arc::new(LocalBackend::new(&LocalConfig::default()));
        let breaker = CircuitBreakerWrapper::new(
            local as Arc<dyn CacheContract>,
            None,
            "users",
            config(2, Duration::from_secs(60)),
        );
        for _ in 0..10 {
            let _ = breaker.increment("n", 1).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
