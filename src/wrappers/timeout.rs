//! Outer operation timeout wrapper
//!
//! Bounds every chain operation with `resilience.timeout.operationTimeout`.
//! Sits between metrics and the circuit breaker so the breaker observes
//! timeouts as failures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CacheError, CacheResult};
use crate::observability::metric_names;
use crate::stats::CacheStatistics;
use crate::traits::CacheContract;

pub struct TimeoutWrapper {
    inner: Arc<dyn CacheContract>,
    operation_timeout: Duration,
}

impl TimeoutWrapper {
    #[must_use]
    pub fn new(inner: Arc<dyn CacheContract>, operation_timeout: Duration) -> Self {
        Self {
            inner,
            operation_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = CacheResult<T>> + Send,
    ) -> CacheResult<T> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(metric_names::TIMEOUTS).increment(1);
                Err(CacheError::Timeout {
                    operation,
                    elapsed: self.operation_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl CacheContract for TimeoutWrapper {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        self.bounded("put", self.inner.put(key, value)).await
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        self.bounded("put", self.inner.put_with_ttl(key, value, ttl))
            .await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.bounded("remove", self.inner.remove(key)).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.bounded("clear", self.inner.clear()).await
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        self.bounded("contains_key", self.inner.contains_key(key))
            .await
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        self.bounded("put_all", self.inner.put_all(entries)).await
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        self.bounded("get_all", self.inner.get_all(keys)).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.bounded("put_if_absent", self.inner.put_if_absent(key, value, ttl))
            .await
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.bounded("increment", self.inner.increment(key, delta))
            .await
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.bounded("decrement", self.inner.decrement(key, delta))
            .await
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        self.bounded("remove_matching", self.inner.remove_matching(pattern))
            .await
    }

    fn statistics(&self) -> CacheStatistics {
        self.inner.statistics()
    }

    fn backend_name(&self) -> &'static str {
        "timeout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsRecorder;

    /// Inner cache whose reads hang forever.
    struct StuckCache {
        stats: StatsRecorder,
    }

    #[async_trait]
    impl CacheContract for StuckCache {
        async fn put(&self, _key: &str, _value: Bytes) -> CacheResult<()> {
            Ok(())
        }
        async fn put_with_ttl(&self, _key: &str, _value: Bytes, _ttl: Duration) -> CacheResult<()> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> CacheResult<Option<Bytes>> {
            std::future::pending::<()>().await;
            Ok(None)
        }
        async fn remove(&self, _key: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn clear(&self) -> CacheResult<()> {
            Ok(())
        }
        async fn contains_key(&self, _key: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn put_all(&self, _entries: Vec<(String, Bytes)>) -> CacheResult<()> {
            Ok(())
        }
        async fn get_all(&self, _keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
            Ok(HashMap::new())
        }
        async fn put_if_absent(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Option<Duration>,
        ) -> CacheResult<bool> {
            Ok(true)
        }
        async fn increment(&self, _key: &str, _delta: i64) -> CacheResult<i64> {
            Ok(0)
        }
        async fn decrement(&self, _key: &str, _delta: i64) -> CacheResult<i64> {
            Ok(0)
        }
        fn statistics(&self) -> CacheStatistics {
            self.stats.snapshot("", 0)
        }
        fn backend_name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn hung_operations_surface_as_timeouts() {
        let stuck = Arc::new(StuckCache {
            stats: StatsRecorder::default(),
        });
        let wrapper = TimeoutWrapper::new(
            stuck as Arc<dyn CacheContract>,
            Duration::from_millis(30),
        );
        let err = wrapper.get("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { .. }));
    }

    #[tokio::test]
    async fn fast_operations_pass_through() {
        let stuck = Arc::new(StuckCache {
            stats: StatsRecorder::default(),
        });
        let wrapper = TimeoutWrapper::new(
            stuck as Arc<dyn CacheContract>,
            Duration::from_millis(30),
        );
        wrapper.put("k", Bytes::from_static(b"v")).await.unwrap();
    }
}
