//! Stampede protection wrapper - single-flight loads
//!
//! A cold hot-key otherwise sends every concurrent reader to the loader at
//! once. `get_or_load` serializes them on a per-key lock: the holder
//! double-checks the cache, runs the loader under a computation deadline and
//! stores the result; everyone else either picks the value up on the
//! double-check or comes back empty after the bounded lock wait.
//!
//! The lock is distributed (`SET NX PX` on `cache:stampede:<effectiveKey>`)
//! when a remote backend exists; purely local deployments degrade to an
//! in-process per-key mutex, the only scope that exists there.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::observability::metric_names;
use crate::stats::CacheStatistics;
use crate::traits::CacheContract;

/// Key the distributed lock for an effective cache key lives under.
#[must_use]
pub fn lock_key(effective_key: &str) -> String {
    format!("cache:stampede:{effective_key}")
}

/// Held lock. Must be released on every exit path.
#[async_trait]
pub trait LockGuard: Send {
    async fn release(self: Box<Self>);
}

/// Per-key mutual exclusion with a bounded wait.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to acquire the lock within `wait`. `None` on timeout. `lease`
    /// bounds how long a crashed holder can block others.
    async fn acquire(
        &self,
        lock_key: &str,
        wait: Duration,
        lease: Duration,
    ) -> CacheResult<Option<Box<dyn LockGuard>>>;
}

// ===== In-process lock provider =====

type InFlightMap = DashMap<String, Arc<Mutex<()>>>;

/// Process-local per-key locks. Entries are removed again on release so the
/// map only holds keys with loads in flight.
#[derive(Default)]
pub struct LocalLockProvider {
    in_flight: Arc<InFlightMap>,
}

impl LocalLockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalLockGuard {
    _guard: tokio::sync::OwnedMutexGuard<()>,
    in_flight: Arc<InFlightMap>,
    key: String,
}

#[async_trait]
impl LockGuard for LocalLockGuard {
    async fn release(self: Box<Self>) {
        self.in_flight.remove(&self.key);
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn acquire(
        &self,
        lock_key: &str,
        wait: Duration,
        _lease: Duration,
    ) -> CacheResult<Option<Box<dyn LockGuard>>> {
        let mutex = self
            .in_flight
            .entry(lock_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(Some(Box::new(LocalLockGuard {
                _guard: guard,
                in_flight: Arc::clone(&self.in_flight),
                key: lock_key.to_string(),
            }))),
            Err(_) => Ok(None),
        }
    }
}

// ===== Distributed lock provider =====

/// Redis-backed lock: `SET NX PX` with a random token, polled until the wait
/// budget runs out.
pub struct RedisLockProvider {
    conn: ConnectionManager,
}

impl RedisLockProvider {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

struct RedisLockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
}

#[async_trait]
impl LockGuard for RedisLockGuard {
    async fn release(self: Box<Self>) {
        let mut conn = self.conn.clone();
        // Check-then-delete only races once the lease already expired, at
        // which point the lock is no longer ours to hold anyway.
        let current: Result<Option<String>, _> = conn.get(&self.key).await;
        if let Ok(Some(token)) = current {
            if token == self.token {
                let result: Result<i64, _> = conn.del(&self.key).await;
                if let Err(err) = result {
                    warn!(lock = %self.key, error = %err, "failed to release stampede lock");
                }
            }
        }
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn acquire(
        &self,
        lock_key: &str,
        wait: Duration,
        lease: Duration,
    ) -> CacheResult<Option<Box<dyn LockGuard>>> {
        let token = uuid::Uuid::new_v4().to_string();
        let lease_ms = lease.as_millis().max(1) as u64;
        let deadline = Instant::now() + wait;

        loop {
            let mut conn = self.conn.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms);
            let reply: Option<String> =
                cmd.query_async(&mut conn)
                    .await
                    .map_err(|err| CacheError::Backend {
                        operation: "lock_acquire",
                        key: lock_key.to_string(),
                        message: err.to_string(),
                    })?;

            if reply.is_some() {
                return Ok(Some(Box::new(RedisLockGuard {
                    conn: self.conn.clone(),
                    key: lock_key.to_string(),
                    token,
                })));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

// ===== Wrapper =====

/// Single-flight protection around the read path. Contract operations pass
/// straight through; the added surface is [`StampedeProtection::get_or_load`].
pub struct StampedeProtection {
    inner: Arc<dyn CacheContract>,
    locks: Arc<dyn LockProvider>,
    lock_timeout: Duration,
    computation_timeout: Duration,
}

impl StampedeProtection {
    #[must_use]
    pub fn new(
        inner: Arc<dyn CacheContract>,
        locks: Arc<dyn LockProvider>,
        lock_timeout: Duration,
        computation_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            locks,
            lock_timeout,
            computation_timeout,
        }
    }

    /// Bound on loader execution, for callers driving the lock themselves.
    #[must_use]
    pub fn computation_timeout(&self) -> Duration {
        self.computation_timeout
    }

    /// Acquire the per-key lock within the configured wait. `None` when the
    /// wait budget ran out (counted).
    pub async fn acquire(&self, effective_key: &str) -> CacheResult<Option<Box<dyn LockGuard>>> {
        let lock_name = lock_key(effective_key);
        let guard = self
            .locks
            .acquire(&lock_name, self.lock_timeout, self.computation_timeout)
            .await?;
        if guard.is_none() {
            metrics::counter!(metric_names::STAMPEDE_LOCK_TIMEOUTS).increment(1);
            debug!(key = %effective_key, "stampede lock wait timed out");
        }
        Ok(guard)
    }

    /// Fetch `key`, running `loader` at most once across concurrent callers
    /// when the key is cold.
    ///
    /// Returns `Ok(None)` when the lock could not be acquired within
    /// `lock_timeout`; the loader is not invoked in that case.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> CacheResult<Option<Bytes>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<Bytes>> + Send,
    {
        if let Some(value) = self.inner.get(key).await? {
            return Ok(Some(value));
        }

        let Some(guard) = self.acquire(key).await? else {
            // Lock wait exhausted: return empty without invoking the loader.
            return Ok(None);
        };

        // Double-check: another holder may have stored the value while we
        // waited for the lock.
        match self.inner.get(key).await {
            Ok(Some(value)) => {
                metrics::counter!(metric_names::STAMPEDE_COALESCED).increment(1);
                guard.release().await;
                return Ok(Some(value));
            }
            Ok(None) => {}
            Err(err) => {
                guard.release().await;
                return Err(err);
            }
        }

        metrics::counter!(metric_names::STAMPEDE_LOADS).increment(1);
        let loaded = match tokio::time::timeout(self.computation_timeout, loader()).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                guard.release().await;
                return Err(err);
            }
            Err(_) => {
                guard.release().await;
                return Err(CacheError::Timeout {
                    operation: "loader",
                    elapsed: self.computation_timeout,
                });
            }
        };

        let store = match ttl {
            Some(ttl) => self.inner.put_with_ttl(key, loaded.clone(), ttl).await,
            None => self.inner.put(key, loaded.clone()).await,
        };
        if let Err(err) = store {
            // The caller still gets the loaded value; only caching failed.
            warn!(key = %key, error = %err, "failed to store loaded value");
        }
        guard.release().await;
        Ok(Some(loaded))
    }
}

#[async_trait]
impl CacheContract for StampedeProtection {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        self.inner.put(key, value).await
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        self.inner.put_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.inner.remove(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.inner.clear().await
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        self.inner.contains_key(key).await
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        self.inner.put_all(entries).await
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        self.inner.get_all(keys).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.inner.put_if_absent(key, value, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.inner.increment(key, delta).await
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.inner.decrement(key, delta).await
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        self.inner.remove_matching(pattern).await
    }

    fn statistics(&self) -> CacheStatistics {
        self.inner.statistics()
    }

    fn backend_name(&self) -> &'static str {
        "stampede-protection"
    }
}
