//! Namespace wrapper - lexical key scoping
//!
//! Rewrites every key to `<namespace>:<key>` so namespaces sharing the
//! singleton backend never collide, and applies the namespace default TTL to
//! writes that do not carry one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::error::{CacheError, CacheResult};
use crate::stats::CacheStatistics;
use crate::traits::CacheContract;

/// Build the effective backend key for a namespaced user key.
#[must_use]
pub fn effective_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

/// Outermost wrapper of every decorator chain.
pub struct NamespaceWrapper {
    inner: Arc<dyn CacheContract>,
    namespace: String,
    default_ttl: Duration,
}

impl NamespaceWrapper {
    #[must_use]
    pub fn new(inner: Arc<dyn CacheContract>, namespace: &str, default_ttl: Duration) -> Self {
        Self {
            inner,
            namespace: namespace.to_string(),
            default_ttl,
        }
    }

    fn prefix(&self, key: &str) -> String {
        effective_key(&self.namespace, key)
    }

    fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(key)
    }
}

#[async_trait]
impl CacheContract for NamespaceWrapper {
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()> {
        // Unset TTL means the namespace default.
        self.inner
            .put_with_ttl(&self.prefix(key), value, self.default_ttl)
            .await
    }

    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let effective_ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        self.inner
            .put_with_ttl(&self.prefix(key), value, effective_ttl)
            .await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.inner.get(&self.prefix(key)).await
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.inner.remove(&self.prefix(key)).await
    }

    async fn clear(&self) -> CacheResult<()> {
        // The backend is shared across namespaces: clear only the keys
        // reachable through this prefix where the backend can scan, and fall
        // back to a whole-backend clear where it cannot.
        let pattern = format!("{}:*", self.namespace);
        match self.inner.remove_matching(&pattern).await {
            Ok(_removed) => Ok(()),
            Err(CacheError::Unsupported { .. }) => {
                warn!(
                    namespace = %self.namespace,
                    "backend cannot scan by prefix; clearing the whole shared backend"
                );
                self.inner.clear().await
            }
            Err(err) => Err(err),
        }
    }

    async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        self.inner.contains_key(&self.prefix(key)).await
    }

    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let prefixed = entries
            .into_iter()
            .map(|(key, value)| (self.prefix(&key), value))
            .collect();
        self.inner.put_all(prefixed).await
    }

    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>> {
        let prefixed: Vec<String> = keys.iter().map(|key| self.prefix(key)).collect();
        let results = self.inner.get_all(&prefixed).await?;
        Ok(results
            .into_iter()
            .map(|(key, value)| (self.strip(&key).to_string(), value))
            .collect())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        self.inner
            .put_if_absent(&self.prefix(key), value, ttl.or(Some(self.default_ttl)))
            .await
    }

    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.inner.increment(&self.prefix(key), delta).await
    }

    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.inner.decrement(&self.prefix(key), delta).await
    }

    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        self.inner.remove_matching(&self.prefix(pattern)).await
    }

    fn statistics(&self) -> CacheStatistics {
        let mut snapshot = self.inner.statistics();
        snapshot.namespace = self.namespace.clone();
        snapshot
    }

    fn backend_name(&self) -> &'static str {
        "namespace"
    }
}
