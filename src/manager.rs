//! Cache manager - singleton backend, namespace registry, chain assembly
//!
//! The manager owns exactly one base backend for the process, selected from
//! configuration, plus the registry of namespaced handles. `get_cache`
//! returns the same handle for repeated calls with the same namespace; the
//! decorator chain behind it is assembled once, in the fixed order
//! Namespace -> Metrics -> CircuitBreaker -> Stampede -> Compression ->
//! Encryption -> Backend.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backends::{LocalBackend, MultiTierCoordinator, MultiTierStats, RemoteBackend};
use crate::codecs::JsonCodec;
use crate::config::{CacheConfig, CacheType, NamespaceConfig};
use crate::error::{CacheError, CacheResult};
use crate::eviction::{EvictionPublisher, EvictionSubscriber, InstanceId};
use crate::observability::{HealthReport, HealthStatus, NamespaceHealth};
use crate::stats::{CacheStatistics, StatsRecorder};
use crate::traits::{CacheCodec, CacheContract, RemoteTier};
use crate::wrappers::{
    encryption, BreakerState, CircuitBreakerWrapper, CompressionWrapper, EncryptionWrapper,
    LocalLockProvider, LockProvider, MetricsWrapper, NamespaceWrapper, RedisLockProvider,
    StampedeProtection, TimeoutWrapper,
};

/// The process-singleton base backend.
enum BaseBackend {
    Local(Arc<LocalBackend>),
    Remote(Arc<RemoteBackend>),
    MultiTier {
        coordinator: Arc<MultiTierCoordinator>,
        local: Arc<LocalBackend>,
        remote: Arc<RemoteBackend>,
    },
}

impl BaseBackend {
    fn contract(&self) -> Arc<dyn CacheContract> {
        match self {
            Self::Local(local) => Arc::clone(local) as Arc<dyn CacheContract>,
            Self::Remote(remote) => Arc::clone(remote) as Arc<dyn CacheContract>,
            Self::MultiTier { coordinator, .. } => {
                Arc::clone(coordinator) as Arc<dyn CacheContract>
            }
        }
    }
}

struct ManagerInner<C: CacheCodec> {
    config: CacheConfig,
    base: BaseBackend,
    registry: DashMap<String, NamespacedCache<C>>,
    codec: Arc<C>,
    locks: Arc<dyn LockProvider>,
    instance_id: InstanceId,
    subscriber: Option<EvictionSubscriber>,
    subscriber_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Entry point of the engine. Cheap to clone; all state lives behind one Arc.
pub struct CacheManager<C: CacheCodec = JsonCodec> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: CacheCodec> std::fmt::Debug for CacheManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager").finish()
    }
}

impl<C: CacheCodec> Clone for CacheManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CacheManager<JsonCodec> {
    /// Initialize with the default JSON codec. Fails fast on invalid
    /// configuration or an unreachable remote backend.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::with_codec(config, JsonCodec).await
    }
}

impl<C: CacheCodec + 'static> CacheManager<C> {
    /// Initialize with a custom value codec.
    pub async fn with_codec(config: CacheConfig, codec: C) -> CacheResult<Self> {
        config.validate()?;
        if config.features.encryption.enabled {
            // Key material problems must fail startup, not the first put.
            encryption::validate_key(&config.features.encryption.key)?;
        }
        lazy_static::initialize(&crate::observability::METRICS_DESCRIBED);

        let instance_id = InstanceId::generate();
        info!(
            instance_id = %instance_id,
            cache_type = ?config.cache_type,
            codec = codec.name(),
            "initializing cache engine"
        );

        let mut subscriber = None;
        let mut locks: Arc<dyn LockProvider> = Arc::new(LocalLockProvider::new());

        let base = match config.cache_type {
            CacheType::Local => {
                BaseBackend::Local(Arc::new(LocalBackend::new(&config.local)))
            }
            CacheType::Remote => {
                let remote =
                    Arc::new(RemoteBackend::connect(&config.remote, config.deployment_mode()).await?);
                locks = Arc::new(RedisLockProvider::new(
                    bus_connection(remote.as_ref(), &config).await?,
                ));
                BaseBackend::Remote(remote)
            }
            CacheType::MultiTier => {
                let local = Arc::new(LocalBackend::new(&config.local));
                let remote =
                    Arc::new(RemoteBackend::connect(&config.remote, config.deployment_mode()).await?);

                let publisher_conn = bus_connection(remote.as_ref(), &config).await?;
                let publisher = Arc::new(EvictionPublisher::new(
                    publisher_conn.clone(),
                    instance_id.clone(),
                ));
                locks = Arc::new(RedisLockProvider::new(publisher_conn));

                let bus_subscriber =
                    EvictionSubscriber::new(remote.bus_client()?, instance_id.clone());
                subscriber = Some(bus_subscriber);

                let coordinator = Arc::new(MultiTierCoordinator::new(
                    Arc::clone(&local),
                    Arc::clone(&remote) as Arc<dyn RemoteTier>,
                    Some(publisher),
                ));
                BaseBackend::MultiTier {
                    coordinator,
                    local,
                    remote,
                }
            }
        };

        let subscriber_task = Mutex::new(subscriber.as_ref().map(EvictionSubscriber::start));

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                base,
                registry: DashMap::new(),
                codec: Arc::new(codec),
                locks,
                instance_id,
                subscriber,
                subscriber_task,
            }),
        })
    }

    /// Identifier of this engine instance on the eviction bus.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.inner.instance_id
    }

    /// Fetch (or build, once) the handle for a namespace.
    pub fn get_cache(&self, namespace: &str) -> CacheResult<NamespacedCache<C>> {
        if namespace.trim().is_empty() {
            return Err(CacheError::configuration(
                "namespace: must be non-empty",
            ));
        }
        if let Some(existing) = self.inner.registry.get(namespace) {
            return Ok(existing.clone());
        }
        let built = self.build_chain(namespace)?;
        let entry = self
            .inner
            .registry
            .entry(namespace.to_string())
            .or_insert(built);
        Ok(entry.clone())
    }

    /// Dispose a namespace handle; the next `get_cache` rebuilds it.
    pub fn remove_cache(&self, namespace: &str) {
        self.inner.registry.remove(namespace);
        if let Some(subscriber) = &self.inner.subscriber {
            subscriber.unregister(namespace);
        }
        debug!(namespace = %namespace, "namespace handle removed");
    }

    /// Snapshots from every live handle.
    #[must_use]
    pub fn all_statistics(&self) -> Vec<CacheStatistics> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.value().statistics())
            .collect()
    }

    /// Per-tier breakdown when running multi-tier; `None` otherwise.
    #[must_use]
    pub fn tier_statistics(&self) -> Option<MultiTierStats> {
        match &self.inner.base {
            BaseBackend::MultiTier { coordinator, .. } => Some(coordinator.tier_stats()),
            _ => None,
        }
    }

    /// Readiness report: `UP` when the remote backend (if any) answers a
    /// ping, with per-namespace statistics either way.
    pub async fn health(&self) -> HealthReport {
        let status = match &self.inner.base {
            BaseBackend::Local(local) => {
                if local.health_check().await {
                    HealthStatus::Up
                } else {
                    HealthStatus::Down {
                        reason: "local backend probe failed".to_string(),
                    }
                }
            }
            BaseBackend::Remote(remote) => {
                if remote.ping().await {
                    HealthStatus::Up
                } else {
                    HealthStatus::Down {
                        reason: "remote backend ping failed".to_string(),
                    }
                }
            }
            BaseBackend::MultiTier { coordinator, .. } => {
                if coordinator.ping_l2().await {
                    HealthStatus::Up
                } else {
                    HealthStatus::Down {
                        reason: "remote tier ping failed".to_string(),
                    }
                }
            }
        };

        HealthReport {
            status,
            namespaces: self
                .all_statistics()
                .iter()
                .map(NamespaceHealth::from)
                .collect(),
        }
    }

    /// Release background resources. Handles stay usable against the local
    /// tier; the eviction subscriber stops.
    pub fn shutdown(&self) {
        if let Some(subscriber) = &self.inner.subscriber {
            subscriber.shutdown();
        }
        if let Some(task) = self.inner.subscriber_task.lock().take() {
            task.abort();
        }
        info!(instance_id = %self.inner.instance_id, "cache engine shut down");
    }

    /// Assemble the decorator chain for one namespace.
    fn build_chain(&self, namespace: &str) -> CacheResult<NamespacedCache<C>> {
        let config = &self.inner.config;
        let ns_config = config.resolve_namespace(namespace);
        let recorder = Arc::new(StatsRecorder::default());

        let mut chain = self.inner.base.contract();

        if ns_config.encryption_enabled {
            chain = Arc::new(EncryptionWrapper::new(
                chain,
                &config.features.encryption.key,
            )?);
        }
        if ns_config.compression_enabled {
            chain = Arc::new(CompressionWrapper::new(
                chain,
                config.features.compression.threshold,
            ));
        }

        let stampede = if ns_config.stampede_protection_enabled {
            let protection = Arc::new(StampedeProtection::new(
                chain,
                Arc::clone(&self.inner.locks),
                config.resilience.stampede_protection.lock_timeout,
                config.resilience.stampede_protection.computation_timeout,
            ));
            chain = Arc::clone(&protection) as Arc<dyn CacheContract>;
            Some(protection)
        } else {
            None
        };

        let breaker = if ns_config.circuit_breaker_enabled {
            // When the chain ends in a coordinator, open-circuit reads fall
            // back to the local tier.
            let fallback: Option<Arc<dyn CacheContract>> = match &self.inner.base {
                BaseBackend::MultiTier { local, .. } => {
                    Some(Arc::clone(local) as Arc<dyn CacheContract>)
                }
                _ => None,
            };
            let wrapper = Arc::new(CircuitBreakerWrapper::new(
                chain,
                fallback,
                namespace,
                config.resilience.circuit_breaker.clone(),
            ));
            chain = Arc::clone(&wrapper) as Arc<dyn CacheContract>;
            Some(wrapper)
        } else {
            None
        };

        if config.resilience.timeout.enabled {
            chain = Arc::new(TimeoutWrapper::new(
                chain,
                config.resilience.timeout.operation_timeout,
            ));
        }

        if config.observability.metrics.enabled {
            chain = Arc::new(MetricsWrapper::new(
                chain,
                namespace,
                Arc::clone(&recorder),
            ));
        }
        chain = Arc::new(NamespaceWrapper::new(chain, namespace, ns_config.ttl));

        if let (Some(subscriber), BaseBackend::MultiTier { local, .. }) =
            (&self.inner.subscriber, &self.inner.base)
        {
            subscriber.register(namespace, Arc::clone(local));
        }

        debug!(
            namespace = %namespace,
            compression = ns_config.compression_enabled,
            encryption = ns_config.encryption_enabled,
            stampede = ns_config.stampede_protection_enabled,
            breaker = ns_config.circuit_breaker_enabled,
            "namespace chain assembled"
        );

        Ok(NamespacedCache {
            name: namespace.to_string(),
            config: ns_config,
            chain,
            stampede,
            breaker,
            codec: Arc::clone(&self.inner.codec),
        })
    }
}

/// Auxiliary connection for the eviction bus and distributed locks.
async fn bus_connection(
    remote: &RemoteBackend,
    config: &CacheConfig,
) -> CacheResult<ConnectionManager> {
    let client = remote.bus_client()?;
    ConnectionManager::new(client)
        .await
        .map_err(|err| CacheError::Connection {
            host: config.remote.host.clone(),
            port: config.remote.port,
            message: err.to_string(),
        })
}

/// Typed, namespaced cache handle: the head of a decorator chain plus the
/// value codec.
pub struct NamespacedCache<C: CacheCodec = JsonCodec> {
    name: String,
    config: NamespaceConfig,
    chain: Arc<dyn CacheContract>,
    stampede: Option<Arc<StampedeProtection>>,
    breaker: Option<Arc<CircuitBreakerWrapper>>,
    codec: Arc<C>,
}

impl<C: CacheCodec> Clone for NamespacedCache<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            config: self.config.clone(),
            chain: Arc::clone(&self.chain),
            stampede: self.stampede.clone(),
            breaker: self.breaker.clone(),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<C: CacheCodec> NamespacedCache<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw bytes surface, for callers that manage serialization
    /// themselves.
    #[must_use]
    pub fn contract(&self) -> &Arc<dyn CacheContract> {
        &self.chain
    }

    /// Single-flight guard for this namespace, when enabled.
    pub(crate) fn stampede_protection(&self) -> Option<&Arc<StampedeProtection>> {
        self.stampede.as_ref()
    }

    /// Namespace default TTL resolved at chain assembly.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.config.ttl
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.chain.get(key).await? {
            Some(bytes) => Ok(Some(self.codec.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        let bytes = self.codec.serialize(value)?;
        self.chain.put(key, bytes.into()).await
    }

    pub async fn put_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let bytes = self.codec.serialize(value)?;
        self.chain.put_with_ttl(key, bytes.into(), ttl).await
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.chain.remove(key).await
    }

    pub async fn clear(&self) -> CacheResult<()> {
        self.chain.clear().await
    }

    pub async fn contains_key(&self, key: &str) -> CacheResult<bool> {
        self.chain.contains_key(key).await
    }

    pub async fn put_all<T: Serialize>(&self, entries: &[(String, T)]) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.codec.serialize(value)?.into())))
            .collect::<CacheResult<Vec<_>>>()?;
        self.chain.put_all(encoded).await
    }

    pub async fn get_all<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> CacheResult<HashMap<String, T>> {
        let results = self.chain.get_all(keys).await?;
        results
            .into_iter()
            .map(|(key, bytes)| {
                let value = self.codec.deserialize(&bytes)?;
                Ok((key, value))
            })
            .collect()
    }

    pub async fn put_if_absent<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let bytes = self.codec.serialize(value)?;
        self.chain.put_if_absent(key, bytes.into(), ttl).await
    }

    pub async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.chain.increment(key, delta).await
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.chain.decrement(key, delta).await
    }

    /// Remove keys matching a glob-style pattern within this namespace.
    pub async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        self.chain.remove_matching(pattern).await
    }

    /// Read-or-compute with single-flight protection when the namespace has
    /// stampede protection enabled; a plain get/compute/put otherwise.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, loader: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<T>> + Send,
    {
        if let Some(cached) = self.get::<T>(key).await? {
            return Ok(cached);
        }

        if let Some(protection) = &self.stampede {
            // An open circuit short-circuits before any stampede lock is
            // acquired: compute directly, skip caching.
            let circuit_open = self
                .breaker
                .as_ref()
                .is_some_and(|breaker| breaker.state() == BreakerState::Open);
            if circuit_open {
                return loader().await;
            }
            let effective = crate::wrappers::namespace::effective_key(&self.name, key);
            match protection.acquire(&effective).await? {
                Some(guard) => {
                    // Double-check under the lock; another holder may have
                    // stored the value while we waited.
                    match self.get::<T>(key).await {
                        Ok(Some(cached)) => {
                            guard.release().await;
                            return Ok(cached);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            guard.release().await;
                            return Err(err);
                        }
                    }

                    metrics::counter!(crate::observability::metric_names::STAMPEDE_LOADS)
                        .increment(1);
                    let loaded = tokio::time::timeout(
                        protection.computation_timeout(),
                        loader(),
                    )
                    .await;
                    let value = match loaded {
                        Ok(Ok(value)) => value,
                        Ok(Err(err)) => {
                            guard.release().await;
                            return Err(err);
                        }
                        Err(_) => {
                            guard.release().await;
                            return Err(CacheError::Timeout {
                                operation: "loader",
                                elapsed: protection.computation_timeout(),
                            });
                        }
                    };
                    if let Err(err) = self.put(key, &value).await {
                        warn!(
                            namespace = %self.name,
                            key = %key,
                            error = %err,
                            "failed to cache loaded value"
                        );
                    }
                    guard.release().await;
                    return Ok(value);
                }
                None => {
                    // Lock wait exhausted. Pick up a result left by the
                    // holder if there is one; otherwise compute without
                    // caching rather than failing the caller.
                    if let Some(cached) = self.get::<T>(key).await? {
                        return Ok(cached);
                    }
                    return loader().await;
                }
            }
        }

        let value = loader().await?;
        if let Err(err) = self.put(key, &value).await {
            warn!(namespace = %self.name, key = %key, error = %err, "failed to cache loaded value");
        }
        Ok(value)
    }

    /// Current circuit breaker state, when the namespace has one.
    #[must_use]
    pub fn circuit_state(&self) -> Option<BreakerState> {
        self.breaker.as_ref().map(|breaker| breaker.state())
    }

    pub fn statistics(&self) -> CacheStatistics {
        self.chain.statistics()
    }
}
