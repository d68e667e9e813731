//! Distributed eviction bus
//!
//! Cross-instance invalidation over Redis Pub/Sub. Each write-side mutation
//! that must be globally visible publishes an [`EvictionEvent`] on
//! `cache:eviction:<namespace>`; every instance runs one subscriber task that
//! applies foreign events to its L1 tier. L2 is never touched here: it is
//! authoritative for the cluster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backends::LocalBackend;
use crate::error::CacheResult;
use crate::traits::CacheContract;

/// Process-lifetime unique identifier, used to suppress self-echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of eviction the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionKind {
    SingleKey,
    Pattern,
    ClearAll,
}

/// One logical eviction, published atomically.
///
/// Exactly one of `key` / `pattern` / neither is set, consistent with `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionEvent {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: EvictionKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pattern: Option<String>,
    pub source_instance_id: String,
    /// Milliseconds since the Unix epoch at publish time.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

impl EvictionEvent {
    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64
    }

    #[must_use]
    pub fn single_key(namespace: &str, key: &str, source: &InstanceId) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: EvictionKind::SingleKey,
            key: Some(key.to_string()),
            pattern: None,
            source_instance_id: source.as_str().to_string(),
            timestamp_ms: Self::now_ms(),
        }
    }

    #[must_use]
    pub fn pattern(namespace: &str, pattern: &str, source: &InstanceId) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: EvictionKind::Pattern,
            key: None,
            pattern: Some(pattern.to_string()),
            source_instance_id: source.as_str().to_string(),
            timestamp_ms: Self::now_ms(),
        }
    }

    #[must_use]
    pub fn clear_all(namespace: &str, source: &InstanceId) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: EvictionKind::ClearAll,
            key: None,
            pattern: None,
            source_instance_id: source.as_str().to_string(),
            timestamp_ms: Self::now_ms(),
        }
    }
}

/// Channel an eviction event for `namespace` travels on.
#[must_use]
pub fn eviction_channel(namespace: &str) -> String {
    format!("cache:eviction:{namespace}")
}

/// Pattern matching every eviction channel, for the single subscriber task.
pub const EVICTION_CHANNEL_PATTERN: &str = "cache:eviction:*";

/// Counters for bus activity.
#[derive(Debug, Default)]
pub struct EvictionBusStats {
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub self_echoes_ignored: AtomicU64,
    pub foreign_namespace_ignored: AtomicU64,
    pub processing_errors: AtomicU64,
}

/// Write side of the bus.
///
/// Publish failures are logged and swallowed: invalidation is best-effort and
/// must never fail the originating cache operation.
pub struct EvictionPublisher {
    conn: ConnectionManager,
    instance_id: InstanceId,
    stats: Arc<EvictionBusStats>,
}

impl EvictionPublisher {
    #[must_use]
    pub fn new(conn: ConnectionManager, instance_id: InstanceId) -> Self {
        Self {
            conn,
            instance_id,
            stats: Arc::new(EvictionBusStats::default()),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    #[must_use]
    pub fn stats(&self) -> Arc<EvictionBusStats> {
        Arc::clone(&self.stats)
    }

    /// Publish one event on its namespace channel.
    pub async fn publish(&self, event: &EvictionEvent) {
        let channel = eviction_channel(&event.namespace);
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(namespace = %event.namespace, error = %err, "failed to encode eviction event");
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut conn = self.conn.clone();
        match conn.publish::<_, _, i64>(&channel, &payload).await {
            Ok(receivers) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %channel,
                    kind = ?event.kind,
                    receivers,
                    "published eviction event"
                );
            }
            Err(err) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %channel,
                    error = %err,
                    "eviction publish failed; continuing without cluster notification"
                );
            }
        }
    }
}

/// Read side of the bus: one background task per process.
///
/// Namespaces register their L1 handle; events for unregistered namespaces
/// and events this instance published itself are ignored.
pub struct EvictionSubscriber {
    client: redis::Client,
    instance_id: InstanceId,
    registry: Arc<DashMap<String, Arc<LocalBackend>>>,
    stats: Arc<EvictionBusStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EvictionSubscriber {
    #[must_use]
    pub fn new(client: redis::Client, instance_id: InstanceId) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            client,
            instance_id,
            registry: Arc::new(DashMap::new()),
            stats: Arc::new(EvictionBusStats::default()),
            shutdown_tx,
        }
    }

    /// Register a namespace's L1 tier for invalidation.
    pub fn register(&self, namespace: &str, l1: Arc<LocalBackend>) {
        self.registry.insert(namespace.to_string(), l1);
    }

    /// Stop applying events for a namespace.
    pub fn unregister(&self, namespace: &str) {
        self.registry.remove(namespace);
    }

    #[must_use]
    pub fn stats(&self) -> Arc<EvictionBusStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the background subscriber task. Reconnects with a fixed backoff
    /// until shutdown is signalled.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let instance_id = self.instance_id.clone();
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    info!("eviction subscriber shutting down");
                    break;
                }

                match Self::run_loop(&client, &instance_id, &registry, &stats, &mut shutdown_rx)
                    .await
                {
                    Ok(()) => {
                        info!("eviction subscriber loop completed");
                        break;
                    }
                    Err(err) => {
                        error!(error = %err, "eviction subscriber error; reconnecting in 5s");
                        stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(5)) => {}
                            _ = shutdown_rx.recv() => {
                                info!("eviction subscriber shutting down");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn run_loop(
        client: &redis::Client,
        instance_id: &InstanceId,
        registry: &DashMap<String, Arc<LocalBackend>>,
        stats: &EvictionBusStats,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> CacheResult<()> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|err| anyhow::anyhow!("pubsub connection failed: {err}"))?;
        pubsub
            .psubscribe(EVICTION_CHANNEL_PATTERN)
            .await
            .map_err(|err| anyhow::anyhow!("psubscribe failed: {err}"))?;
        info!(pattern = EVICTION_CHANNEL_PATTERN, "subscribed to eviction channels");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(anyhow::anyhow!("eviction message stream ended").into());
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "failed to read eviction payload");
                            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    let event: EvictionEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(error = %err, "failed to decode eviction event");
                            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    stats.received.fetch_add(1, Ordering::Relaxed);
                    apply_event(registry, instance_id, stats, &event).await;
                }
                _ = shutdown_rx.recv() => {
                    return Ok(());
                }
            }
        }
    }

    /// Signal the background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Apply one received event to the registered L1 tiers.
///
/// Separated from the subscriber loop so the suppression rules are testable
/// without a running server.
pub(crate) async fn apply_event(
    registry: &DashMap<String, Arc<LocalBackend>>,
    instance_id: &InstanceId,
    stats: &EvictionBusStats,
    event: &EvictionEvent,
) {
    if event.source_instance_id == instance_id.as_str() {
        stats.self_echoes_ignored.fetch_add(1, Ordering::Relaxed);
        return;
    }
    // A backend-wide clear arrives under the "*" namespace and applies to
    // every namespace this instance manages.
    if event.namespace == "*" && event.kind == EvictionKind::ClearAll {
        for entry in registry.iter() {
            if let Err(err) = entry.value().clear().await {
                warn!(namespace = %entry.key(), error = %err, "failed to apply global clear");
                stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        stats.applied.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let Some(l1) = registry.get(&event.namespace).map(|e| Arc::clone(e.value())) else {
        stats
            .foreign_namespace_ignored
            .fetch_add(1, Ordering::Relaxed);
        return;
    };

    let result = match (&event.kind, &event.key) {
        (EvictionKind::SingleKey, Some(key)) => l1.remove(key).await,
        (EvictionKind::ClearAll, _) => l1.clear().await,
        (EvictionKind::Pattern, _) => {
            // L1 lacks cheap key introspection for arbitrary patterns; drop
            // the whole tier for this namespace.
            warn!(
                namespace = %event.namespace,
                pattern = event.pattern.as_deref().unwrap_or(""),
                "pattern eviction clears the whole L1 tier"
            );
            l1.clear().await
        }
        (EvictionKind::SingleKey, None) => {
            warn!(namespace = %event.namespace, "SINGLE_KEY event without a key; ignored");
            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match result {
        Ok(()) => {
            stats.applied.fetch_add(1, Ordering::Relaxed);
            debug!(
                namespace = %event.namespace,
                kind = ?event.kind,
                "applied eviction event to L1"
            );
        }
        Err(err) => {
            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
            warn!(namespace = %event.namespace, error = %err, "failed to apply eviction event");
        }
    }
}
