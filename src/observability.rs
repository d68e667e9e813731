//! Observability: metric registration, health reporting, correlation ids
//!
//! Metric names are declared once and described through the `metrics` crate
//! so any installed recorder (e.g. a Prometheus exporter) picks up the
//! catalogue. Structured logs attach `{correlation_id, namespace, operation,
//! key, duration_ms}` fields at the call sites that emit them.

use serde::Serialize;

use crate::stats::CacheStatistics;

/// Stable metric names used across the engine.
pub mod metric_names {
    pub const HITS: &str = "cache.hits";
    pub const MISSES: &str = "cache.misses";
    pub const EVICTIONS: &str = "cache.evictions";
    pub const PUTS: &str = "cache.puts";
    pub const REMOVES: &str = "cache.removes";
    pub const ERRORS: &str = "cache.errors";
    pub const TIMEOUTS: &str = "cache.timeouts";
    pub const BREAKER_FALLBACK: &str = "cache.circuit_breaker.fallback";
    pub const STAMPEDE_LOADS: &str = "cache.stampede.loads";
    pub const STAMPEDE_COALESCED: &str = "cache.stampede.coalesced";
    pub const STAMPEDE_LOCK_TIMEOUTS: &str = "cache.stampede.lock_timeouts";
    pub const HIT_RATE: &str = "cache.hit.rate";
    pub const GET_TIMER: &str = "cache.get";
    pub const PUT_TIMER: &str = "cache.put";
    pub const REMOVE_TIMER: &str = "cache.remove";
    pub const GET_ALL_TIMER: &str = "cache.getAll";
    pub const PUT_ALL_TIMER: &str = "cache.putAll";
}

lazy_static::lazy_static! {
    /// Registers descriptions with the installed metrics recorder exactly
    /// once. Dereference from engine startup.
    pub static ref METRICS_DESCRIBED: () = {
        use metric_names as names;
        metrics::describe_counter!(names::HITS, "Cache read operations that found a value.");
        metrics::describe_counter!(names::MISSES, "Cache read operations that found nothing.");
        metrics::describe_counter!(names::EVICTIONS, "Entries evicted by size pressure or TTL.");
        metrics::describe_counter!(names::PUTS, "Cache write operations.");
        metrics::describe_counter!(names::REMOVES, "Cache removal operations.");
        metrics::describe_counter!(names::ERRORS, "Cache operations that failed.");
        metrics::describe_counter!(names::TIMEOUTS, "Remote commands that exceeded the command timeout.");
        metrics::describe_counter!(
            names::BREAKER_FALLBACK,
            "Reads answered by the fallback cache while the circuit was open."
        );
        metrics::describe_counter!(names::STAMPEDE_LOADS, "Loader executions under stampede protection.");
        metrics::describe_counter!(
            names::STAMPEDE_COALESCED,
            "Reads that picked up a value computed by another in-flight loader."
        );
        metrics::describe_counter!(
            names::STAMPEDE_LOCK_TIMEOUTS,
            "Stampede lock acquisitions that timed out."
        );
        metrics::describe_gauge!(names::HIT_RATE, "Hit rate per namespace, in [0, 1].");
        metrics::describe_histogram!(names::GET_TIMER, metrics::Unit::Seconds, "Latency of get operations.");
        metrics::describe_histogram!(names::PUT_TIMER, metrics::Unit::Seconds, "Latency of put operations.");
        metrics::describe_histogram!(names::REMOVE_TIMER, metrics::Unit::Seconds, "Latency of remove operations.");
        metrics::describe_histogram!(names::GET_ALL_TIMER, metrics::Unit::Seconds, "Latency of batch get operations.");
        metrics::describe_histogram!(names::PUT_ALL_TIMER, metrics::Unit::Seconds, "Latency of batch put operations.");
    };
}

tokio::task_local! {
    /// Ambient request correlation id, inherited by every cache operation
    /// performed within the scope.
    static CORRELATION_ID: String;
}

/// Run `fut` with an ambient correlation id attached.
pub async fn with_correlation_id<F>(id: String, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CORRELATION_ID.scope(id, fut).await
}

/// The ambient correlation id, or a freshly minted one when none is set.
#[must_use]
pub fn current_correlation_id() -> String {
    CORRELATION_ID
        .try_with(std::clone::Clone::clone)
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string())
}

/// Overall readiness of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down { reason: String },
}

/// Per-namespace statistics block of the health payload.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceHealth {
    pub namespace: String,
    /// Hit rate as a percentage in `[0, 100]`.
    pub hit_rate_pct: f64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub current_size: u64,
    pub avg_get_latency_ms: f64,
    pub avg_put_latency_ms: f64,
}

impl From<&CacheStatistics> for NamespaceHealth {
    fn from(stats: &CacheStatistics) -> Self {
        Self {
            namespace: stats.namespace.clone(),
            hit_rate_pct: stats.hit_rate * 100.0,
            hit_count: stats.hit_count,
            miss_count: stats.miss_count,
            eviction_count: stats.eviction_count,
            current_size: stats.current_size,
            avg_get_latency_ms: stats.avg_get_latency_ms,
            avg_put_latency_ms: stats.avg_put_latency_ms,
        }
    }
}

/// Readiness report: `UP` when the remote backend (if configured) answers a
/// ping, with per-namespace statistics either way.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub status: HealthStatus,
    pub namespaces: Vec<NamespaceHealth>,
}
