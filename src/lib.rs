//! Strata Cache
//!
//! An embeddable multi-tier caching engine for service processes:
//! - **Namespaced handles**: one shared backend, lexical `<namespace>:<key>`
//!   scoping, per-namespace decorator chains built once.
//! - **L1 + L2 coordination**: in-memory Moka tier in front of a distributed
//!   Redis tier with read-through warm-up and write-through.
//! - **Cross-instance invalidation**: eviction events over Redis Pub/Sub with
//!   self-echo suppression.
//! - **Resilience**: circuit breaking on backend failure, cache-stampede
//!   suppression via distributed locking, bounded timeouts everywhere.
//! - **Observability**: hit/miss counters, latency histograms, structured
//!   logs with correlation ids, health reporting.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use strata_cache::{CacheConfig, CacheManager};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), strata_cache::CacheError> {
//!     let manager = CacheManager::new(CacheConfig::default()).await?;
//!     let users = manager.get_cache("users")?;
//!
//!     users.put("u1", &json!({"name": "Ada"})).await?;
//!     let cached: Option<serde_json::Value> = users.get("u1").await?;
//!     println!("cached: {cached:?}");
//!
//!     let stats = users.statistics();
//!     println!("hit rate: {:.2}", stats.hit_rate);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! Every namespace handle is the head of a decorator chain over the shared
//! backend:
//!
//! ```text
//! Namespace -> Metrics -> CircuitBreaker -> StampedeProtection
//!           -> Compression -> Encryption -> Backend (L1 | L2 | L1+L2)
//! ```
//!
//! Declarative call-site caching ([`CacheLookup`], [`CacheWrite`],
//! [`CacheInvalidate`]) routes method invocations through the same handles.

pub mod backends;
pub mod codecs;
pub mod config;
pub mod error;
pub mod eviction;
pub mod intercept;
pub mod manager;
pub mod observability;
pub mod stats;
pub mod traits;
pub mod wrappers;

pub use backends::{LocalBackend, MultiTierCoordinator, MultiTierStats, RemoteBackend};
pub use codecs::JsonCodec;
pub use config::{CacheConfig, CacheType, DeploymentMode, NamespaceConfig};
pub use error::{CacheError, CacheResult};
pub use eviction::{EvictionEvent, EvictionKind, EvictionPublisher, EvictionSubscriber, InstanceId};
pub use intercept::{CacheInvalidate, CacheLookup, CacheWrite, Expression, Invocation};
pub use manager::{CacheManager, NamespacedCache};
pub use observability::{HealthReport, HealthStatus, NamespaceHealth};
pub use stats::CacheStatistics;
pub use traits::{CacheCodec, CacheContract, RemoteTier};
pub use wrappers::{BreakerState, StampedeProtection};

// Re-export async_trait for custom backend implementations.
pub use async_trait::async_trait;
