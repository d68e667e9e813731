//! Decorator wrappers over the cache contract
//!
//! Each wrapper implements [`CacheContract`](crate::traits::CacheContract) by
//! delegation and adds exactly one concern. The manager composes them per
//! namespace, outermost first:
//!
//! ```text
//! Namespace -> Metrics -> CircuitBreaker -> StampedeProtection
//!           -> Compression -> Encryption -> Backend
//! ```
//!
//! Namespace prefixing is purely lexical and sits outermost; metrics must
//! observe public timing including breaker decisions; the breaker
//! short-circuits before a stampede lock is acquired; compression precedes
//! encryption so ciphertext is never fed to the compressor.

pub mod breaker;
pub mod compression;
pub mod encryption;
pub mod metrics;
pub mod namespace;
pub mod stampede;
pub mod timeout;

pub use breaker::{BreakerState, CircuitBreakerWrapper};
pub use compression::CompressionWrapper;
pub use encryption::EncryptionWrapper;
pub use metrics::MetricsWrapper;
pub use namespace::NamespaceWrapper;
pub use stampede::{LocalLockProvider, LockProvider, RedisLockProvider, StampedeProtection};
pub use timeout::TimeoutWrapper;
