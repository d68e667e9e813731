//! Core trait abstractions
//!
//! - `CacheContract`: the uniform operation set every backend and wrapper
//!   implements; composition is by delegation.
//! - `RemoteTier`: extension for distributed backends that can report the
//!   remaining TTL of an entry and answer a liveness ping.
//! - `CacheCodec`: pluggable value serialization used by the typed handle
//!   surface.
//!
//! Values cross the contract as raw [`Bytes`]; the typed API on
//! [`NamespacedCache`](crate::manager::NamespacedCache) applies the codec.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};
use crate::stats::CacheStatistics;

/// Uniform cache operation set.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; every operation is safe under
/// concurrent invocation.
///
/// # TTL semantics
///
/// `put` uses the backend's default TTL. `put_with_ttl` sets an absolute
/// expiration for the entry; backends that cannot honor per-entry TTLs fall
/// back to their default and log at debug level.
#[async_trait]
pub trait CacheContract: Send + Sync {
    /// Upsert a value under the default TTL. Overwrites silently.
    async fn put(&self, key: &str, value: Bytes) -> CacheResult<()>;

    /// Upsert a value with an explicit TTL.
    async fn put_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()>;

    /// Fetch a value. `None` when absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    /// Remove a single entry. Idempotent; absent keys are a no-op.
    async fn remove(&self, key: &str) -> CacheResult<()>;

    /// Remove every entry reachable through this handle.
    async fn clear(&self) -> CacheResult<()>;

    /// Presence check that must not materialize the value.
    async fn contains_key(&self, key: &str) -> CacheResult<bool>;

    /// Batch upsert. An empty batch is a no-op with no backend round trip.
    async fn put_all(&self, entries: Vec<(String, Bytes)>) -> CacheResult<()>;

    /// Batch fetch. The result maps each *present* key to its value; absent
    /// keys are simply missing from the map.
    async fn get_all(&self, keys: &[String]) -> CacheResult<HashMap<String, Bytes>>;

    /// Atomic set-if-not-exists. Returns `true` iff the write occurred.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    /// Atomic numeric increment. Backends without native atomicity return
    /// [`CacheError::Unsupported`].
    async fn increment(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// Atomic numeric decrement. Same support rules as [`Self::increment`].
    async fn decrement(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// Remove every key matching a glob-style pattern, returning how many
    /// entries were removed. Backends without key introspection return
    /// [`CacheError::Unsupported`]; callers fall back to [`Self::clear`].
    async fn remove_matching(&self, pattern: &str) -> CacheResult<u64> {
        let _ = pattern;
        Err(CacheError::Unsupported {
            operation: "remove_matching",
            backend: self.backend_name(),
        })
    }

    /// Snapshot of this cache's statistics.
    fn statistics(&self) -> CacheStatistics;

    /// Identifies the backend or wrapper for logging.
    fn backend_name(&self) -> &'static str;
}

/// Distributed tier extension: remaining-TTL reads and liveness.
///
/// The multi-tier coordinator uses [`Self::get_with_remaining_ttl`] so that
/// entries warmed into L1 expire together with their L2 original.
#[async_trait]
pub trait RemoteTier: CacheContract {
    /// Fetch a value together with its remaining TTL. `None` TTL means the
    /// entry has no expiration.
    async fn get_with_remaining_ttl(
        &self,
        key: &str,
    ) -> CacheResult<Option<(Bytes, Option<Duration>)>>;

    /// Liveness probe; `true` when the backend answers.
    async fn ping(&self) -> bool;
}

/// Pluggable value serialization.
///
/// Implementations must be `Send + Sync` to cross async task boundaries.
/// Serialization failures never drop values silently; they surface as
/// [`CacheError::Serialization`].
pub trait CacheCodec: Send + Sync + std::fmt::Debug {
    /// Serialize a value to bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>>;

    /// Deserialize bytes to a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T>;

    /// Codec name for logging.
    fn name(&self) -> &'static str;
}
