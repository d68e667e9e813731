//! Error taxonomy for the cache engine
//!
//! Backends surface typed errors; the wrappers above them decide what is
//! absorbed, what is transformed and what reaches the caller. Only
//! `Configuration` (at startup) and write-side `CircuitOpen` / `Timeout`
//! (at runtime) are expected to be user-visible.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type CacheResult<T> = Result<T, CacheError>;

/// All failure kinds the engine can produce.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Invalid configuration detected at startup. Fails the process.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Names the offending property and why it was rejected.
        message: String,
    },

    /// Transport-level failure talking to the remote backend. Retryable.
    #[error("connection to {host}:{port} failed: {message}")]
    Connection {
        host: String,
        port: u16,
        message: String,
    },

    /// Value could not be serialized or deserialized. Not retryable for
    /// the same value.
    #[error("serialization failed: {message}")]
    Serialization { message: String },

    /// An operation or a loader computation exceeded its deadline.
    #[error("operation '{operation}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The circuit breaker suppressed the call.
    #[error("circuit breaker open for cache '{namespace}'")]
    CircuitOpen { namespace: String },

    /// The backend cannot provide the requested operation (e.g. atomic
    /// counters on the local backend).
    #[error("operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Data-access failure on a specific key. Catch-all for backend errors
    /// that are neither transport nor serialization problems.
    #[error("cache operation '{operation}' failed for key '{key}': {message}")]
    Backend {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// Wrapper for failures that do not fit the taxonomy above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CacheError {
    /// Shortcut for configuration failures.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shortcut for serialization failures.
    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}
