//! Typed configuration surface and startup validation
//!
//! The configuration is a serde-deserializable tree supplied once at startup.
//! [`CacheConfig::validate`] fails the process with a single
//! [`CacheError::Configuration`] naming the offending property; nothing is
//! validated lazily afterwards.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Deserialize a duration expressed in whole seconds.
mod duration_secs {
    use super::{Deserialize, Duration};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Deserialize an optional duration expressed in whole seconds.
mod opt_duration_secs {
    use super::{Deserialize, Duration};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

/// Deserialize a duration expressed in milliseconds.
mod duration_millis {
    use super::{Deserialize, Duration};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Which base backend the manager owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheType {
    Local,
    Remote,
    MultiTier,
}

/// Remote deployment mode, inferred from configuration presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Standalone,
    Sentinel,
    Cluster,
}

/// Root configuration tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Master kill switch. A disabled engine refuses to start.
    pub enabled: bool,
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Namespace default TTL; must be positive.
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    /// Per-namespace overrides, keyed by namespace name.
    pub namespaces: HashMap<String, NamespaceOverrides>,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub features: FeaturesConfig,
    pub resilience: ResilienceConfig,
    pub observability: ObservabilityConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_type: CacheType::Local,
            default_ttl: Duration::from_secs(300),
            namespaces: HashMap::new(),
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            features: FeaturesConfig::default(),
            resilience: ResilienceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Per-namespace overrides; unset fields inherit the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceOverrides {
    #[serde(with = "opt_duration_secs")]
    pub ttl: Option<Duration>,
    pub compression_enabled: Option<bool>,
    pub encryption_enabled: Option<bool>,
    pub stampede_protection_enabled: Option<bool>,
    pub circuit_breaker_enabled: Option<bool>,
}

/// Resolved, immutable per-namespace configuration. Created once when the
/// namespace is first requested; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub namespace: String,
    pub ttl: Duration,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub stampede_protection_enabled: bool,
    pub circuit_breaker_enabled: bool,
}

/// Local (L1) backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalConfig {
    pub maximum_size: u64,
    #[serde(with = "opt_duration_secs")]
    pub ttl: Option<Duration>,
    pub eviction_policy: EvictionPolicy,
    pub record_stats: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            maximum_size: 10_000,
            ttl: None,
            eviction_policy: EvictionPolicy::Lru,
            record_stats: true,
        }
    }
}

/// Local eviction policy. The backend is approximately-LRU either way; the
/// option exists so deployments can state their intent explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    TinyLfu,
}

/// Remote (L2) backend settings and deployment-mode selectors.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    #[serde(with = "duration_millis")]
    pub command_timeout: Duration,
    /// Default TTL for entries written without an explicit one.
    #[serde(with = "duration_secs")]
    pub time_to_live: Duration,
    pub use_ssl: bool,
    pub ssl: SslConfig,
    pub acl: AclConfig,
    pub pipelining: PipeliningConfig,
    pub read_strategy: ReadStrategyConfig,
    pub cluster: ClusterConfig,
    pub sentinel: SentinelConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            command_timeout: Duration::from_millis(2_000),
            time_to_live: Duration::from_secs(3_600),
            use_ssl: false,
            ssl: SslConfig::default(),
            acl: AclConfig::default(),
            pipelining: PipeliningConfig::default(),
            read_strategy: ReadStrategyConfig::default(),
            cluster: ClusterConfig::default(),
            sentinel: SentinelConfig::default(),
        }
    }
}

/// TLS material for `rediss://` connections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
}

/// Authentication. Password-only or username+password (ACL) forms.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AclConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Batch pipelining controls for `put_all` / `get_all`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipeliningConfig {
    pub enabled: bool,
    pub batch_size: usize,
}

impl Default for PipeliningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
        }
    }
}

/// Read routing preferences (cluster mode only).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadStrategyConfig {
    pub prefer_replica: bool,
}

/// Cluster node list; non-empty selects cluster mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub nodes: Vec<String>,
}

/// Sentinel failover settings; a set `master` selects sentinel mode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentinelConfig {
    pub master: Option<String>,
    pub nodes: Vec<String>,
}

/// Optional value transformations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeaturesConfig {
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: String,
    /// Payloads below this many bytes are stored uncompressed.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: "gzip".to_string(),
            threshold: 1_024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub algorithm: String,
    /// Key material: 64 hex chars, base64, or 32 raw bytes.
    pub key: String,
    pub key_size: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: "AES_GCM".to_string(),
            key: String::new(),
            key_size: 256,
        }
    }
}

/// Resilience toggles and thresholds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub stampede_protection: StampedeConfig,
    pub timeout: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Percentage of failed calls, in `(0, 100]`, that opens the circuit.
    pub failure_rate_threshold: f64,
    #[serde(with = "duration_secs")]
    pub wait_duration_in_open_state: Duration,
    /// Count-based sliding window size.
    pub sliding_window_size: usize,
    /// Minimum observed calls before the failure rate is evaluated.
    pub minimum_number_of_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_state: Duration::from_secs(30),
            sliding_window_size: 100,
            minimum_number_of_calls: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StampedeConfig {
    pub enabled: bool,
    /// Bound on the wait for the per-key lock.
    #[serde(with = "duration_millis")]
    pub lock_timeout: Duration,
    /// Bound on the loader computation once the lock is held.
    #[serde(with = "duration_millis")]
    pub computation_timeout: Duration,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_timeout: Duration::from_millis(5_000),
            computation_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub operation_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            operation_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Observability toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservabilityConfig {
    pub metrics: Toggle,
    pub health: Toggle,
    pub tracing: Toggle,
    pub logging: Toggle,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let on = Toggle { enabled: true };
        Self {
            metrics: on.clone(),
            health: on.clone(),
            tracing: on.clone(),
            logging: on,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Toggle {
    pub enabled: bool,
}

impl Default for Toggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl CacheConfig {
    /// Validate the whole tree. Returns the first violation as a
    /// [`CacheError::Configuration`] naming the offending property.
    pub fn validate(&self) -> CacheResult<()> {
        if !self.enabled {
            return Err(CacheError::configuration(
                "enabled: the cache engine is disabled; refusing to start",
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::configuration(
                "defaultTtl: must be a positive duration",
            ));
        }
        if self.local.maximum_size == 0 {
            return Err(CacheError::configuration(
                "local.maximumSize: must be greater than zero",
            ));
        }
        if self.features.encryption.enabled && self.features.encryption.key.trim().is_empty() {
            return Err(CacheError::configuration(
                "features.encryption.key: required when encryption is enabled",
            ));
        }
        if self.features.compression.enabled
            && !self.features.compression.algorithm.eq_ignore_ascii_case("gzip")
        {
            return Err(CacheError::configuration(format!(
                "features.compression.algorithm: unsupported '{}' (only gzip)",
                self.features.compression.algorithm
            )));
        }
        if self.features.encryption.enabled {
            let algorithm = &self.features.encryption.algorithm;
            if !algorithm.eq_ignore_ascii_case("aes_gcm") && !algorithm.eq_ignore_ascii_case("aes-gcm")
            {
                return Err(CacheError::configuration(format!(
                    "features.encryption.algorithm: unsupported '{algorithm}' (only AES_GCM)"
                )));
            }
        }
        if matches!(self.cache_type, CacheType::Remote | CacheType::MultiTier) {
            self.validate_remote()?;
        }
        for (name, overrides) in &self.namespaces {
            if name.trim().is_empty() {
                return Err(CacheError::configuration(
                    "namespaces: namespace names must be non-empty",
                ));
            }
            if let Some(ttl) = overrides.ttl {
                if ttl.is_zero() {
                    return Err(CacheError::configuration(format!(
                        "namespaces.{name}.ttl: must be a positive duration"
                    )));
                }
            }
        }
        if self.resilience.circuit_breaker.enabled {
            let breaker = &self.resilience.circuit_breaker;
            if !(0.0..=100.0).contains(&breaker.failure_rate_threshold)
                || breaker.failure_rate_threshold == 0.0
            {
                return Err(CacheError::configuration(
                    "resilience.circuitBreaker.failureRateThreshold: must be in (0, 100]",
                ));
            }
            if breaker.sliding_window_size == 0 {
                return Err(CacheError::configuration(
                    "resilience.circuitBreaker.slidingWindowSize: must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    fn validate_remote(&self) -> CacheResult<()> {
        match self.deployment_mode() {
            DeploymentMode::Cluster => {
                if self.remote.cluster.nodes.iter().any(|n| n.trim().is_empty()) {
                    return Err(CacheError::configuration(
                        "remote.cluster.nodes: node addresses must be non-empty",
                    ));
                }
            }
            DeploymentMode::Sentinel => {
                if self.remote.sentinel.nodes.is_empty() {
                    return Err(CacheError::configuration(
                        "remote.sentinel.nodes: at least one sentinel node is required",
                    ));
                }
            }
            DeploymentMode::Standalone => {
                if self.remote.host.trim().is_empty() {
                    return Err(CacheError::configuration(
                        "remote.host: must be non-empty",
                    ));
                }
                if self.remote.port == 0 {
                    return Err(CacheError::configuration(
                        "remote.port: must be within 1-65535",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Infer the remote deployment mode from configuration presence.
    #[must_use]
    pub fn deployment_mode(&self) -> DeploymentMode {
        if !self.remote.cluster.nodes.is_empty() {
            DeploymentMode::Cluster
        } else if self.remote.sentinel.master.is_some() {
            DeploymentMode::Sentinel
        } else {
            DeploymentMode::Standalone
        }
    }

    /// Merge engine defaults with per-namespace overrides into the immutable
    /// record the manager builds decorator chains from.
    #[must_use]
    pub fn resolve_namespace(&self, namespace: &str) -> NamespaceConfig {
        let overrides = self.namespaces.get(namespace);
        NamespaceConfig {
            namespace: namespace.to_string(),
            ttl: overrides
                .and_then(|o| o.ttl)
                .unwrap_or(self.default_ttl),
            compression_enabled: overrides
                .and_then(|o| o.compression_enabled)
                .unwrap_or(self.features.compression.enabled),
            encryption_enabled: overrides
                .and_then(|o| o.encryption_enabled)
                .unwrap_or(self.features.encryption.enabled),
            stampede_protection_enabled: overrides
                .and_then(|o| o.stampede_protection_enabled)
                .unwrap_or(self.resilience.stampede_protection.enabled),
            circuit_breaker_enabled: overrides
                .and_then(|o| o.circuit_breaker_enabled)
                .unwrap_or(self.resilience.circuit_breaker.enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_default_ttl_is_rejected() {
        let config = CacheConfig {
            default_ttl: Duration::ZERO,
            ..CacheConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defaultTtl"));
    }

    #[test]
    fn encryption_without_key_fails_startup() {
        let mut config = CacheConfig::default();
        config.features.encryption.enabled = true;
        config.features.encryption.key = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("features.encryption.key"));
    }

    #[test]
    fn unsupported_algorithms_are_rejected() {
        let mut config = CacheConfig::default();
        config.features.compression.enabled = true;
        config.features.compression.algorithm = "zstd".to_string();
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.features.encryption.enabled = true;
        config.features.encryption.key = "0".repeat(64);
        config.features.encryption.algorithm = "DES".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_remote_host_is_rejected() {
        let mut config = CacheConfig {
            cache_type: CacheType::Remote,
            ..CacheConfig::default()
        };
        config.remote.host = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote.host"));
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = CacheConfig {
            cache_type: CacheType::MultiTier,
            ..CacheConfig::default()
        };
        config.remote.port = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("remote.port"));
    }

    #[test]
    fn zero_maximum_size_is_rejected() {
        let mut config = CacheConfig::default();
        config.local.maximum_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("local.maximumSize"));
    }

    #[test]
    fn disabled_engine_refuses_to_start() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deployment_mode_inference() {
        let mut config = CacheConfig::default();
        assert_eq!(config.deployment_mode(), DeploymentMode::Standalone);

        config.remote.sentinel.master = Some("mymaster".to_string());
        assert_eq!(config.deployment_mode(), DeploymentMode::Sentinel);

        // Cluster nodes win over sentinel.
        config.remote.cluster.nodes = vec!["redis://node1:6379".to_string()];
        assert_eq!(config.deployment_mode(), DeploymentMode::Cluster);
    }

    #[test]
    fn namespace_resolution_merges_overrides() {
        let mut config = CacheConfig::default();
        config.features.compression.enabled = true;
        config.namespaces.insert(
            "sessions".to_string(),
            NamespaceOverrides {
                ttl: Some(Duration::from_secs(60)),
                compression_enabled: Some(false),
                encryption_enabled: None,
                stampede_protection_enabled: Some(true),
                circuit_breaker_enabled: None,
            },
        );

        let resolved = config.resolve_namespace("sessions");
        assert_eq!(resolved.ttl, Duration::from_secs(60));
        assert!(!resolved.compression_enabled);
        assert!(!resolved.encryption_enabled);
        assert!(resolved.stampede_protection_enabled);

        let other = config.resolve_namespace("users");
        assert_eq!(other.ttl, config.default_ttl);
        assert!(other.compression_enabled);
    }

    #[test]
    fn config_deserializes_from_json_tree() {
        let json = serde_json::json!({
            "type": "MULTI_TIER",
            "defaultTtl": 600,
            "namespaces": {
                "users": { "ttl": 120, "encryptionEnabled": true }
            },
            "local": { "maximumSize": 5000 },
            "remote": { "host": "cache.internal", "port": 6380, "commandTimeout": 500 },
            "features": {
                "compression": { "enabled": true, "threshold": 2048 },
                "encryption": { "enabled": false }
            },
            "resilience": {
                "circuitBreaker": { "enabled": true, "failureRateThreshold": 40.0 }
            }
        });

        let config: CacheConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.cache_type, CacheType::MultiTier);
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.remote.host, "cache.internal");
        assert_eq!(config.remote.command_timeout, Duration::from_millis(500));
        assert_eq!(config.features.compression.threshold, 2048);
        assert!(config.validate().is_ok());

        let users = config.resolve_namespace("users");
        assert_eq!(users.ttl, Duration::from_secs(120));
        assert!(users.encryption_enabled);
    }
}
