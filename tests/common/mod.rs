//! Shared test infrastructure
//!
//! Redis-backed suites probe for a reachable server first and skip cleanly
//! when none is available, so the local-only suites always run.

#![allow(dead_code)]

use std::time::Duration;

use strata_cache::{CacheConfig, CacheType};

/// Redis URL from the environment or the conventional local default.
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Host and port parsed out of [`redis_url`].
pub fn redis_host_port() -> (String, u16) {
    let url = redis_url();
    let trimmed = url
        .strip_prefix("redis://")
        .or_else(|| url.strip_prefix("rediss://"))
        .unwrap_or(&url);
    let authority = trimmed.split('/').next().unwrap_or(trimmed);
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    match host_port.split_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(6379),
        ),
        None => (host_port.to_string(), 6379),
    }
}

/// Whether a Redis server answers within half a second.
pub async fn redis_available() -> bool {
    let Ok(client) = redis::Client::open(redis_url()) else {
        return false;
    };
    matches!(
        tokio::time::timeout(
            Duration::from_millis(500),
            client.get_multiplexed_async_connection(),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Unique key so concurrent test runs never collide.
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Unique namespace per test.
pub fn test_namespace(name: &str) -> String {
    format!("t{}_{}", rand::random::<u16>(), name)
}

/// Engine configuration for a local-only deployment.
pub fn local_config() -> CacheConfig {
    CacheConfig::default()
}

/// Engine configuration for a multi-tier deployment against the test Redis,
/// or `None` when no server is reachable.
pub async fn multi_tier_config() -> Option<CacheConfig> {
    if !redis_available().await {
        eprintln!("skipping: no redis server reachable at {}", redis_url());
        return None;
    }
    let (host, port) = redis_host_port();
    let mut config = CacheConfig {
        cache_type: CacheType::MultiTier,
        ..CacheConfig::default()
    };
    config.remote.host = host;
    config.remote.port = port;
    Some(config)
}

/// Engine configuration for a remote-only deployment, or `None` when no
/// server is reachable.
pub async fn remote_config() -> Option<CacheConfig> {
    let mut config = multi_tier_config().await?;
    config.cache_type = CacheType::Remote;
    Some(config)
}

/// Test data generators.
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct User {
        pub id: u64,
        pub name: String,
        pub email: String,
    }

    impl User {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                name: format!("User {id}"),
                email: format!("user{id}@example.com"),
            }
        }
    }

    pub fn json_user(id: u64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("User {id}"),
            "email": format!("user{id}@example.com"),
        })
    }
}

/// Poll `condition` until it holds or `timeout_ms` elapses.
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
