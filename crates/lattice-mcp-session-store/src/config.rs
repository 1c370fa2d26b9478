//! Store-side configuration.
//!
//! Plain structs with defaults; `Deserialize` so deployments can load them
//! from a config file. Behavior toggles are enumerated options, never type
//! parameters.

use serde::Deserialize;

/// Which storage adapter backs the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Concurrency-safe in-process maps; development and tests.
    #[default]
    InMemory,
    /// Shared Redis-compatible key/value + stream store.
    Redis,
}

/// Storage adapter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL for the shared backend.
    pub url: String,
    /// Key namespace prefix for the shared backend.
    pub prefix: String,
    /// Upper bound on per-stream retention (approximate for Redis).
    pub stream_maxlen: usize,
    /// Optional session TTL in milliseconds; `None` means infinite.
    pub session_ttl_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            url: "redis://127.0.0.1:6379/0".to_string(),
            prefix: "lattice".to_string(),
            stream_maxlen: 10_000,
            session_ttl_ms: None,
        }
    }
}

/// Retry, timeout, and circuit-breaker settings applied to every store call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Attempts per logical call, transient failures only.
    pub retry_max_attempts: u32,
    /// Exponential backoff base in milliseconds.
    pub retry_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub retry_cap_ms: u64,
    /// Per-attempt timeout in milliseconds; elapse counts as unavailable.
    pub op_timeout_ms: u64,
    /// Consecutive unavailable outcomes before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// Open-state cooldown in milliseconds before a half-open probe.
    pub breaker_cooldown_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_ms: 50,
            retry_cap_ms: 2_000,
            op_timeout_ms: 2_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 10_000,
        }
    }
}

/// Per-node read cache settings for the session manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub use_local_cache: bool,
    pub cache_max_entries: usize,
    pub cache_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_local_cache: true,
            cache_max_entries: 1_024,
            cache_ttl_ms: 5_000,
        }
    }
}
