//! # Lattice Session Store
//!
//! Durable session state for MCP servers running as a fleet behind a load
//! balancer. This crate owns everything below the request path:
//! - The storage adapter abstraction with pluggable backends:
//!   - InMemory: development and testing
//!   - Redis: shared key/value + stream store for multi-instance production
//! - Retry, timeout, and circuit-breaker wrappers around every store call
//! - The append-only per-session event log used for auditing and SSE replay
//! - The session manager: record lifecycle under optimistic concurrency,
//!   with an optional per-node read cache
//!
//! Session identifiers are always assigned by the upstream MCP transport and
//! treated as opaque tokens; nothing in this crate generates one.

pub mod cache;
pub mod config;
pub mod event_log;
pub mod in_memory;
pub mod manager;
pub mod prelude;
pub mod record;
#[cfg(feature = "redis")]
pub mod redis;
pub mod resilience;
pub mod traits;

pub use cache::ReadCache;
pub use config::{CacheConfig, ResilienceConfig, StoreBackend, StoreConfig};
pub use event_log::EventLog;
pub use in_memory::{InMemorySessionStore, InMemoryStoreConfig, InMemoryStoreStats};
pub use manager::{SessionError, SessionManager, SessionResult};
pub use record::{
    Direction, EventBody, EventKind, EventRecord, SessionRecord, SessionStatus, STREAM_REQUEST,
    STREAM_STANDALONE,
};
#[cfg(feature = "redis")]
pub use redis::RedisSessionStore;
pub use resilience::{BreakerState, CircuitBreaker, ResilientStore, RetryPolicy};
pub use traits::{SessionStore, SharedSessionStore, StoreError, StoreResult};

use std::sync::Arc;

/// Build the configured storage adapter, already wrapped with the retry /
/// breaker / timeout guards. This is the constructor the gateway uses at
/// bootstrap.
pub async fn build_store(
    store_config: &StoreConfig,
    resilience_config: &ResilienceConfig,
) -> StoreResult<SharedSessionStore> {
    let inner: SharedSessionStore = match store_config.backend {
        StoreBackend::InMemory => Arc::new(InMemorySessionStore::with_config(InMemoryStoreConfig {
            max_events_per_stream: store_config.stream_maxlen,
            session_ttl: store_config
                .session_ttl_ms
                .map(std::time::Duration::from_millis),
        })),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => Arc::new(RedisSessionStore::connect(store_config).await?),
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            return Err(StoreError::Unavailable(
                "redis backend requested but the `redis` feature is not enabled".to_string(),
            ))
        }
    };
    Ok(Arc::new(ResilientStore::new(inner, resilience_config)))
}
