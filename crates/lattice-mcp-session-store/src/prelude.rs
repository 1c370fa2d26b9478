//! Convenience re-exports for downstream crates.

pub use crate::cache::ReadCache;
pub use crate::config::{CacheConfig, ResilienceConfig, StoreBackend, StoreConfig};
pub use crate::event_log::EventLog;
pub use crate::in_memory::InMemorySessionStore;
pub use crate::manager::{SessionError, SessionManager, SessionResult};
pub use crate::record::{
    Direction, EventBody, EventKind, EventRecord, SessionRecord, SessionStatus, STREAM_REQUEST,
    STREAM_STANDALONE,
};
#[cfg(feature = "redis")]
pub use crate::redis::RedisSessionStore;
pub use crate::resilience::{BreakerState, CircuitBreaker, ResilientStore};
pub use crate::traits::{SessionStore, SharedSessionStore, StoreError, StoreResult};
pub use crate::build_store;
