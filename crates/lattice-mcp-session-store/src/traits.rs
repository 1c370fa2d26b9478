//! Storage adapter trait and its error vocabulary.
//!
//! The rest of the crate depends only on this capability set: key/value
//! session records with optimistic CAS, append-only per-session event
//! streams, and advisory locks with TTL expiry. Two implementations exist
//! behind it:
//! - `InMemorySessionStore`: development and tests
//! - `RedisSessionStore`: shared durable backend (feature `redis`)

use std::time::Duration;

use async_trait::async_trait;

use crate::record::{EventBody, EventRecord, SessionRecord};

/// Storage outcome visible to the rest of the core.
///
/// Backend-specific failures must not leak upward; anything transient maps
/// to `Unavailable`, which is the only variant the retry and circuit-breaker
/// wrappers act on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,

    #[error("session already exists")]
    Exists,

    #[error("version conflict")]
    Conflict,

    #[error("lock held by another holder")]
    Held,

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the retry wrapper should attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result alias for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value + stream storage primitives backing the session layer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name for logging and diagnostics.
    fn backend_name(&self) -> &'static str;

    /// Fetch a session record (including its current version).
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord>;

    /// Create a record iff no record exists for its id. Returns `Exists`
    /// otherwise; this is the cluster-wide uniqueness point for session ids.
    async fn put_session_if_absent(&self, record: SessionRecord) -> StoreResult<()>;

    /// Replace a record iff its stored version equals `expected_version`.
    /// The stored version becomes `expected_version + 1`; the new version is
    /// returned. `Conflict` on mismatch, `NotFound` if the record is gone.
    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        record: SessionRecord,
    ) -> StoreResult<u64>;

    /// Physically remove a record and its event streams.
    async fn delete_session(&self, id: &str) -> StoreResult<()>;

    /// Append an event to a per-session stream and return its assigned id.
    /// Ids are strictly increasing within one `(session_id, stream_key)`
    /// pair. Appending to a `Closed` session returns `Conflict`.
    async fn append_event(
        &self,
        session_id: &str,
        stream_key: &str,
        event: EventBody,
    ) -> StoreResult<u64>;

    /// Read events in id order, optionally strictly after `after_id`,
    /// optionally bounded by `limit`.
    async fn read_events(
        &self,
        session_id: &str,
        stream_key: &str,
        after_id: Option<u64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>>;

    /// Highest assigned event id on a stream, if any events remain.
    async fn latest_event_id(&self, session_id: &str, stream_key: &str)
        -> StoreResult<Option<u64>>;

    /// Drop events from the head of a stream so at most `max_len` remain.
    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: &str,
        max_len: usize,
    ) -> StoreResult<()>;

    /// Acquire an advisory lock. `Held` if another holder owns it; the lock
    /// auto-expires at `ttl`. Re-acquiring by the same holder refreshes it.
    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> StoreResult<()>;

    /// Release an advisory lock held by `holder_id`. Releasing a lock held
    /// by someone else (or already expired) returns `Held` / `NotFound`.
    async fn release_lock(&self, name: &str, holder_id: &str) -> StoreResult<()>;

    /// Advisory clock, Unix millis. Used for record timestamps so that all
    /// writers on an instance agree on a time source.
    fn now_millis(&self) -> u64;

    /// Liveness probe for the backend.
    async fn is_healthy(&self) -> bool;

    /// Release backend connections. Idempotent.
    async fn close(&self) -> StoreResult<()>;
}

/// Boxed trait object alias used throughout the crate.
pub type SharedSessionStore = std::sync::Arc<dyn SessionStore>;

pub(crate) fn unix_millis_now() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
