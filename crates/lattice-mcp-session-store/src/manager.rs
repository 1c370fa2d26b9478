//! Session lifecycle management.
//!
//! The `SessionManager` owns the (resilient) storage adapter, the event log,
//! and the optional per-node read cache. It is constructed once at bootstrap
//! and threaded through the request path as an explicit value; the breaker
//! and cache live inside it, never as globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::cache::ReadCache;
use crate::config::CacheConfig;
use crate::event_log::EventLog;
use crate::record::{SessionRecord, SessionStatus};
use crate::traits::{SharedSessionStore, StoreError};

const DEFAULT_TRANSITION_RETRIES: u32 = 3;

/// Session-level outcome vocabulary surfaced to the gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session already exists")]
    Exists,

    #[error("session not found")]
    NotFound,

    #[error("concurrent update conflict")]
    Conflict,

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => SessionError::NotFound,
            StoreError::Exists => SessionError::Exists,
            StoreError::Conflict => SessionError::Conflict,
            other => SessionError::Store(other),
        }
    }
}

/// Result alias for session-level operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Session record CRUD and lifecycle transitions over the storage adapter.
pub struct SessionManager {
    store: SharedSessionStore,
    events: EventLog,
    cache: Option<ReadCache>,
    transition_max_retries: u32,
}

impl SessionManager {
    pub fn new(store: SharedSessionStore, cache_config: &CacheConfig) -> Self {
        let cache = cache_config.use_local_cache.then(|| {
            ReadCache::new(
                cache_config.cache_max_entries,
                Duration::from_millis(cache_config.cache_ttl_ms),
            )
        });
        Self {
            events: EventLog::new(Arc::clone(&store)),
            store,
            cache,
            transition_max_retries: DEFAULT_TRANSITION_RETRIES,
        }
    }

    pub fn with_transition_retries(mut self, retries: u32) -> Self {
        self.transition_max_retries = retries.max(1);
        self
    }

    /// The event log bound to the same store.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// The underlying store handle (already resilience-wrapped by the
    /// caller that built this manager).
    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }

    /// Create a session record with the id the upstream transport assigned.
    /// Initial status is `Initialized`, version 1. `Exists` if any instance
    /// already created it.
    pub async fn create(
        &self,
        id: &str,
        initial_metadata: HashMap<String, Value>,
    ) -> SessionResult<SessionRecord> {
        let record = SessionRecord::new(id, initial_metadata, self.store.now_millis());
        self.store.put_session_if_absent(record.clone()).await?;
        debug!(session_id = %id, "session created");
        if let Some(cache) = &self.cache {
            cache.put(record.clone());
        }
        Ok(record)
    }

    /// Fetch a record, serving from the read cache when fresh.
    pub async fn get(&self, id: &str) -> SessionResult<SessionRecord> {
        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(id) {
                return Ok(record);
            }
        }
        let record = self.store.get_session(id).await?;
        if let Some(cache) = &self.cache {
            cache.put(record.clone());
        }
        Ok(record)
    }

    /// Fetch a record straight from the store. The admission path uses this
    /// exclusively: a stale cache answer there causes wrong rehydration.
    pub async fn get_uncached(&self, id: &str) -> SessionResult<SessionRecord> {
        let record = self.store.get_session(id).await?;
        if let Some(cache) = &self.cache {
            cache.put(record.clone());
        }
        Ok(record)
    }

    /// Move a session along the lifecycle DAG under CAS, retrying conflicts
    /// a bounded number of times. Already being in `to` is an idempotent
    /// no-op; any other mismatch is an illegal transition.
    pub async fn transition(
        &self,
        id: &str,
        from: SessionStatus,
        to: SessionStatus,
        metadata_patch: Option<HashMap<String, Value>>,
    ) -> SessionResult<SessionRecord> {
        if !from.can_transition_to(to) {
            error!(session_id = %id, %from, %to, "illegal transition requested");
            return Err(SessionError::IllegalTransition { from, to });
        }

        for _ in 0..self.transition_max_retries {
            let current = self.store.get_session(id).await?;
            if current.status == to {
                return Ok(current);
            }
            if current.status != from {
                error!(
                    session_id = %id,
                    actual = %current.status,
                    expected = %from,
                    %to,
                    "status moved underneath transition"
                );
                return Err(SessionError::IllegalTransition {
                    from: current.status,
                    to,
                });
            }

            let mut next = current.clone();
            next.status = to;
            if let Some(patch) = &metadata_patch {
                for (key, value) in patch {
                    next.metadata.insert(key.clone(), value.clone());
                }
            }

            match self
                .store
                .update_session_cas(id, current.version, next.clone())
                .await
            {
                Ok(version) => {
                    next.version = version;
                    debug!(session_id = %id, %from, %to, version, "session transitioned");
                    if let Some(cache) = &self.cache {
                        cache.put(next.clone());
                    }
                    return Ok(next);
                }
                Err(StoreError::Conflict) => {
                    warn!(session_id = %id, "transition lost CAS race, retrying");
                    self.invalidate(id);
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(SessionError::Conflict)
    }

    /// CAS-merge a metadata patch; last writer wins per key.
    pub async fn touch_metadata(
        &self,
        id: &str,
        patch: HashMap<String, Value>,
    ) -> SessionResult<SessionRecord> {
        for _ in 0..self.transition_max_retries {
            let current = self.store.get_session(id).await?;
            let mut next = current.clone();
            for (key, value) in &patch {
                next.metadata.insert(key.clone(), value.clone());
            }
            match self
                .store
                .update_session_cas(id, current.version, next.clone())
                .await
            {
                Ok(version) => {
                    next.version = version;
                    if let Some(cache) = &self.cache {
                        cache.put(next.clone());
                    }
                    return Ok(next);
                }
                Err(StoreError::Conflict) => self.invalidate(id),
                Err(other) => return Err(other.into()),
            }
        }
        Err(SessionError::Conflict)
    }

    /// Close a session. Idempotent: already-closed returns the record as-is.
    pub async fn close(&self, id: &str) -> SessionResult<SessionRecord> {
        for _ in 0..self.transition_max_retries {
            let current = self.store.get_session(id).await?;
            if current.status == SessionStatus::Closed {
                return Ok(current);
            }

            let mut next = current.clone();
            next.status = SessionStatus::Closed;
            match self
                .store
                .update_session_cas(id, current.version, next.clone())
                .await
            {
                Ok(version) => {
                    next.version = version;
                    debug!(session_id = %id, "session closed");
                    if let Some(cache) = &self.cache {
                        cache.put(next.clone());
                    }
                    return Ok(next);
                }
                Err(StoreError::Conflict) => self.invalidate(id),
                Err(other) => return Err(other.into()),
            }
        }
        Err(SessionError::Conflict)
    }

    /// Drop the local cache entry for `id`. Used whenever external evidence
    /// contradicts cached state.
    pub fn invalidate(&self, id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(id);
        }
    }

    /// Tear down: flush the cache and close store connections.
    pub async fn shutdown(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        if let Err(err) = self.store.close().await {
            warn!(error = %err, "store close failed during shutdown");
        }
    }
}
