//! Admission control: rehydrating upstream transports for sessions this
//! instance has never seen.
//!
//! Runs after session-id extraction and before the request is forwarded.
//! Reads always bypass the manager's cache: a stale answer here causes
//! incorrect rehydration. Transport creation is guarded by a store-side
//! advisory lock, but correctness does not depend on it; the upstream's
//! `create_transport_for_session` is idempotent and the lock only trims
//! duplicate work.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use lattice_mcp_session_store::{SessionError, SessionManager, SessionStatus, StoreError};

use crate::config::GatewayConfig;
use crate::upstream::UpstreamSessionManager;
use crate::{GatewayError, Result};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Forward to the upstream handler. `session_known` is false only for a
    /// fresh initialize, where the upstream will mint the session and the
    /// durable record does not exist yet.
    Forward { session_known: bool },
    /// No record anywhere in the cluster. Answer the configured
    /// unknown-session status without touching the upstream.
    UnknownSession,
    /// The record exists but the session is terminated. Answer 404.
    SessionClosed,
}

/// Rehydrates upstream transport state from the durable store.
pub struct AdmissionController {
    sessions: Arc<SessionManager>,
    upstream: Arc<dyn UpstreamSessionManager>,
    /// Sessions this instance has already warmed; warming happens at most
    /// once per (instance, session).
    warmed: Mutex<HashSet<String>>,
    /// Advisory-lock holder identity for this instance.
    holder_id: String,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl AdmissionController {
    pub fn new(
        sessions: Arc<SessionManager>,
        upstream: Arc<dyn UpstreamSessionManager>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            sessions,
            upstream,
            warmed: Mutex::new(HashSet::new()),
            holder_id: uuid::Uuid::now_v7().to_string(),
            lock_ttl: Duration::from_millis(config.admit_lock_ttl_ms),
            lock_wait: Duration::from_millis(config.admit_lock_wait_ms),
        }
    }

    /// Ensure local transport state exists for `session_id` before the
    /// gateway forwards. `is_initialize` marks a fresh initialize request,
    /// for which an unknown id passes through (creation is deferred to the
    /// response observation).
    pub async fn admit(&self, session_id: &str, is_initialize: bool) -> Result<AdmissionDecision> {
        if self.upstream.has_session(session_id).await {
            return Ok(AdmissionDecision::Forward { session_known: true });
        }

        // Authoritative read; never the cache.
        let record = match self.sessions.get_uncached(session_id).await {
            Ok(record) => record,
            Err(SessionError::NotFound) => {
                return Ok(if is_initialize {
                    AdmissionDecision::Forward {
                        session_known: false,
                    }
                } else {
                    AdmissionDecision::UnknownSession
                });
            }
            Err(err) => return Err(err.into()),
        };

        if record.status == SessionStatus::Closed {
            return Ok(AdmissionDecision::SessionClosed);
        }

        let lock_name = format!("admit:{session_id}");
        let acquired = self.acquire_admission_lock(&lock_name).await?;
        let outcome = self.rehydrate(session_id, record.status, &record.metadata).await;
        if acquired {
            if let Err(err) = self
                .sessions
                .store()
                .release_lock(&lock_name, &self.holder_id)
                .await
            {
                debug!(session_id, error = %err, "admission lock release failed");
            }
        }
        outcome.map(|_| AdmissionDecision::Forward { session_known: true })
    }

    /// Try to take the `admit:{id}` lock, waiting briefly if it is held.
    /// Returns whether we hold it; on timeout we proceed optimistically,
    /// relying on upstream idempotency.
    async fn acquire_admission_lock(&self, lock_name: &str) -> Result<bool> {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match self
                .sessions
                .store()
                .acquire_lock(lock_name, &self.holder_id, self.lock_ttl)
                .await
            {
                Ok(()) => return Ok(true),
                Err(StoreError::Held) => {
                    if Instant::now() >= deadline {
                        debug!(lock_name, "admission lock still held, proceeding optimistically");
                        return Ok(false);
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(GatewayError::Store(err)),
            }
        }
    }

    async fn rehydrate(
        &self,
        session_id: &str,
        status: SessionStatus,
        metadata: &HashMap<String, Value>,
    ) -> Result<()> {
        self.upstream
            .create_transport_for_session(session_id, metadata)
            .await
            .map_err(GatewayError::Upstream)?;
        debug!(session_id, %status, "transport rehydrated");

        if status == SessionStatus::Active {
            self.warm(session_id).await;
        }
        Ok(())
    }

    /// Synthesize the client's `notifications/initialized` into the fresh
    /// transport so the upstream treats the session as active without a
    /// re-initialization round trip. Fire-and-forget: on failure the warmed
    /// set is left unmarked and the next request tries again.
    async fn warm(&self, session_id: &str) {
        let mut warmed = self.warmed.lock().await;
        if warmed.contains(session_id) {
            return;
        }
        match self
            .upstream
            .inject_client_notification(session_id, initialized_notification())
            .await
        {
            Ok(()) => {
                debug!(session_id, "transport warmed");
                warmed.insert(session_id.to_string());
            }
            Err(err) => {
                warn!(session_id, error = %err, "transport warming failed");
            }
        }
    }
}

/// The synthetic warming frame.
pub fn initialized_notification() -> Value {
    json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
}
