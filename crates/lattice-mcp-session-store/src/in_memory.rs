//! In-memory storage adapter.
//!
//! Backed by `Arc<RwLock<HashMap>>` maps, suitable for development, tests,
//! and single-instance deployments where durability is not required. All
//! invariants of the adapter contract (id uniqueness, CAS versioning,
//! per-stream id ordering, closed-session append rejection, lock TTL) are
//! enforced here exactly as by the durable backend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::record::{EventBody, EventRecord, SessionRecord, SessionStatus};
use crate::traits::{unix_millis_now, SessionStore, StoreError, StoreResult};

/// Configuration for the in-memory adapter.
#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
    /// Automatic head-trim bound applied on every append.
    pub max_events_per_stream: usize,
    /// Optional session TTL; expired sessions are removed by
    /// [`InMemorySessionStore::reap_expired`].
    pub session_ttl: Option<Duration>,
}

impl Default for InMemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_events_per_stream: 10_000,
            session_ttl: None,
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    next_id: u64,
    events: VecDeque<EventRecord>,
}

#[derive(Debug)]
struct LockEntry {
    holder: String,
    expires_at: Instant,
}

/// Concurrency-safe in-process storage adapter.
#[derive(Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    streams: Arc<RwLock<HashMap<(String, String), StreamState>>>,
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
    config: InMemoryStoreConfig,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_config(InMemoryStoreConfig::default())
    }

    pub fn with_config(config: InMemoryStoreConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            streams: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Remove sessions whose last update is older than the configured TTL.
    /// Returns the removed ids. TTL-based closure is retention only: no
    /// synthetic Close event is appended.
    pub async fn reap_expired(&self) -> Vec<String> {
        let Some(ttl) = self.config.session_ttl else {
            return Vec::new();
        };
        let cutoff = unix_millis_now().saturating_sub(ttl.as_millis() as u64);

        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, record)| record.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        drop(sessions);

        if !expired.is_empty() {
            let mut streams = self.streams.write().await;
            streams.retain(|(session_id, _), _| !expired.contains(session_id));
            debug!(count = expired.len(), "reaped expired sessions");
        }
        expired
    }

    /// Snapshot of current occupancy, for diagnostics.
    pub async fn stats(&self) -> InMemoryStoreStats {
        let sessions = self.sessions.read().await;
        let streams = self.streams.read().await;
        InMemoryStoreStats {
            session_count: sessions.len(),
            stream_count: streams.len(),
            total_event_count: streams.values().map(|s| s.events.len()).sum(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Occupancy snapshot of the in-memory adapter.
#[derive(Debug, Clone)]
pub struct InMemoryStoreStats {
    pub session_count: usize,
    pub stream_count: usize,
    pub total_event_count: usize,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned().ok_or(StoreError::NotFound)
    }

    async fn put_session_if_absent(&self, record: SessionRecord) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&record.id) {
            return Err(StoreError::Exists);
        }
        debug!(session_id = %record.id, "created session record");
        sessions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        mut record: SessionRecord,
    ) -> StoreResult<u64> {
        let mut sessions = self.sessions.write().await;
        let current = sessions.get(id).ok_or(StoreError::NotFound)?;
        if current.version != expected_version {
            return Err(StoreError::Conflict);
        }
        let new_version = expected_version + 1;
        record.version = new_version;
        record.updated_at = self.now_millis();
        sessions.insert(id.to_string(), record);
        Ok(new_version)
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_none() {
            return Err(StoreError::NotFound);
        }
        drop(sessions);
        let mut streams = self.streams.write().await;
        streams.retain(|(session_id, _), _| session_id != id);
        Ok(())
    }

    async fn append_event(
        &self,
        session_id: &str,
        stream_key: &str,
        event: EventBody,
    ) -> StoreResult<u64> {
        {
            let sessions = self.sessions.read().await;
            if let Some(record) = sessions.get(session_id) {
                if record.status == SessionStatus::Closed {
                    return Err(StoreError::Conflict);
                }
            }
        }

        let mut streams = self.streams.write().await;
        let state = streams
            .entry((session_id.to_string(), stream_key.to_string()))
            .or_default();
        state.next_id += 1;
        let event_id = state.next_id;
        state.events.push_back(EventRecord {
            event_id,
            session_id: session_id.to_string(),
            stream_key: stream_key.to_string(),
            body: event,
        });
        while state.events.len() > self.config.max_events_per_stream {
            state.events.pop_front();
        }
        Ok(event_id)
    }

    async fn read_events(
        &self,
        session_id: &str,
        stream_key: &str,
        after_id: Option<u64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        let streams = self.streams.read().await;
        let Some(state) = streams.get(&(session_id.to_string(), stream_key.to_string())) else {
            return Ok(Vec::new());
        };
        let after = after_id.unwrap_or(0);
        let iter = state.events.iter().filter(|e| e.event_id > after).cloned();
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    async fn latest_event_id(
        &self,
        session_id: &str,
        stream_key: &str,
    ) -> StoreResult<Option<u64>> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(&(session_id.to_string(), stream_key.to_string()))
            .and_then(|state| state.events.back().map(|e| e.event_id)))
    }

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: &str,
        max_len: usize,
    ) -> StoreResult<()> {
        let mut streams = self.streams.write().await;
        if let Some(state) = streams.get_mut(&(session_id.to_string(), stream_key.to_string())) {
            while state.events.len() > max_len {
                state.events.pop_front();
            }
        }
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, holder_id: &str, ttl: Duration) -> StoreResult<()> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        match locks.get(name) {
            Some(entry) if entry.expires_at > now && entry.holder != holder_id => {
                Err(StoreError::Held)
            }
            _ => {
                locks.insert(
                    name.to_string(),
                    LockEntry {
                        holder: holder_id.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(())
            }
        }
    }

    async fn release_lock(&self, name: &str, holder_id: &str) -> StoreResult<()> {
        let mut locks = self.locks.lock().await;
        match locks.get(name) {
            Some(entry) if entry.holder == holder_id => {
                locks.remove(name);
                Ok(())
            }
            Some(_) => Err(StoreError::Held),
            None => Err(StoreError::NotFound),
        }
    }

    fn now_millis(&self) -> u64 {
        unix_millis_now()
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
