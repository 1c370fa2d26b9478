//! Event-sourcing facade over the storage adapter.
//!
//! Records observed protocol messages into per-session streams and replays
//! them in id order. Ids are whatever the adapter assigned; the log never
//! renumbers. Ordering holds within one `(session, stream_key)` pair only;
//! cross-stream ordering is unspecified, matching the per-stream resumption
//! cursors exposed at the wire.

use serde_json::Value;

use crate::record::{Direction, EventBody, EventKind, EventRecord};
use crate::traits::{SharedSessionStore, StoreResult};

/// Append/replay handle shared by the interceptor and the gateway.
#[derive(Clone)]
pub struct EventLog {
    store: SharedSessionStore,
}

impl EventLog {
    pub fn new(store: SharedSessionStore) -> Self {
        Self { store }
    }

    /// Persist one observed message and return the assigned event id.
    pub async fn record(
        &self,
        session_id: &str,
        stream_key: &str,
        direction: Direction,
        kind: EventKind,
        jsonrpc_method: Option<String>,
        jsonrpc_id: Option<Value>,
        payload: Value,
    ) -> StoreResult<u64> {
        let event = EventBody {
            direction,
            kind,
            jsonrpc_method,
            jsonrpc_id,
            payload,
            observed_at: self.store.now_millis(),
        };
        self.store.append_event(session_id, stream_key, event).await
    }

    /// Events strictly after `after_event_id` (or from the retained head),
    /// ordered by event id. Finite and non-restartable; bounded by the
    /// stream's retention.
    pub async fn replay(
        &self,
        session_id: &str,
        stream_key: &str,
        after_event_id: Option<u64>,
    ) -> StoreResult<Vec<EventRecord>> {
        self.store
            .read_events(session_id, stream_key, after_event_id, None)
            .await
    }

    /// Highest id ever assigned on the stream, if any.
    pub async fn latest_id(
        &self,
        session_id: &str,
        stream_key: &str,
    ) -> StoreResult<Option<u64>> {
        self.store.latest_event_id(session_id, stream_key).await
    }
}
