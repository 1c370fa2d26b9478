//! Session and event data model.
//!
//! A `SessionRecord` is the authoritative per-session object shared across
//! the cluster; `EventRecord`s form the append-only per-session message log
//! used for auditing and SSE replay.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream key for events tied to a POST request/response exchange.
pub const STREAM_REQUEST: &str = "request";
/// Stream key for events on the standalone GET SSE stream.
pub const STREAM_STANDALONE: &str = "standalone";

/// Lifecycle status of a session.
///
/// Transitions follow a DAG with no back-edges:
/// `Initializing -> Initialized -> Active -> Closed`, where `Closed` is also
/// reachable directly from `Initialized`. `Initializing` only exists
/// in-memory on the instance handling the initialize exchange; it is never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initializing,
    Initialized,
    Active,
    Closed,
}

impl SessionStatus {
    /// Whether moving from `self` to `to` is a legal edge of the lifecycle DAG.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Initializing, Initialized)
                | (Initialized, Active)
                | (Initialized, Closed)
                | (Active, Closed)
        )
    }

    /// Whether the session still accepts observations and event appends.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionStatus::Closed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Initializing => "INITIALIZING",
            SessionStatus::Initialized => "INITIALIZED",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Authoritative per-session record.
///
/// The `id` is assigned by the upstream MCP transport during the initialize
/// exchange and treated as an opaque, case-sensitive byte string. This layer
/// never generates session identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque server-assigned session identifier.
    pub id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp (Unix millis).
    pub created_at: u64,
    /// Last update timestamp (Unix millis).
    pub updated_at: u64,
    /// Opaque reconstruction hints for the upstream transport (negotiated
    /// protocol version, client info, optional auth context). Not
    /// interpreted here beyond passing it to rehydration.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Optimistic-concurrency version; strictly increases on every update.
    pub version: u64,
    /// Instance that most recently owned live streaming state. Advisory
    /// only; admission is always local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_hint: Option<String>,
}

impl SessionRecord {
    /// Build a fresh record in `Initialized` status at version 1.
    pub fn new(id: impl Into<String>, metadata: HashMap<String, Value>, now_millis: u64) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Initialized,
            created_at: now_millis,
            updated_at: now_millis,
            metadata,
            version: 1,
            owner_hint: None,
        }
    }
}

/// Direction of an observed protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Shape of an observed protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Request,
    Response,
    Notification,
    Error,
    /// Synthetic terminal event recorded when a session is explicitly
    /// deleted. Never produced by wire traffic.
    Close,
}

/// Payload of an event before the storage adapter assigns its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBody {
    pub direction: Direction,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc_method: Option<String>,
    /// JSON-RPC id of the frame, numeric or string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc_id: Option<Value>,
    /// The raw outermost JSON-RPC object.
    pub payload: Value,
    /// Observation timestamp (Unix millis).
    pub observed_at: u64,
}

/// A persisted event, identified within one `(session_id, stream_key)` pair.
///
/// `event_id` is assigned by the storage adapter and strictly increases in
/// append order within a stream; it is not globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: u64,
    pub session_id: String,
    pub stream_key: String,
    #[serde(flatten)]
    pub body: EventBody,
}
