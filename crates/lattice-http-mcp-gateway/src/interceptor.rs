//! Protocol interceptor: JSON-RPC observations to session state.
//!
//! Parses frames just enough to keep the durable session store in step with
//! the traffic: session creation on the initialize response, the
//! INITIALIZED -> ACTIVE transition on the client's initialized
//! notification, closure on DELETE and terminal signals, and an event-log
//! append for every recognizable frame on a known session.
//!
//! Observations for one session are serialized through a striped keyed lock;
//! the lock may span store calls but is always released before the gateway
//! forwards to the upstream handler.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use lattice_mcp_session_store::{
    Direction, EventKind, SessionError, SessionManager, SessionStatus, STREAM_REQUEST,
};

use crate::jsonrpc::{FrameKind, JsonRpcFrame};
use crate::Result;

const LOCK_STRIPES: usize = 64;

/// Terminal JSON-RPC error code: the upstream no longer knows the session.
const SESSION_GONE_CODE: i64 = -32000;

/// Striped per-key mutex; collisions only cost unnecessary serialization.
struct KeyedLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyedLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

/// A pending initialize exchange, noted on the request and resolved when
/// the response arrives with the server-assigned session id.
#[derive(Debug, Clone)]
pub struct PendingInit {
    pub params: Option<Value>,
    pub request_payload: Value,
    pub request_id: Option<Value>,
}

/// What the interceptor learned from a request body, threaded through to
/// the response observation.
#[derive(Debug, Default)]
pub struct RequestObservation {
    pub pending_init: Option<PendingInit>,
}

/// Observes JSON-RPC traffic at the transport boundary and drives the
/// session manager. Safe for concurrent use across sessions; serialized per
/// session id.
pub struct ProtocolInterceptor {
    sessions: Arc<SessionManager>,
    locks: KeyedLocks,
}

impl ProtocolInterceptor {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            locks: KeyedLocks::new(LOCK_STRIPES),
        }
    }

    /// Observe the frames of an inbound POST body. `session_known` is the
    /// admission controller's verdict; events are only recorded for known
    /// sessions.
    pub async fn observe_request(
        &self,
        session_id: Option<&str>,
        session_known: bool,
        frames: &[JsonRpcFrame],
    ) -> Result<RequestObservation> {
        let mut observation = RequestObservation::default();
        let _guard = match session_id {
            Some(id) => Some(self.locks.lock(id).await),
            None => None,
        };

        for frame in frames {
            if frame.is_initialize() {
                // Creation is deferred until the response names the session.
                observation.pending_init = Some(PendingInit {
                    params: frame.params.clone(),
                    request_payload: frame.raw.clone(),
                    request_id: frame.id.clone(),
                });
                continue;
            }

            let (Some(id), true) = (session_id, session_known) else {
                debug!(method = ?frame.method, "frame without known session, passing through");
                continue;
            };

            if frame.is_initialized_notification() {
                self.mark_active(id).await?;
                self.record_frame(id, STREAM_REQUEST, Direction::ClientToServer, frame)
                    .await;
                continue;
            }

            match frame.kind() {
                FrameKind::Unknown => {
                    debug!(session_id = %id, "unrecognized frame, passing through untouched");
                }
                _ => {
                    self.record_frame(id, STREAM_REQUEST, Direction::ClientToServer, frame)
                        .await;
                }
            }
        }
        Ok(observation)
    }

    /// Observe a complete `application/json` response. `response_session_id`
    /// is the `Mcp-Session-Id` the upstream attached to the response; on an
    /// initialize exchange it names the session to create.
    pub async fn observe_json_response(
        &self,
        request_session_id: Option<&str>,
        response_session_id: Option<&str>,
        session_known: bool,
        frames: &[JsonRpcFrame],
        observation: &RequestObservation,
    ) -> Result<()> {
        let effective_id = response_session_id.or(request_session_id);
        let Some(id) = effective_id else {
            return Ok(());
        };
        let _guard = self.locks.lock(id).await;

        let mut known = session_known;
        if let Some(pending) = &observation.pending_init {
            if let Some(new_id) = response_session_id {
                known = self.create_from_initialize(new_id, pending, frames).await || known;
            }
        }

        if !known {
            return Ok(());
        }
        for frame in frames {
            match frame.kind() {
                FrameKind::Response | FrameKind::Error => {
                    self.record_frame(id, STREAM_REQUEST, Direction::ServerToClient, frame)
                        .await;
                    if frame.error_code() == Some(SESSION_GONE_CODE) {
                        self.close_on_terminal_signal(id).await;
                    }
                }
                FrameKind::Request | FrameKind::Notification => {
                    // Server-to-client requests/notifications inside a JSON
                    // response body (batch shapes).
                    self.record_frame(id, STREAM_REQUEST, Direction::ServerToClient, frame)
                        .await;
                }
                FrameKind::Unknown => {
                    debug!(session_id = %id, "unrecognized response frame");
                }
            }
        }
        Ok(())
    }

    /// Observe one SSE event teed off a streaming response.
    pub async fn observe_sse_data(&self, session_id: &str, stream_key: &str, data: &str) {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            debug!(session_id, stream_key, "non-JSON SSE data line, ignoring");
            return;
        };
        let frames = crate::jsonrpc::frames_from_value(&value);
        let _guard = self.locks.lock(session_id).await;
        for frame in &frames {
            match frame.kind() {
                FrameKind::Unknown => {
                    debug!(session_id, "unrecognized SSE frame");
                }
                _ => {
                    self.record_frame(session_id, stream_key, Direction::ServerToClient, frame)
                        .await;
                    if frame.error_code() == Some(SESSION_GONE_CODE) {
                        self.close_on_terminal_signal(session_id).await;
                    }
                }
            }
        }
    }

    /// Explicit DELETE on the MCP endpoint: record a synthetic close event
    /// and transition the session to CLOSED.
    pub async fn observe_delete(&self, session_id: &str) -> Result<()> {
        let _guard = self.locks.lock(session_id).await;

        // The close event must land before the status flips; closed
        // sessions reject appends.
        if let Err(err) = self
            .sessions
            .events()
            .record(
                session_id,
                STREAM_REQUEST,
                Direction::ClientToServer,
                EventKind::Close,
                None,
                None,
                json!({"closed": true}),
            )
            .await
        {
            warn!(session_id, error = %err, "failed to record close event");
        }

        match self.sessions.close(session_id).await {
            Ok(_) => Ok(()),
            Err(SessionError::NotFound) => Err(SessionError::NotFound.into()),
            Err(err) => {
                error!(session_id, error = %err, "failed to close session on DELETE");
                Err(err.into())
            }
        }
    }

    /// The upstream answered 404 for a session the cluster still considers
    /// live: close it.
    pub async fn observe_session_gone(&self, session_id: &str) {
        let _guard = self.locks.lock(session_id).await;
        self.close_on_terminal_signal(session_id).await;
    }

    async fn mark_active(&self, session_id: &str) -> Result<()> {
        match self
            .sessions
            .transition(
                session_id,
                SessionStatus::Initialized,
                SessionStatus::Active,
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            // Already active is a no-op inside transition; anything illegal
            // here is a race worth surfacing.
            Err(err @ SessionError::IllegalTransition { .. }) => {
                error!(session_id, error = %err, "initialized notification on wrong status");
                Err(err.into())
            }
            Err(SessionError::NotFound) => {
                warn!(session_id, "initialized notification for unknown session");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create the durable record once the initialize response named the
    /// session. Returns whether the session exists after the call.
    async fn create_from_initialize(
        &self,
        session_id: &str,
        pending: &PendingInit,
        response_frames: &[JsonRpcFrame],
    ) -> bool {
        let metadata = init_metadata(pending.params.as_ref(), response_frames);
        match self.sessions.create(session_id, metadata).await {
            Ok(_) => {
                debug!(session_id, "session created from initialize response");
            }
            Err(SessionError::Exists) => {
                // Another instance won the race; both converge on its record.
                debug!(session_id, "session already created elsewhere");
            }
            Err(err) => {
                error!(session_id, error = %err, "failed to persist new session");
                return false;
            }
        }

        // The initialize exchange itself becomes the first two events.
        if let Err(err) = self
            .sessions
            .events()
            .record(
                session_id,
                STREAM_REQUEST,
                Direction::ClientToServer,
                EventKind::Request,
                Some("initialize".to_string()),
                pending.request_id.clone(),
                pending.request_payload.clone(),
            )
            .await
        {
            warn!(session_id, error = %err, "failed to record initialize request event");
        }
        true
    }

    async fn record_frame(
        &self,
        session_id: &str,
        stream_key: &str,
        direction: Direction,
        frame: &JsonRpcFrame,
    ) {
        let kind = match frame.kind() {
            FrameKind::Request => EventKind::Request,
            FrameKind::Notification => EventKind::Notification,
            FrameKind::Response => EventKind::Response,
            FrameKind::Error => EventKind::Error,
            FrameKind::Unknown => return,
        };
        if let Err(err) = self
            .sessions
            .events()
            .record(
                session_id,
                stream_key,
                direction,
                kind,
                frame.method.clone(),
                frame.id.clone(),
                frame.raw.clone(),
            )
            .await
        {
            warn!(session_id, stream_key, error = %err, "failed to record event");
        }
    }

    async fn close_on_terminal_signal(&self, session_id: &str) {
        match self.sessions.close(session_id).await {
            Ok(_) => debug!(session_id, "session closed on terminal signal"),
            Err(SessionError::NotFound) => {}
            Err(err) => {
                warn!(session_id, error = %err, "failed to close session on terminal signal");
            }
        }
    }
}

/// Reconstruction hints persisted with a new session: the client-supplied
/// initialize params (capabilities, client info) and the protocol version
/// the server actually negotiated.
fn init_metadata(
    params: Option<&Value>,
    response_frames: &[JsonRpcFrame],
) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    if let Some(params) = params {
        if let Some(capabilities) = params.get("capabilities") {
            metadata.insert("capabilities".to_string(), capabilities.clone());
        }
        if let Some(client_info) = params.get("clientInfo") {
            metadata.insert("clientInfo".to_string(), client_info.clone());
        }
        if let Some(version) = params.get("protocolVersion") {
            metadata.insert("requestedProtocolVersion".to_string(), version.clone());
        }
    }
    if let Some(negotiated) = response_frames.iter().find_map(|frame| {
        frame
            .raw
            .get("result")
            .and_then(|result| result.get("protocolVersion"))
            .cloned()
    }) {
        metadata.insert("protocolVersion".to_string(), negotiated);
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::parse_frames;
    use lattice_mcp_session_store::{CacheConfig, InMemorySessionStore, SharedSessionStore};

    fn interceptor() -> (ProtocolInterceptor, Arc<SessionManager>) {
        let store: SharedSessionStore = Arc::new(InMemorySessionStore::new());
        let sessions = Arc::new(SessionManager::new(store, &CacheConfig::default()));
        (ProtocolInterceptor::new(Arc::clone(&sessions)), sessions)
    }

    fn init_request_frames() -> Vec<JsonRpcFrame> {
        parse_frames(
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize",
                 "params":{"protocolVersion":"2025-03-26","capabilities":{},
                           "clientInfo":{"name":"inspector"}}}"#,
        )
        .unwrap()
    }

    fn init_response_frames() -> Vec<JsonRpcFrame> {
        parse_frames(br#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26"}}"#)
            .unwrap()
    }

    #[tokio::test]
    async fn initialize_exchange_creates_session_with_server_id() {
        let (interceptor, sessions) = interceptor();

        let observation = interceptor
            .observe_request(None, false, &init_request_frames())
            .await
            .unwrap();
        assert!(observation.pending_init.is_some());

        interceptor
            .observe_json_response(None, Some("s-abc"), false, &init_response_frames(), &observation)
            .await
            .unwrap();

        let record = sessions.get_uncached("s-abc").await.unwrap();
        // The id is the server's, byte for byte; nothing invented here.
        assert_eq!(record.id, "s-abc");
        assert_eq!(record.status, SessionStatus::Initialized);
        assert_eq!(record.metadata["protocolVersion"], "2025-03-26");
        assert_eq!(record.metadata["clientInfo"]["name"], "inspector");

        // Initialize request + response recorded on the request stream.
        let events = sessions
            .events()
            .replay("s-abc", STREAM_REQUEST, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].body.kind, EventKind::Request);
        assert_eq!(events[0].body.jsonrpc_method.as_deref(), Some("initialize"));
        assert_eq!(events[1].body.kind, EventKind::Response);
    }

    #[tokio::test]
    async fn initialize_request_alone_writes_no_state() {
        let (interceptor, sessions) = interceptor();
        interceptor
            .observe_request(None, false, &init_request_frames())
            .await
            .unwrap();
        assert!(sessions.get_uncached("s-abc").await.is_err());
    }

    #[tokio::test]
    async fn initialized_notification_activates_session() {
        let (interceptor, sessions) = interceptor();
        sessions.create("s-abc", HashMap::new()).await.unwrap();

        let frames =
            parse_frames(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        interceptor
            .observe_request(Some("s-abc"), true, &frames)
            .await
            .unwrap();

        let record = sessions.get_uncached("s-abc").await.unwrap();
        assert_eq!(record.status, SessionStatus::Active);

        // A duplicate notification is a no-op, not an error.
        interceptor
            .observe_request(Some("s-abc"), true, &frames)
            .await
            .unwrap();
        assert_eq!(
            sessions.get_uncached("s-abc").await.unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn ordinary_frames_are_recorded_in_wire_order() {
        let (interceptor, sessions) = interceptor();
        sessions.create("s-abc", HashMap::new()).await.unwrap();

        let request =
            parse_frames(br#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).unwrap();
        interceptor
            .observe_request(Some("s-abc"), true, &request)
            .await
            .unwrap();

        let response =
            parse_frames(br#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#).unwrap();
        interceptor
            .observe_json_response(
                Some("s-abc"),
                None,
                true,
                &response,
                &RequestObservation::default(),
            )
            .await
            .unwrap();

        let events = sessions
            .events()
            .replay("s-abc", STREAM_REQUEST, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].body.direction, Direction::ClientToServer);
        assert_eq!(events[1].body.direction, Direction::ServerToClient);
        assert!(events[0].event_id < events[1].event_id);
    }

    #[tokio::test]
    async fn delete_records_close_event_then_closes() {
        let (interceptor, sessions) = interceptor();
        sessions.create("s-abc", HashMap::new()).await.unwrap();

        interceptor.observe_delete("s-abc").await.unwrap();

        let record = sessions.get_uncached("s-abc").await.unwrap();
        assert_eq!(record.status, SessionStatus::Closed);

        let events = sessions
            .events()
            .replay("s-abc", STREAM_REQUEST, None)
            .await
            .unwrap();
        assert_eq!(events.last().unwrap().body.kind, EventKind::Close);
    }

    #[tokio::test]
    async fn session_gone_error_code_closes_session() {
        let (interceptor, sessions) = interceptor();
        sessions.create("s-abc", HashMap::new()).await.unwrap();

        let frames = parse_frames(
            br#"{"jsonrpc":"2.0","id":3,"error":{"code":-32000,"message":"Session not found"}}"#,
        )
        .unwrap();
        interceptor
            .observe_json_response(
                Some("s-abc"),
                None,
                true,
                &frames,
                &RequestObservation::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            sessions.get_uncached("s-abc").await.unwrap().status,
            SessionStatus::Closed
        );
    }

    #[tokio::test]
    async fn sse_data_records_on_requested_stream() {
        let (interceptor, sessions) = interceptor();
        sessions.create("s-abc", HashMap::new()).await.unwrap();

        interceptor
            .observe_sse_data(
                "s-abc",
                "standalone",
                r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progress":1}}"#,
            )
            .await;
        interceptor
            .observe_sse_data("s-abc", "standalone", "not json")
            .await;

        let events = sessions
            .events()
            .replay("s-abc", "standalone", None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body.kind, EventKind::Notification);
        assert_eq!(events[0].body.direction, Direction::ServerToClient);
    }

    #[tokio::test]
    async fn concurrent_sessions_do_not_interfere() {
        let (interceptor, sessions) = interceptor();
        let interceptor = Arc::new(interceptor);
        sessions.create("s-a", HashMap::new()).await.unwrap();
        sessions.create("s-b", HashMap::new()).await.unwrap();

        let mut handles = Vec::new();
        for id in ["s-a", "s-b"] {
            for seq in 0..10 {
                let interceptor = Arc::clone(&interceptor);
                handles.push(tokio::spawn(async move {
                    let body = format!(
                        r#"{{"jsonrpc":"2.0","id":{seq},"method":"tools/list"}}"#
                    );
                    let frames = parse_frames(body.as_bytes()).unwrap();
                    interceptor
                        .observe_request(Some(id), true, &frames)
                        .await
                        .unwrap();
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in ["s-a", "s-b"] {
            let events = sessions.events().replay(id, STREAM_REQUEST, None).await.unwrap();
            assert_eq!(events.len(), 10);
            let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            assert_eq!(ids, sorted);
        }
    }
}
