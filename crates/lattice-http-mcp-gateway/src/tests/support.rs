//! Shared doubles and builders for gateway tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use lattice_mcp_session_store::{
    CacheConfig, EventRecord, InMemorySessionStore, SessionManager, SharedSessionStore,
};

use crate::gateway::{empty_gateway_body, full_gateway_body, GatewayBody, SessionGateway};
use crate::upstream::{UpstreamError, UpstreamSessionManager};
use crate::GatewayConfig;

/// A scripted MCP server standing in for the SDK's session manager and
/// request handler.
#[derive(Default)]
pub struct MockMcpServer {
    pub transports: Mutex<HashSet<String>>,
    pub create_calls: AtomicUsize,
    pub injections: Mutex<Vec<(String, Value)>>,
    pub handled_requests: AtomicUsize,
    /// Session id the server assigns to the next initialize exchange.
    pub init_session_id: Mutex<Option<String>>,
    /// Scripted SSE stream: (event id, data) pairs.
    pub sse_events: Mutex<Vec<(String, String)>>,
    /// Answer POSTs (other than initialize/notifications) with the SSE
    /// stream instead of a JSON body.
    pub post_sse: AtomicBool,
    /// Answer every POST with 404 session-gone.
    pub respond_not_found: AtomicBool,
    /// Last `Last-Event-ID` header observed on a GET.
    pub last_event_id_seen: Mutex<Option<String>>,
}

impl MockMcpServer {
    pub fn assigning(session_id: &str) -> Self {
        let server = Self::default();
        *server.init_session_id.try_lock().unwrap() = Some(session_id.to_string());
        server
    }

    pub async fn script_sse(&self, events: &[(&str, &str)]) {
        *self.sse_events.lock().await = events
            .iter()
            .map(|(id, data)| (id.to_string(), data.to_string()))
            .collect();
    }
}

fn json_response(
    status: StatusCode,
    body: Value,
    session_id: Option<&str>,
) -> Response<GatewayBody> {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json");
    if let Some(id) = session_id {
        builder = builder.header("Mcp-Session-Id", id);
    }
    builder
        .body(full_gateway_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn sse_response(events: &[(String, String)]) -> Response<GatewayBody> {
    let mut wire = String::new();
    for (id, data) in events {
        wire.push_str(&format!("id: {id}\ndata: {data}\n\n"));
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(full_gateway_body(Bytes::from(wire)))
        .unwrap()
}

#[async_trait]
impl UpstreamSessionManager for MockMcpServer {
    async fn has_session(&self, session_id: &str) -> bool {
        self.transports.lock().await.contains(session_id)
    }

    async fn create_transport_for_session(
        &self,
        session_id: &str,
        _metadata: &HashMap<String, Value>,
    ) -> Result<(), UpstreamError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.transports.lock().await.insert(session_id.to_string());
        Ok(())
    }

    async fn inject_client_notification(
        &self,
        session_id: &str,
        frame: Value,
    ) -> Result<(), UpstreamError> {
        self.injections
            .lock()
            .await
            .push((session_id.to_string(), frame));
        Ok(())
    }

    async fn handle_request(
        &self,
        request: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, UpstreamError> {
        self.handled_requests.fetch_add(1, Ordering::SeqCst);
        match *request.method() {
            Method::POST => {
                let bytes = request
                    .into_body()
                    .collect()
                    .await
                    .map_err(|err| UpstreamError::new(err.to_string()))?
                    .to_bytes();
                let value: Value = serde_json::from_slice(&bytes).unwrap_or(json!({}));
                let method = value.get("method").and_then(Value::as_str).unwrap_or("");

                if self.respond_not_found.load(Ordering::SeqCst) {
                    return Ok(json_response(
                        StatusCode::NOT_FOUND,
                        json!({
                            "jsonrpc": "2.0",
                            "error": {"code": -32000, "message": "Session not found"},
                            "id": null,
                        }),
                        None,
                    ));
                }

                if method == "initialize" {
                    let session_id = self
                        .init_session_id
                        .lock()
                        .await
                        .clone()
                        .expect("test did not script an init session id");
                    self.transports.lock().await.insert(session_id.clone());
                    return Ok(json_response(
                        StatusCode::OK,
                        json!({
                            "jsonrpc": "2.0",
                            "id": value.get("id").cloned().unwrap_or(Value::Null),
                            "result": {"protocolVersion": "2025-03-26"},
                        }),
                        Some(&session_id),
                    ));
                }

                if value.get("id").map(Value::is_null).unwrap_or(true) {
                    // Notification: accepted, no body.
                    return Ok(Response::builder()
                        .status(StatusCode::ACCEPTED)
                        .body(empty_gateway_body())
                        .unwrap());
                }

                if self.post_sse.load(Ordering::SeqCst) {
                    let events = self.sse_events.lock().await.clone();
                    return Ok(sse_response(&events));
                }

                Ok(json_response(
                    StatusCode::OK,
                    json!({
                        "jsonrpc": "2.0",
                        "id": value.get("id").cloned().unwrap_or(Value::Null),
                        "result": {"tools": []},
                    }),
                    None,
                ))
            }
            Method::GET => {
                let cursor = request
                    .headers()
                    .get("Last-Event-ID")
                    .and_then(|value| value.to_str().ok())
                    .map(String::from);
                *self.last_event_id_seen.lock().await = cursor.clone();

                let events = self.sse_events.lock().await.clone();
                let start = cursor
                    .and_then(|cursor| events.iter().position(|(id, _)| *id == cursor))
                    .map(|position| position + 1)
                    .unwrap_or(0);
                Ok(sse_response(&events[start..]))
            }
            Method::DELETE => {
                if let Some(id) = request
                    .headers()
                    .get("Mcp-Session-Id")
                    .and_then(|value| value.to_str().ok())
                {
                    self.transports.lock().await.remove(id);
                }
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(full_gateway_body(Bytes::from_static(b"Session terminated")))
                    .unwrap())
            }
            _ => Ok(Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(empty_gateway_body())
                .unwrap()),
        }
    }
}

/// One gateway instance ("node") sharing a cluster store.
pub struct TestNode {
    pub gateway: SessionGateway,
    pub upstream: Arc<MockMcpServer>,
    pub sessions: Arc<SessionManager>,
}

pub fn node_with_store(store: SharedSessionStore, upstream: Arc<MockMcpServer>) -> TestNode {
    let sessions = Arc::new(SessionManager::new(store, &CacheConfig::default()));
    let gateway = SessionGateway::new(
        GatewayConfig::default(),
        Arc::clone(&sessions),
        Arc::clone(&upstream) as Arc<dyn UpstreamSessionManager>,
    );
    TestNode {
        gateway,
        upstream,
        sessions,
    }
}

pub fn node(upstream: Arc<MockMcpServer>) -> TestNode {
    node_with_store(Arc::new(InMemorySessionStore::new()), upstream)
}

pub fn post_request(session_id: Option<&str>, body: &str) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(CONTENT_TYPE, "application/json")
        .header("Accept", "application/json, text/event-stream");
    if let Some(id) = session_id {
        builder = builder.header("Mcp-Session-Id", id);
    }
    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

pub fn get_request(session_id: &str, last_event_id: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri("/mcp")
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", session_id);
    if let Some(cursor) = last_event_id {
        builder = builder.header("Last-Event-ID", cursor);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub fn delete_request(session_id: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(Method::DELETE).uri("/mcp");
    if let Some(id) = session_id {
        builder = builder.header("Mcp-Session-Id", id);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

pub async fn body_bytes(response: Response<GatewayBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<GatewayBody>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Wait for the asynchronous SSE recorder to land `expected` events.
pub async fn wait_for_events(
    sessions: &SessionManager,
    session_id: &str,
    stream_key: &str,
    expected: usize,
) -> Vec<EventRecord> {
    for _ in 0..100 {
        let events = sessions
            .events()
            .replay(session_id, stream_key, None)
            .await
            .unwrap();
        if events.len() >= expected {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {expected} events on {session_id}/{stream_key}");
}
