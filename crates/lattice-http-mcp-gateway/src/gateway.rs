//! The transport wrapper: an HTTP middleware around the upstream handler.
//!
//! For POST, the body is buffered (bounded) so the session id can be
//! discovered and the same bytes replayed to the upstream; for GET and
//! DELETE nothing is buffered. Responses are tapped: complete JSON bodies
//! are parsed once and handed to the interceptor; SSE bodies are teed
//! event-by-event in the same pass that serves them downstream, so delivery
//! timing and bytes are untouched.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use serde_json::json;
use tracing::{debug, error, warn};

use lattice_mcp_session_store::{
    Direction, EventKind, SessionManager, STREAM_REQUEST, STREAM_STANDALONE,
};

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::config::GatewayConfig;
use crate::interceptor::{ProtocolInterceptor, RequestObservation};
use crate::json_rpc_responses::*;
use crate::jsonrpc::{parse_frames, JsonRpcFrame};
use crate::protocol::{discover_session_id, extract_session_id};
use crate::sse::TeeBody;
use crate::upstream::UpstreamSessionManager;
use crate::{GatewayError, Result};

/// Body type flowing between the gateway and the upstream handler.
pub type GatewayBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub(crate) fn full_gateway_body(bytes: Bytes) -> GatewayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

pub(crate) fn empty_gateway_body() -> GatewayBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// The middleware value. Owns the interceptor and admission controller,
/// wraps one upstream handler, and is constructed once at bootstrap.
pub struct SessionGateway {
    config: GatewayConfig,
    sessions: Arc<SessionManager>,
    interceptor: Arc<ProtocolInterceptor>,
    admission: Arc<AdmissionController>,
    upstream: Arc<dyn UpstreamSessionManager>,
}

impl SessionGateway {
    pub fn new(
        config: GatewayConfig,
        sessions: Arc<SessionManager>,
        upstream: Arc<dyn UpstreamSessionManager>,
    ) -> Self {
        let interceptor = Arc::new(ProtocolInterceptor::new(Arc::clone(&sessions)));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&sessions),
            Arc::clone(&upstream),
            &config,
        ));
        Self {
            config,
            sessions,
            interceptor,
            admission,
            upstream,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Tear down: flush caches and close store connections.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    /// Entry point. Never fails: gateway-level errors become HTTP
    /// responses (400/404/413/500/503).
    pub async fn handle<B>(&self, request: Request<B>) -> Response<GatewayBody>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => self.error_response(err),
        }
    }

    async fn dispatch<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        if request.uri().path() != self.config.mcp_path {
            return self.forward_untouched(request).await;
        }
        match *request.method() {
            Method::POST => self.handle_post(request).await,
            Method::GET => self.handle_get(request).await,
            Method::DELETE => self.handle_delete(request).await,
            Method::OPTIONS => Ok(preflight_response()),
            _ => Ok(method_not_allowed_response()),
        }
    }

    /// POST: JSON-RPC over HTTP, the main request path.
    async fn handle_post<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = request.into_parts();

        let content_type = header_str(&parts.headers, CONTENT_TYPE.as_str());
        if !content_type.starts_with("application/json") {
            warn!(content_type, "POST with wrong content type");
            return Ok(bad_request_response("Content-Type must be application/json"));
        }
        let accept = header_str(&parts.headers, ACCEPT.as_str());
        if !accept_allows_streamable_http(accept) {
            warn!(accept, "POST without compliant Accept header");
            return Ok(bad_request_response(
                "Accept must include application/json and text/event-stream",
            ));
        }

        // Buffer the body so it can be parsed here and replayed upstream.
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return Ok(bad_request_response("Failed to read request body"));
            }
        };
        if body_bytes.len() > self.config.max_body_bytes {
            warn!(bytes = body_bytes.len(), "request body too large");
            return Ok(payload_too_large_response());
        }

        let frames = match parse_frames(&body_bytes) {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) => return Ok(bad_request_response("Empty JSON-RPC payload")),
            Err(err) => {
                warn!(error = %err, "malformed JSON-RPC body");
                return Ok(bad_request_response("Malformed JSON-RPC body"));
            }
        };

        let session_id = discover_session_id(&parts.headers, &frames);
        let is_initialize = frames.iter().any(JsonRpcFrame::is_initialize);

        let session_known = match &session_id {
            Some(id) => match self.admission.admit(id, is_initialize).await? {
                AdmissionDecision::Forward { session_known } => session_known,
                AdmissionDecision::UnknownSession => {
                    return Ok(session_not_found_response(
                        self.config.unknown_session_status.status_code(),
                    ));
                }
                AdmissionDecision::SessionClosed => {
                    return Ok(session_not_found_response(StatusCode::NOT_FOUND));
                }
            },
            None => false,
        };

        // Per-session observations happen under the keyed lock, which is
        // released before the upstream forwarding below.
        let observation = self
            .interceptor
            .observe_request(session_id.as_deref(), session_known, &frames)
            .await?;

        let upstream_request = Request::from_parts(parts, full_gateway_body(body_bytes));
        let response = match self.upstream.handle_request(upstream_request).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "upstream handler failed");
                if let (Some(id), true) = (session_id.as_deref(), session_known) {
                    self.record_upstream_failure(id, &err.to_string()).await;
                }
                return Err(GatewayError::Upstream(err));
            }
        };

        self.tap_response(response, session_id, session_known, observation, STREAM_REQUEST)
            .await
    }

    /// GET: open the standalone SSE stream.
    async fn handle_get<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, _body) = request.into_parts();

        let accept = header_str(&parts.headers, ACCEPT.as_str());
        if !accept.contains("text/event-stream") && !accept.contains("*/*") {
            return Ok(bad_request_response(
                "Accept must include text/event-stream",
            ));
        }
        let Some(session_id) = extract_session_id(&parts.headers) else {
            return Ok(bad_request_response("Missing Mcp-Session-Id header"));
        };

        match self.admission.admit(&session_id, false).await? {
            AdmissionDecision::Forward { .. } => {}
            AdmissionDecision::UnknownSession => {
                return Ok(session_not_found_response(
                    self.config.unknown_session_status.status_code(),
                ));
            }
            AdmissionDecision::SessionClosed => {
                return Ok(session_not_found_response(StatusCode::NOT_FOUND));
            }
        }

        // Last-Event-ID rides along in the headers untouched; replay is the
        // upstream's job.
        let upstream_request = Request::from_parts(parts, empty_gateway_body());
        let response = match self.upstream.handle_request(upstream_request).await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "upstream handler failed on GET");
                self.record_upstream_failure(&session_id, &err.to_string())
                    .await;
                return Err(GatewayError::Upstream(err));
            }
        };

        self.tap_response(
            response,
            Some(session_id),
            true,
            RequestObservation::default(),
            STREAM_STANDALONE,
        )
        .await
    }

    /// DELETE: client-initiated session termination.
    async fn handle_delete<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, _body) = request.into_parts();
        let Some(session_id) = extract_session_id(&parts.headers) else {
            return Ok(bad_request_response("Missing Mcp-Session-Id header"));
        };

        // DELETE is admitted like any other request: the upstream needs a
        // live transport for the session before it can tear one down, and
        // on a non-sticky fleet this node may never have seen the id.
        match self.admission.admit(&session_id, false).await? {
            AdmissionDecision::Forward { .. } => {}
            AdmissionDecision::UnknownSession => {
                return Ok(session_not_found_response(
                    self.config.unknown_session_status.status_code(),
                ));
            }
            AdmissionDecision::SessionClosed => {
                return Ok(session_not_found_response(StatusCode::NOT_FOUND));
            }
        }

        // Forward first so the upstream processes the termination, then
        // flip the durable record; the response passes through either way.
        let upstream_request = Request::from_parts(parts, empty_gateway_body());
        let upstream_outcome = self.upstream.handle_request(upstream_request).await;

        self.interceptor.observe_delete(&session_id).await?;

        match upstream_outcome {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(error = %err, session_id, "upstream DELETE failed; session closed anyway");
                Err(GatewayError::Upstream(err))
            }
        }
    }

    /// Tap an upstream response: parse complete JSON bodies, tee SSE
    /// streams, pass everything else through unchanged.
    async fn tap_response(
        &self,
        response: Response<GatewayBody>,
        session_id: Option<String>,
        session_known: bool,
        observation: RequestObservation,
        stream_key: &'static str,
    ) -> Result<Response<GatewayBody>> {
        let (parts, body) = response.into_parts();
        let response_session_id = extract_session_id(&parts.headers);
        let content_type = header_str(&parts.headers, CONTENT_TYPE.as_str()).to_string();

        if content_type.starts_with("application/json") {
            let bytes = body.collect().await?.to_bytes();
            let frames = match parse_frames(&bytes) {
                Ok(frames) => frames,
                Err(err) => {
                    debug!(error = %err, "upstream JSON response did not parse; passing through");
                    Vec::new()
                }
            };
            self.interceptor
                .observe_json_response(
                    session_id.as_deref(),
                    response_session_id.as_deref(),
                    session_known,
                    &frames,
                    &observation,
                )
                .await?;

            if parts.status == StatusCode::NOT_FOUND {
                if let (Some(id), true) = (session_id.as_deref(), session_known) {
                    self.interceptor.observe_session_gone(id).await;
                }
            }
            return Ok(Response::from_parts(parts, full_gateway_body(bytes)));
        }

        if content_type.starts_with("text/event-stream") {
            let observe_id = response_session_id.or(session_id);
            if let Some(id) = observe_id {
                let (tee, mut events) = TeeBody::new(body);
                let interceptor = Arc::clone(&self.interceptor);
                tokio::spawn(async move {
                    while let Some(frame) = events.recv().await {
                        interceptor.observe_sse_data(&id, stream_key, &frame.data).await;
                    }
                });
                return Ok(Response::from_parts(parts, tee.boxed_unsync()));
            }
            return Ok(Response::from_parts(parts, body));
        }

        // Anything else (202 Accepted for notifications, upstream errors
        // with opaque bodies) passes through untouched.
        Ok(Response::from_parts(parts, body))
    }

    /// Forward requests outside the MCP path without interception.
    async fn forward_untouched<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = request.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return Ok(bad_request_response("Failed to read request body"));
            }
        };
        self.upstream
            .handle_request(Request::from_parts(parts, full_gateway_body(bytes)))
            .await
            .map_err(GatewayError::Upstream)
    }

    async fn record_upstream_failure(&self, session_id: &str, message: &str) {
        if let Err(err) = self
            .sessions
            .events()
            .record(
                session_id,
                STREAM_REQUEST,
                Direction::ServerToClient,
                EventKind::Error,
                None,
                None,
                json!({"error": message}),
            )
            .await
        {
            warn!(session_id, error = %err, "failed to record upstream failure event");
        }
    }

    fn error_response(&self, err: GatewayError) -> Response<GatewayBody> {
        if err.is_store_unavailable() {
            warn!(error = %err, "store unavailable on request path");
            return store_unavailable_response();
        }
        match &err {
            GatewayError::Upstream(upstream) => {
                internal_error_response(&format!("Upstream failure: {upstream}"))
            }
            other => {
                error!(error = %other, "internal gateway failure");
                internal_error_response("Internal error")
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Streamable HTTP requires clients to accept both JSON and SSE answers.
fn accept_allows_streamable_http(accept: &str) -> bool {
    if accept.contains("*/*") {
        return true;
    }
    accept.contains("application/json") && accept.contains("text/event-stream")
}
