//! The upstream MCP SDK surface the gateway coordinates with.
//!
//! The SDK's session manager owns the authoritative in-memory transport map
//! for this instance. The gateway only ever mutates it through
//! `create_transport_for_session`, and only ever feeds it traffic through
//! `handle_request` and `inject_client_notification`.

use std::collections::HashMap;

use async_trait::async_trait;
use hyper::{Request, Response};
use serde_json::Value;

use crate::gateway::GatewayBody;

/// Failure reported by the upstream SDK. Opaque to the gateway; surfaced as
/// HTTP 500 and never written to durable state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct UpstreamError(pub String);

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Per-instance MCP session manager owned by the SDK.
#[async_trait]
pub trait UpstreamSessionManager: Send + Sync {
    /// Whether this instance already holds a live transport for the id.
    async fn has_session(&self, session_id: &str) -> bool;

    /// Reconstruct in-process transport state for a session first seen on
    /// another instance. MUST be idempotent: if a live transport already
    /// exists for the id (concurrent rehydration), the existing one is kept.
    /// `metadata` is the durable record's reconstruction hints, passed
    /// through verbatim.
    async fn create_transport_for_session(
        &self,
        session_id: &str,
        metadata: &HashMap<String, Value>,
    ) -> std::result::Result<(), UpstreamError>;

    /// Feed a synthesized client notification into the transport's inbound
    /// channel. Used for warming rehydrated transports of active sessions.
    async fn inject_client_notification(
        &self,
        session_id: &str,
        frame: Value,
    ) -> std::result::Result<(), UpstreamError>;

    /// The wrapped request handler.
    async fn handle_request(
        &self,
        request: Request<GatewayBody>,
    ) -> std::result::Result<Response<GatewayBody>, UpstreamError>;
}
