//! # Lattice HTTP MCP Gateway
//!
//! The request-path half of the lattice coordination layer: an HTTP
//! middleware that sits between a load balancer and an MCP server speaking
//! Streamable HTTP, and keeps the durable session store in step with the
//! JSON-RPC traffic flowing through it.
//!
//! Pieces, outside-in:
//! - [`SessionGateway`]: the transport wrapper. Buffers POST bodies,
//!   extracts session ids, forwards to the upstream handler with a
//!   replayable body, and taps JSON and SSE responses.
//! - [`AdmissionController`]: rehydrates upstream transport state for
//!   sessions this instance has never seen, warming them when the durable
//!   record says the session is already active.
//! - [`ProtocolInterceptor`]: maps observed JSON-RPC frames to session
//!   lifecycle transitions and event-log appends.
//!
//! The gateway never generates session identifiers and never alters the
//! bytes it forwards; it observes.

pub mod admission;
pub mod config;
pub mod gateway;
pub mod interceptor;
pub mod json_rpc_responses;
pub mod jsonrpc;
pub mod prelude;
pub mod protocol;
pub mod sse;
pub mod upstream;

#[cfg(test)]
mod tests;

pub use admission::{AdmissionController, AdmissionDecision};
pub use config::{GatewayConfig, UnknownSessionStatus};
pub use gateway::{GatewayBody, SessionGateway};
pub use interceptor::{ProtocolInterceptor, RequestObservation};
pub use jsonrpc::{parse_frames, FrameKind, JsonRpcFrame};
pub use protocol::{discover_session_id, extract_last_event_id, extract_session_id};
pub use sse::{SseFrame, SseScanner, TeeBody};
pub use upstream::{UpstreamError, UpstreamSessionManager};

use lattice_mcp_session_store::{SessionError, StoreError};

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures surfaced at the gateway boundary.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    /// Whether this failure is a transient backend outage (surfaced as 503).
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            GatewayError::Store(StoreError::Unavailable(_))
                | GatewayError::Session(SessionError::Store(StoreError::Unavailable(_)))
        )
    }
}
