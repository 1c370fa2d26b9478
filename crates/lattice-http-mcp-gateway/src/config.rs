//! Gateway-side configuration.

use serde::Deserialize;

/// HTTP status answered for a session id this cluster does not know.
///
/// `NotFound` (404) is the Streamable HTTP behavior; `BadRequest` (400) is a
/// legacy mode for clients that predate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u16")]
pub enum UnknownSessionStatus {
    #[default]
    NotFound,
    BadRequest,
}

impl UnknownSessionStatus {
    pub fn status_code(self) -> hyper::StatusCode {
        match self {
            UnknownSessionStatus::NotFound => hyper::StatusCode::NOT_FOUND,
            UnknownSessionStatus::BadRequest => hyper::StatusCode::BAD_REQUEST,
        }
    }
}

impl TryFrom<u16> for UnknownSessionStatus {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            404 => Ok(UnknownSessionStatus::NotFound),
            400 => Ok(UnknownSessionStatus::BadRequest),
            other => Err(format!(
                "unknown_session_status must be 404 or 400, got {other}"
            )),
        }
    }
}

/// Configuration for the transport wrapper and admission controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Path the MCP endpoint is mounted at; other paths pass through
    /// untouched.
    pub mcp_path: String,
    /// Upper bound for buffered POST bodies; beyond it the gateway answers
    /// 413 without touching the upstream.
    pub max_body_bytes: usize,
    /// Status answered for unknown or closed sessions.
    pub unknown_session_status: UnknownSessionStatus,
    /// TTL of the store-side `admit:{id}` advisory lock.
    pub admit_lock_ttl_ms: u64,
    /// Total time to wait on a held admission lock before proceeding
    /// optimistically.
    pub admit_lock_wait_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mcp_path: "/mcp".to_string(),
            max_body_bytes: 1024 * 1024,
            unknown_session_status: UnknownSessionStatus::NotFound,
            admit_lock_ttl_ms: 2_000,
            admit_lock_wait_ms: 500,
        }
    }
}
