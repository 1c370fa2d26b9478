//! Responses the gateway originates itself.
//!
//! Everything else on the wire is the upstream's, passed through unchanged.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::gateway::GatewayBody;

/// JSON-RPC error code answered for unknown or terminated sessions.
pub const CODE_SESSION_NOT_FOUND: i64 = -32000;
/// JSON-RPC error code answered when the session store is unreachable;
/// clients may retry.
pub const CODE_STORE_UNAVAILABLE: i64 = -32001;
/// JSON-RPC invalid-request code for malformed HTTP usage.
pub const CODE_INVALID_REQUEST: i64 = -32600;
/// JSON-RPC internal-error code.
pub const CODE_INTERNAL_ERROR: i64 = -32603;

fn full_body(bytes: Bytes) -> GatewayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn jsonrpc_error_response(status: StatusCode, code: i64, message: &str) -> Response<GatewayBody> {
    let body = json!({
        "jsonrpc": "2.0",
        "error": {"code": code, "message": message},
        "id": null,
    });
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

/// Unknown or closed session. The status is configurable (404 default,
/// 400 legacy); the body is fixed.
pub fn session_not_found_response(status: StatusCode) -> Response<GatewayBody> {
    jsonrpc_error_response(status, CODE_SESSION_NOT_FOUND, "Session not found")
}

/// Store unreachable or circuit open; the client should retry.
pub fn store_unavailable_response() -> Response<GatewayBody> {
    jsonrpc_error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        CODE_STORE_UNAVAILABLE,
        "Session store unavailable",
    )
}

pub fn bad_request_response(message: &str) -> Response<GatewayBody> {
    jsonrpc_error_response(StatusCode::BAD_REQUEST, CODE_INVALID_REQUEST, message)
}

pub fn payload_too_large_response() -> Response<GatewayBody> {
    jsonrpc_error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        CODE_INVALID_REQUEST,
        "Request body too large",
    )
}

pub fn internal_error_response(message: &str) -> Response<GatewayBody> {
    jsonrpc_error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        CODE_INTERNAL_ERROR,
        message,
    )
}

pub fn method_not_allowed_response() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header("Allow", "POST, GET, DELETE, OPTIONS")
        .body(full_body(Bytes::new()))
        .unwrap()
}

pub fn preflight_response() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Allow", "POST, GET, DELETE, OPTIONS")
        .body(full_body(Bytes::new()))
        .unwrap()
}
