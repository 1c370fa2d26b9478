//! Session id and cursor discovery from HTTP requests.
//!
//! Discovery order on the request path: the `Mcp-Session-Id` header, then
//! the legacy `X-Mcp-Session-Id` header, then a `session_id` field in the
//! JSON-RPC params. `Last-Event-ID` is a per-stream resumption cursor, never
//! a session locator.

use hyper::HeaderMap;
use tracing::warn;

use crate::jsonrpc::JsonRpcFrame;

pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
pub const SESSION_ID_HEADER_LEGACY: &str = "X-Mcp-Session-Id";
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Session id from the request headers, primary then legacy name.
pub fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    for name in [SESSION_ID_HEADER, SESSION_ID_HEADER_LEGACY] {
        if let Some(value) = headers.get(name).and_then(|h| h.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// SSE resumption cursor, forwarded to the upstream untouched. Opaque here:
/// the upstream assigns event ids, the gateway does not parse them.
pub fn extract_last_event_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// Full discovery across headers and body frames. When the header and a
/// params `session_id` disagree, the header wins and the disagreement is
/// logged.
pub fn discover_session_id(headers: &HeaderMap, frames: &[JsonRpcFrame]) -> Option<String> {
    let from_params = frames.iter().find_map(|frame| frame.params_session_id());

    if let Some(header_id) = extract_session_id(headers) {
        if let Some(params_id) = from_params {
            if params_id != header_id {
                warn!(
                    header = %header_id,
                    params = %params_id,
                    "session id in header and params disagree; header wins"
                );
            }
        }
        return Some(header_id);
    }
    from_params.map(String::from)
}
