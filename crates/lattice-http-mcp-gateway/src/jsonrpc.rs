//! Outermost JSON-RPC frame parsing.
//!
//! The gateway observes traffic, it does not dispatch it, so this model
//! deliberately stops at the outermost object: method, id, params, and
//! whether a result or error is present. Request bodies may carry a single
//! object or a batch array; both parse to a flat list of frames.

use serde_json::Value;

/// Shape of an outermost JSON-RPC object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `method` and `id` present.
    Request,
    /// `method` present, no `id`.
    Notification,
    /// `result` present with an `id`.
    Response,
    /// `error` present.
    Error,
    /// An object that is not recognizably JSON-RPC. Passed through
    /// untouched and never recorded.
    Unknown,
}

/// One observed JSON-RPC object.
#[derive(Debug, Clone)]
pub struct JsonRpcFrame {
    pub method: Option<String>,
    /// JSON-RPC id; numeric or string per JSON-RPC 2.0, kept as raw JSON.
    pub id: Option<Value>,
    pub params: Option<Value>,
    has_result: bool,
    error_code: Option<i64>,
    has_error: bool,
    /// The raw object, recorded verbatim as the event payload.
    pub raw: Value,
}

impl JsonRpcFrame {
    /// Read a frame out of a JSON value; `None` unless it is an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            method: obj.get("method").and_then(Value::as_str).map(String::from),
            id: obj.get("id").cloned().filter(|id| !id.is_null()),
            params: obj.get("params").cloned(),
            has_result: obj.contains_key("result"),
            has_error: obj.contains_key("error"),
            error_code: obj
                .get("error")
                .and_then(|err| err.get("code"))
                .and_then(Value::as_i64),
            raw: value.clone(),
        })
    }

    pub fn kind(&self) -> FrameKind {
        if self.has_error {
            FrameKind::Error
        } else if self.has_result {
            FrameKind::Response
        } else if self.method.is_some() {
            if self.id.is_some() {
                FrameKind::Request
            } else {
                FrameKind::Notification
            }
        } else {
            FrameKind::Unknown
        }
    }

    pub fn is_initialize(&self) -> bool {
        self.method.as_deref() == Some("initialize")
    }

    /// The client's initialization-complete notification. Both the modern
    /// and the bare legacy method name occur in the wild.
    pub fn is_initialized_notification(&self) -> bool {
        matches!(
            self.method.as_deref(),
            Some("notifications/initialized") | Some("initialized")
        )
    }

    /// JSON-RPC error code, when this frame carries an error.
    pub fn error_code(&self) -> Option<i64> {
        self.error_code
    }

    /// `session_id` carried in the params object, if any.
    pub fn params_session_id(&self) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|params| params.get("session_id"))
            .and_then(Value::as_str)
    }
}

/// Parse a request or response body into frames. A JSON array is a batch;
/// anything non-object inside one is skipped.
pub fn parse_frames(bytes: &[u8]) -> std::result::Result<Vec<JsonRpcFrame>, serde_json::Error> {
    let value: Value = serde_json::from_slice(bytes)?;
    Ok(frames_from_value(&value))
}

/// Frames contained in an already-parsed JSON value.
pub fn frames_from_value(value: &Value) -> Vec<JsonRpcFrame> {
    match value {
        Value::Array(items) => items.iter().filter_map(JsonRpcFrame::from_value).collect(),
        other => JsonRpcFrame::from_value(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request_notification_response_error() {
        let request = JsonRpcFrame::from_value(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list"
        }))
        .unwrap();
        assert_eq!(request.kind(), FrameKind::Request);

        let notification = JsonRpcFrame::from_value(&json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .unwrap();
        assert_eq!(notification.kind(), FrameKind::Notification);
        assert!(notification.is_initialized_notification());

        let response = JsonRpcFrame::from_value(&json!({
            "jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": "2025-03-26"}
        }))
        .unwrap();
        assert_eq!(response.kind(), FrameKind::Response);

        let error = JsonRpcFrame::from_value(&json!({
            "jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "gone"}
        }))
        .unwrap();
        assert_eq!(error.kind(), FrameKind::Error);
        assert_eq!(error.error_code(), Some(-32000));
    }

    #[test]
    fn string_and_numeric_ids_are_preserved() {
        let numeric = JsonRpcFrame::from_value(&json!({"jsonrpc":"2.0","id":7,"method":"x"}))
            .unwrap();
        assert_eq!(numeric.id, Some(json!(7)));

        let string = JsonRpcFrame::from_value(&json!({"jsonrpc":"2.0","id":"req-7","method":"x"}))
            .unwrap();
        assert_eq!(string.id, Some(json!("req-7")));
    }

    #[test]
    fn batch_bodies_flatten_to_frames() {
        let frames = parse_frames(
            br#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"2.0","method":"b"},42]"#,
        )
        .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind(), FrameKind::Request);
        assert_eq!(frames[1].kind(), FrameKind::Notification);
    }

    #[test]
    fn params_session_id_is_exposed() {
        let frame = JsonRpcFrame::from_value(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list",
            "params": {"session_id": "s-abc"}
        }))
        .unwrap();
        assert_eq!(frame.params_session_id(), Some("s-abc"));
    }

    #[test]
    fn unrecognizable_objects_are_unknown() {
        let frame = JsonRpcFrame::from_value(&json!({"hello": "world"})).unwrap();
        assert_eq!(frame.kind(), FrameKind::Unknown);
        assert!(JsonRpcFrame::from_value(&json!("scalar")).is_none());
    }
}
