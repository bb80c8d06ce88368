//! JSON-RPC 2.0 message types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{McpError, McpResult};

/// JSON-RPC 2.0 version string
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request or notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0"
    pub jsonrpc: String,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Absent for notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Request with a numeric id
    pub fn with_id(method: impl Into<String>, params: Option<Value>, id: i64) -> Self {
        Self::new(method, params, Some(Value::from(id)))
    }

    /// Notification: no id, no response expected
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(method, params, None)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(result: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(error: JsonRpcError, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Unwrap the result, converting a JSON-RPC error into the typed
    /// remote-error kind.
    pub fn into_result(self) -> McpResult<Value> {
        if let Some(err) = self.error {
            return Err(McpError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Either side of the wire: a request/notification or a response.
///
/// Transports hand these to their consumer without inspecting them; the
/// distinction matters only at the dispatch layer. `Request` must stay the
/// first untagged variant: anything carrying a `method` is a request, and
/// only frames without one fall through to `Response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Parse one frame. Anything that is not a complete JSON-RPC 2.0
    /// object is a framing error.
    pub fn from_frame(frame: &str) -> McpResult<Self> {
        let msg: JsonRpcMessage =
            serde_json::from_str(frame).map_err(|e| McpError::frame_parse(e.to_string()))?;
        let version = match &msg {
            JsonRpcMessage::Request(r) => &r.jsonrpc,
            JsonRpcMessage::Response(r) => &r.jsonrpc,
        };
        if version != JSONRPC_VERSION {
            return Err(McpError::frame_parse(format!(
                "unsupported jsonrpc version '{}'",
                version
            )));
        }
        Ok(msg)
    }

    pub fn to_frame(&self) -> McpResult<String> {
        serde_json::to_string(self).map_err(|e| McpError::internal(e.to_string()))
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request(r) => r.id.as_ref(),
            JsonRpcMessage::Response(r) => r.id.as_ref(),
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(req: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(req)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(resp: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(resp)
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound as i32,
            "Method not found",
            Some(Value::String(format!("method '{}' not found", method))),
        )
    }

    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidParams as i32,
            "Invalid params",
            Some(Value::String(details.into())),
        )
    }

    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidRequest as i32,
            "Invalid Request",
            Some(Value::String(details.into())),
        )
    }

    /// Build the upstream-facing error for a typed core error. The code
    /// follows the standard ranges and `data.kind` carries the stable kind
    /// string for programmatic callers.
    pub fn from_mcp_error(err: &McpError) -> Self {
        Self::new(
            err.jsonrpc_code(),
            err.to_string(),
            Some(serde_json::json!({ "kind": err.kind() })),
        )
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard JSON-RPC 2.0 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    ServerError = -32000,
}

impl JsonRpcErrorCode {
    /// Server-defined error range per the JSON-RPC 2.0 spec
    pub fn is_server_error(code: i32) -> bool {
        (-32099..=-32000).contains(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let request = JsonRpcRequest::with_id("tools/call", Some(json!({"name": "x"})), 7);
        let frame = serde_json::to_string(&request).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&frame).unwrap();
        assert_eq!(request, back);
        assert!(!request.is_notification());
    }

    #[test]
    fn test_notification_has_no_id() {
        let n = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(n.is_notification());
        let frame = serde_json::to_string(&n).unwrap();
        assert!(!frame.contains("\"id\""));
    }

    #[test]
    fn test_message_untagged_parse() {
        let req = JsonRpcMessage::from_frame(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let resp =
            JsonRpcMessage::from_frame(r#"{"jsonrpc":"2.0","result":{},"id":1}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));

        let err_resp = JsonRpcMessage::from_frame(
            r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"nope"},"id":2}"#,
        )
        .unwrap();
        match err_resp {
            JsonRpcMessage::Response(r) => assert!(r.is_error()),
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_bad_frames_rejected() {
        assert!(JsonRpcMessage::from_frame("not json").is_err());
        assert!(JsonRpcMessage::from_frame(r#"{"jsonrpc":"1.0","method":"m"}"#).is_err());
        assert!(JsonRpcMessage::from_frame(r#"{"foo":"bar"}"#).is_err());
    }

    #[test]
    fn test_into_result_maps_remote_error() {
        let resp = JsonRpcResponse::error(JsonRpcError::new(-32050, "boom", None), Some(json!(1)));
        match resp.into_result() {
            Err(McpError::Remote { code, message }) => {
                assert_eq!(code, -32050);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_error_data_kind() {
        let err = JsonRpcError::from_mcp_error(&McpError::ToolDisabled {
            name: "calc__add".to_string(),
        });
        assert_eq!(err.code, -32602);
        assert_eq!(err.data.unwrap()["kind"], "tool_disabled");
    }
}
