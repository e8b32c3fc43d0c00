//! JSON-RPC 2.0 message types.
//!
//! Mirrors the wire shape used by MCP: requests/notifications share a body,
//! responses carry either a result or an error but never both.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC version marker (always serializes/deserializes as `"2.0"`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid jsonrpc version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// Request identifier, string or number per the JSON-RPC spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: RequestId,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }

    /// `true` for the one notification the core emits server-to-client during long calls.
    pub fn is_progress(&self) -> bool {
        self.method == "notifications/progress"
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Result-or-error payload of a response; `#[serde(untagged)]` keeps the two
/// variants mutually exclusive on the wire the way the JSON-RPC spec requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponsePayload {
    Success { result: Value },
    Error { error: JsonRpcError },
}

/// Response id: `None` only for the parse-error case, where no request id could be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub Option<RequestId>);

impl ResponseId {
    pub fn from_request(id: RequestId) -> Self {
        Self(Some(id))
    }

    pub fn null() -> Self {
        Self(None)
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    #[serde(flatten)]
    pub payload: JsonRpcResponsePayload,
    pub id: ResponseId,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            payload: JsonRpcResponsePayload::Success { result },
            id: ResponseId::from_request(id),
        }
    }

    pub fn error(id: ResponseId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            payload: JsonRpcResponsePayload::Error { error },
            id,
        }
    }
}

/// Standard JSON-RPC error codes, plus the gateway's one extension
/// (`-32000 Method not allowed`, used at the HTTP layer per the transport spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    MethodNotAllowed,
    ApplicationError(i32),
}

impl JsonRpcErrorCode {
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::MethodNotAllowed => -32000,
            Self::ApplicationError(code) => code,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::MethodNotAllowed => "Method not allowed",
            Self::ApplicationError(_) => "Application error",
        }
    }
}

impl From<JsonRpcErrorCode> for JsonRpcError {
    fn from(code: JsonRpcErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }
}

/// Union of the message shapes that can appear on the wire. Batches are not
/// part of the core's supported method set (§6) so only the three bare
/// message kinds are modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = JsonRpcRequest::new("tools/call", Some(serde_json::json!({"name": "x"})), 1.into());
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: JsonRpcRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.method, "tools/call");
        assert_eq!(decoded.id, RequestId::Number(1));
    }

    #[test]
    fn response_success_round_trips() {
        let resp = JsonRpcResponse::success(RequestId::String("a".into()), serde_json::json!({"ok": true}));
        let encoded = serde_json::to_string(&resp).unwrap();
        let decoded: JsonRpcResponse = serde_json::from_str(&encoded).unwrap();
        match decoded.payload {
            JsonRpcResponsePayload::Success { result } => {
                assert_eq!(result, serde_json::json!({"ok": true}));
            }
            JsonRpcResponsePayload::Error { .. } => panic!("expected success payload"),
        }
    }

    #[test]
    fn response_error_excludes_result_field() {
        let resp = JsonRpcResponse::error(
            ResponseId::null(),
            JsonRpcErrorCode::ParseError.into(),
        );
        let encoded = serde_json::to_value(&resp).unwrap();
        assert!(encoded.get("result").is_none());
        assert_eq!(encoded["error"]["code"], -32700);
        assert!(encoded["id"].is_null());
    }

    #[test]
    fn untagged_message_distinguishes_request_from_notification() {
        let notification = JsonRpcNotification::new("notifications/progress", None);
        let encoded = serde_json::to_string(&notification).unwrap();
        let decoded: JsonRpcMessage = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, JsonRpcMessage::Notification(_)));
    }
}
