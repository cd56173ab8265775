//! JSON-RPC 2.0 envelopes and message classification

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol-level error kinds with their JSON-RPC codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    ToolExecution,
    SessionNotFound,
    ChannelFull,
}

impl RpcErrorKind {
    pub fn code(self) -> i32 {
        match self {
            RpcErrorKind::ParseError => -32700,
            RpcErrorKind::InvalidRequest => -32600,
            RpcErrorKind::MethodNotFound => -32601,
            RpcErrorKind::InvalidParams => -32602,
            RpcErrorKind::Internal => -32603,
            RpcErrorKind::ToolExecution => -32000,
            RpcErrorKind::SessionNotFound => -32001,
            RpcErrorKind::ChannelFull => -32002,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -32700 => RpcErrorKind::ParseError,
            -32600 => RpcErrorKind::InvalidRequest,
            -32601 => RpcErrorKind::MethodNotFound,
            -32602 => RpcErrorKind::InvalidParams,
            -32603 => RpcErrorKind::Internal,
            -32000 => RpcErrorKind::ToolExecution,
            -32001 => RpcErrorKind::SessionNotFound,
            -32002 => RpcErrorKind::ChannelFull,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RpcErrorKind::ParseError => "parse_error",
            RpcErrorKind::InvalidRequest => "invalid_request",
            RpcErrorKind::MethodNotFound => "method_not_found",
            RpcErrorKind::InvalidParams => "invalid_params",
            RpcErrorKind::Internal => "internal",
            RpcErrorKind::ToolExecution => "tool_execution",
            RpcErrorKind::SessionNotFound => "session_not_found",
            RpcErrorKind::ChannelFull => "channel_full",
        }
    }
}

/// JSON-RPC error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn kind(&self) -> Option<RpcErrorKind> {
        RpcErrorKind::from_code(self.code)
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self::from_error(id, JsonRpcError::new(kind, message))
    }

    pub fn from_error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_kind(&self) -> Option<RpcErrorKind> {
        self.error.as_ref().and_then(JsonRpcError::kind)
    }
}

/// Server-to-client notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// An inbound message after classification.
///
/// `id` + `method` is a request, `id` alone a response, `method` alone a
/// notification. A `null` id counts as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
    },
    Invalid {
        id: Option<Value>,
        reason: String,
    },
}

impl Message {
    pub fn classify(value: Value) -> Self {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => {
                return Message::Invalid {
                    id: None,
                    reason: "message must be a JSON object".to_string(),
                }
            }
        };

        let id = take_non_null(&mut obj, "id");
        let params = take_non_null(&mut obj, "params");

        let method = match obj.remove("method") {
            None | Some(Value::Null) => None,
            Some(Value::String(m)) => Some(m),
            Some(_) => {
                return Message::Invalid {
                    id,
                    reason: "method must be a string".to_string(),
                }
            }
        };

        match (id, method) {
            (Some(id), Some(method)) => Message::Request { id, method, params },
            (None, Some(method)) => Message::Notification { method, params },
            (Some(id), None) => Message::Response { id },
            (None, None) => Message::Invalid {
                id: None,
                reason: "message has neither id nor method".to_string(),
            },
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request { .. })
    }
}

fn take_non_null(obj: &mut Map<String, Value>, key: &str) -> Option<Value> {
    match obj.remove(key) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v),
    }
}

/// Stable string key for a request id, used to track in-flight calls
pub fn request_key(id: &Value) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_request() {
        let msg = Message::classify(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}));
        assert_eq!(
            msg,
            Message::Request {
                id: json!(1),
                method: "tools/list".to_string(),
                params: None
            }
        );
    }

    #[test]
    fn test_classify_notification_and_response() {
        let msg = Message::classify(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        assert!(matches!(msg, Message::Notification { .. }));

        let msg = Message::classify(json!({"jsonrpc": "2.0", "id": "a", "result": {}}));
        assert_eq!(msg, Message::Response { id: json!("a") });
    }

    #[test]
    fn test_null_id_is_notification() {
        let msg = Message::classify(json!({"id": null, "method": "ping"}));
        assert!(matches!(msg, Message::Notification { .. }));
    }

    #[test]
    fn test_classify_invalid() {
        assert!(matches!(
            Message::classify(json!([1, 2])),
            Message::Invalid { id: None, .. }
        ));
        assert!(matches!(
            Message::classify(json!({"id": 3, "method": 42})),
            Message::Invalid { id: Some(_), .. }
        ));
        assert!(matches!(
            Message::classify(json!({"jsonrpc": "2.0"})),
            Message::Invalid { id: None, .. }
        ));
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = JsonRpcResponse::error(json!(7), RpcErrorKind::SessionNotFound, "Session not found");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], -32001);
        assert!(value.get("result").is_none());
        assert_eq!(resp.error_kind(), Some(RpcErrorKind::SessionNotFound));
    }

    #[test]
    fn test_request_key() {
        assert_eq!(request_key(&json!(42)), "42");
        assert_ne!(request_key(&json!("42")), request_key(&json!(42)));
    }
}
