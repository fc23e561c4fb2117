//! JSON-RPC 2.0 frames exchanged with tool servers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: Some(id.into()),
        }
    }

    /// A request without an id; the server must not answer it.
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn method_not_found(id: Option<Value>, method: &str) -> Self {
        Self::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("method '{method}' is not implemented by this client"),
        )
    }
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_id_and_params() {
        let req = RpcRequest::new("req-1", "tools/call", json!({"name": "echo"}));
        let encoded = serde_json::to_string(&req).expect("serializable");
        assert!(encoded.contains("\"jsonrpc\":\"2.0\""));
        assert!(encoded.contains("\"id\":\"req-1\""));
        assert!(encoded.contains("tools/call"));
    }

    #[test]
    fn notification_omits_id() {
        let req = RpcRequest::notification("notifications/initialized", json!({}));
        let encoded = serde_json::to_string(&req).expect("serializable");
        assert!(!encoded.contains("\"id\""));
    }

    #[test]
    fn error_response_round_trips() {
        let resp = RpcResponse::method_not_found(Some(json!(7)), "resources/read");
        let encoded = serde_json::to_string(&resp).expect("serializable");
        let decoded: RpcResponse = serde_json::from_str(&encoded).expect("deserializable");
        let err = decoded.error.expect("error payload");
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
        assert_eq!(decoded.id, Some(json!(7)));
    }
}
