//! JSON-RPC 2.0 envelope types for the broker's stdio wire protocol.
//!
//! The channel itself and its framing are out of scope for the core crate
//! (§1); this is the concrete transport §10-13 of the expanded spec asks a
//! complete, runnable broker to carry. One NDJSON line in, one line out;
//! `method` is a tool name from §6 and `params` is that tool's argument
//! object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC 2.0 request (orchestrator -> broker).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

/// A successful JSON-RPC 2.0 response (broker -> orchestrator).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub result: Value,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn new(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", result, id }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 error response (broker -> orchestrator). Reserved for
/// transport-level faults (malformed JSON, unknown method); tool-level
/// failures are normal responses carrying `isError: true` (§4.J, §7).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub error: JsonRpcErrorData,
    pub id: Value,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            error: JsonRpcErrorData { code, message: message.into(), data: None },
            id,
        }
    }
}

/// A JSON-RPC 2.0 notification (broker -> orchestrator, no id). Used for
/// the event fan-out named in §9: transfer progress, terminal data, tunnel
/// closure.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: "2.0", method: method.into(), params }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_request_without_params() {
        let req: JsonRpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"listConnections","id":1}"#).unwrap();
        assert_eq!(req.method, "listConnections");
        assert!(req.params.is_null());
    }

    #[test]
    fn success_response_has_no_error_field() {
        let resp = JsonRpcResponse::new(json!(1), json!({"text": "ok", "isError": false}));
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["result"]["isError"], false);
    }

    #[test]
    fn notification_has_no_id_field() {
        let notif = JsonRpcNotification::new("transfer.progress", json!({"transferId": "t1"}));
        let value = serde_json::to_value(&notif).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "transfer.progress");
    }
}
