//! JSON-RPC 2.0 envelope used over every transport (stdio, streamable-http, sse).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC request id. MCP allows string or integer ids; we mint integers
/// for outbound requests but must round-trip whatever an upstream sends back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl From<i64> for JsonRpcId {
    fn from(n: i64) -> Self {
        JsonRpcId::Number(n)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification: same shape as a request but with no id and thus
/// no response. Used for things like `notifications/tools/list_changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error),
            // Malformed response bodies (both or neither set) are treated as
            // an empty success; the caller's schema validation catches it.
            (Some(result), Some(_)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// An inbound frame may be a response to one of our requests, or a
/// server-initiated notification/request we don't originate ids for.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

pub fn parse_inbound(raw: &str) -> serde_json::Result<InboundFrame> {
    let value: Value = serde_json::from_str(raw)?;
    if value.get("id").is_some() {
        Ok(InboundFrame::Response(serde_json::from_value(value)?))
    } else {
        Ok(InboundFrame::Notification(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request() {
        let req = JsonRpcRequest::new(JsonRpcId::Number(1), "tools/list", None);
        let raw = serde_json::to_string(&req).unwrap();
        assert!(raw.contains("\"method\":\"tools/list\""));
    }

    #[test]
    fn response_without_error_is_ok() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: JsonRpcId::Number(1),
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        };
        assert!(resp.into_result().is_ok());
    }

    #[test]
    fn distinguishes_response_from_notification() {
        let notif = r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#;
        match parse_inbound(notif).unwrap() {
            InboundFrame::Notification(n) => assert_eq!(n.method, "notifications/tools/list_changed"),
            InboundFrame::Response(_) => panic!("expected notification"),
        }
    }
}
