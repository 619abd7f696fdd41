//! `GET /mcp`, `POST /mcp` (spec §6): MCP over streamable HTTP, unauthenticated
//! for client compatibility. `POST` carries one JSON-RPC request/response;
//! `GET` opens a keep-alive SSE stream for the rare server-initiated message
//! (this proxy never pushes one over `/mcp` itself — `/events` is where
//! Runtime state changes go — but the stream exists so a strict
//! streamable-HTTP client's `GET` doesn't 404).
//!
//! Exposes exactly the fixed built-in tool surface (spec §4.4): upstream
//! tools are never listed directly here, only discovered through
//! `retrieve_tools` and invoked through the three `call_tool_*` variants.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use mcpproxy_protocol::{JsonRpcError, JsonRpcId, JsonRpcResponse, PROTOCOL_VERSION};
use mcpproxy_storage::model::{IsolationConfig, OAuthServerConfig, TransportConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::state::AppState;

/// Minimal inbound JSON-RPC shape: unlike `mcpproxy_protocol::JsonRpcRequest`
/// (built for requests *this proxy originates* to an upstream, hence a
/// `&'static str` `jsonrpc` field), a request arriving over HTTP needs owned
/// fields to deserialize at all. Mirrors the teacher's own
/// HTTP-local `JsonRpcRequest` rather than reusing the wire-client type.
#[derive(Debug, Deserialize)]
pub struct IncomingRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<JsonRpcId>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

pub async fn mcp_get() -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = futures::stream::empty();
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

pub async fn mcp_post(State(state): State<AppState>, Json(request): Json<IncomingRpcRequest>) -> Response {
    let Some(id) = request.id.clone() else {
        // A notification: acknowledged with 202, no JSON-RPC response body.
        return axum::http::StatusCode::ACCEPTED.into_response();
    };

    let result = match request.method.as_str() {
        "initialize" => Ok(initialize_result()),
        "tools/list" => Ok(list_tools_result()),
        "tools/call" => handle_tools_call(&state, request.params.unwrap_or(Value::Null)).await,
        other => Err(JsonRpcError {
            code: -32601,
            message: format!("method not found: {other}"),
            data: None,
        }),
    };

    let response = match result {
        Ok(result) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        },
        Err(error) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        },
    };
    Json(response).into_response()
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "mcpproxy", "version": env!("CARGO_PKG_VERSION") },
    })
}

fn list_tools_result() -> Value {
    json!({
        "tools": [
            {
                "name": "retrieve_tools",
                "description": "Search the indexed tool surface of every connected upstream by free-text query.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "limit": { "type": "integer", "minimum": 1 },
                    },
                    "required": ["query"],
                },
            },
            {
                "name": "call_tool_read",
                "description": "Invoke a read-only upstream tool by its server:tool name.",
                "inputSchema": call_tool_schema(),
            },
            {
                "name": "call_tool_write",
                "description": "Invoke a state-changing upstream tool by its server:tool name.",
                "inputSchema": call_tool_schema(),
            },
            {
                "name": "call_tool_destructive",
                "description": "Invoke a destructive upstream tool by its server:tool name.",
                "inputSchema": call_tool_schema(),
            },
            {
                "name": "upstream_servers",
                "description": "Manage upstream MCP servers: list, add, remove, enable, disable, restart, quarantine, login, logout.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "action": { "type": "string" },
                        "name": { "type": "string" },
                    },
                    "required": ["action"],
                },
            },
        ]
    })
}

fn call_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string", "description": "prefixed server:tool name" },
            "arguments": { "type": "object" },
        },
        "required": ["name"],
    })
}

async fn handle_tools_call(state: &AppState, params: Value) -> Result<Value, JsonRpcError> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    match name {
        "retrieve_tools" => {
            let query = arguments.get("query").and_then(Value::as_str).unwrap_or_default();
            let limit = arguments.get("limit").and_then(Value::as_u64).map(|n| n as usize);
            let results = state.runtime.router().retrieve_tools(query, limit);
            Ok(json!({ "content": results }))
        }
        "call_tool_read" | "call_tool_write" | "call_tool_destructive" => {
            dispatch_call_tool(state, name, arguments).await
        }
        "upstream_servers" => handle_upstream_servers(state, arguments).await,
        other => Err(JsonRpcError {
            code: -32602,
            message: format!("unknown tool: {other}"),
            data: None,
        }),
    }
}

async fn dispatch_call_tool(state: &AppState, variant: &str, arguments: Value) -> Result<Value, JsonRpcError> {
    let prefixed_name = arguments
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("call_tool_* requires a \"name\" field"))?;
    let call_args = arguments.get("arguments").cloned().unwrap_or(Value::Null);

    let router = state.runtime.router();
    let outcome = match variant {
        "call_tool_read" => router.call_tool_read(prefixed_name, call_args).await,
        "call_tool_write" => router.call_tool_write(prefixed_name, call_args).await,
        _ => router.call_tool_destructive(prefixed_name, call_args).await,
    };
    outcome.map_err(|e| internal_error(&e))
}

async fn handle_upstream_servers(state: &AppState, arguments: Value) -> Result<Value, JsonRpcError> {
    let action = arguments.get("action").and_then(Value::as_str).unwrap_or_default();
    let name = arguments.get("name").and_then(Value::as_str).unwrap_or_default();
    let management = state.runtime.management();

    match action {
        "list" => {
            let snapshot = state.runtime.upstreams().snapshot().await;
            Ok(json!({ "servers": snapshot }))
        }
        "add" => {
            let transport: TransportConfig = serde_json::from_value(arguments.get("transport").cloned().unwrap_or(Value::Null))
                .map_err(|e| invalid_params(&format!("invalid transport: {e}")))?;
            let oauth: Option<OAuthServerConfig> = arguments
                .get("oauth")
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| invalid_params(&format!("invalid oauth config: {e}")))?;
            let isolation: Option<IsolationConfig> = arguments
                .get("isolation")
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| invalid_params(&format!("invalid isolation config: {e}")))?;
            // Added through the LLM-facing tool surface: always quarantined
            // until a human reviews it, per spec §4.3.
            management
                .add_server(name, transport, oauth, isolation, true)
                .await
                .map(|record| json!({ "server": record }))
                .map_err(|e| internal_error(&e))
        }
        "remove" => management
            .remove_server(name)
            .await
            .map(|()| json!({ "removed": name }))
            .map_err(|e| internal_error(&e)),
        "enable" => management
            .enable_server(name)
            .await
            .map(|()| json!({ "enabled": name }))
            .map_err(|e| internal_error(&e)),
        "disable" => management
            .disable_server(name)
            .await
            .map(|()| json!({ "disabled": name }))
            .map_err(|e| internal_error(&e)),
        "restart" => management
            .restart_server(name)
            .await
            .map(|()| json!({ "restarted": name }))
            .map_err(|e| internal_error(&e)),
        "quarantine" => management
            .quarantine_server(name)
            .map(|()| json!({ "quarantined": name }))
            .map_err(|e| internal_error(&e)),
        "unquarantine" => management
            .unquarantine_server(name)
            .map(|()| json!({ "unquarantined": name }))
            .map_err(|e| internal_error(&e)),
        "login" => management
            .trigger_oauth_login(name)
            .await
            .map(|()| json!({ "login_started": name }))
            .map_err(|e| internal_error(&e)),
        "logout" => management
            .trigger_oauth_logout(name)
            .map(|()| json!({ "logged_out": name }))
            .map_err(|e| internal_error(&e)),
        other => Err(invalid_params(&format!("unknown upstream_servers action: {other}"))),
    }
}

fn invalid_params(message: &str) -> JsonRpcError {
    JsonRpcError {
        code: -32602,
        message: message.to_string(),
        data: None,
    }
}

fn internal_error(error: &mcpproxy_core::McpProxyError) -> JsonRpcError {
    warn!(error = %error, "tool dispatch failed");
    JsonRpcError {
        code: -32603,
        message: error.sanitize(),
        data: None,
    }
}
