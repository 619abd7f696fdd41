//! `GET/POST /api/v1/servers`, `PATCH/DELETE /api/v1/servers/{id}`, and the
//! `POST /api/v1/servers/{id}/{action}` lifecycle verbs (spec §6). Thin:
//! every handler here just extracts the request id, deserializes the body,
//! and calls straight through to the `ManagementService` the same
//! `upstream_servers` MCP tool in `mcp.rs` uses — the two surfaces share one
//! set of invariants by construction, not by convention.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use mcpproxy_core::management::ServerPatch;
use mcpproxy_storage::model::{IsolationConfig, OAuthServerConfig, TransportConfig};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::request_id::RequestId;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AddServerRequest {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub quarantined: Option<bool>,
    #[serde(default)]
    pub oauth: Option<OAuthServerConfig>,
    #[serde(default)]
    pub isolation: Option<IsolationConfig>,
}

pub async fn list_servers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.runtime.upstreams().snapshot().await;
    Json(json!({ "servers": snapshot }))
}

pub async fn add_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<AddServerRequest>,
) -> Response {
    // A server registered through the REST API is an operator action, not
    // an LLM one, so it is not forced into quarantine unless the caller asks
    // (spec §3: default `quarantined=true` only applies to LLM-added servers).
    let quarantined = body.quarantined.unwrap_or(false);
    match state
        .runtime
        .management()
        .add_server(&body.name, body.transport, body.oauth, body.isolation, quarantined)
        .await
    {
        Ok(record) => Json(json!({ "server": record })).into_response(),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

pub async fn remove_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    match state.runtime.management().remove_server(&name).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

pub async fn patch_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
    Json(patch): Json<ServerPatch>,
) -> Response {
    match state.runtime.management().patch_server(&name, patch) {
        Ok(diff) => Json(json!({ "diff": diff })).into_response(),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

pub async fn enable_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().enable_server(&name).await)
}

pub async fn disable_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().disable_server(&name).await)
}

pub async fn restart_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().restart_server(&name).await)
}

pub async fn quarantine_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().quarantine_server(&name))
}

pub async fn unquarantine_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().unquarantine_server(&name))
}

pub async fn login_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().trigger_oauth_login(&name).await)
}

pub async fn logout_server(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    respond(request_id, state.runtime.management().trigger_oauth_logout(&name))
}

fn respond(request_id: RequestId, result: mcpproxy_core::McpProxyResult<()>) -> Response {
    match result {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError::new(e, request_id.0).into_response(),
    }
}

pub async fn restart_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "result": state.runtime.management().restart_all().await }))
}

pub async fn enable_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "result": state.runtime.management().enable_all().await }))
}

pub async fn disable_all(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "result": state.runtime.management().disable_all().await }))
}
