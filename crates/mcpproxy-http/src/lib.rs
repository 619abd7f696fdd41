//! HTTP/MCP Frontage (spec §2, §6): thin translation layer between the wire
//! and the `Runtime` — the streamable-HTTP MCP endpoint at `/mcp`
//! (unauthenticated, for client compatibility), the REST management API
//! under `/api/v1/*` and the `/events` SSE stream (both API-key gated), and
//! unauthenticated `/healthz`/`/readyz` probes.
//!
//! Grounded on the teacher's `turbomcp-proxy::proxy::frontends` Axum-router
//! assembly: one `Router` per concern, merged, with auth and request-id as
//! `tower::Layer`s rather than woven into every handler.

pub mod activity;
pub mod auth;
pub mod error;
pub mod health;
pub mod mcp;
pub mod request_id;
pub mod servers;
pub mod socket;
pub mod sse;
pub mod state;
pub mod status;
pub mod tools;

use std::time::Duration;

use axum::routing::{get, patch, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Request bodies above this size are rejected before reaching a handler
/// (spec §6 doesn't name a figure for inbound bodies; this guards against a
/// misbehaving client wedging the management API, independent of the
/// `tool_response_limit` knob which bounds *outbound* tool responses).
const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/mcp", get(mcp::mcp_get).post(mcp::mcp_post))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
}

fn management_routes() -> Router<AppState> {
    Router::new()
        .route("/events", get(sse::events_stream))
        .route("/api/v1/status", get(status::status))
        .route("/api/v1/servers", get(servers::list_servers).post(servers::add_server))
        .route(
            "/api/v1/servers/restart_all",
            post(servers::restart_all),
        )
        .route("/api/v1/servers/enable_all", post(servers::enable_all))
        .route("/api/v1/servers/disable_all", post(servers::disable_all))
        .route(
            "/api/v1/servers/{id}",
            patch(servers::patch_server).delete(servers::remove_server),
        )
        .route("/api/v1/servers/{id}/enable", post(servers::enable_server))
        .route("/api/v1/servers/{id}/disable", post(servers::disable_server))
        .route("/api/v1/servers/{id}/restart", post(servers::restart_server))
        .route("/api/v1/servers/{id}/quarantine", post(servers::quarantine_server))
        .route(
            "/api/v1/servers/{id}/unquarantine",
            post(servers::unquarantine_server),
        )
        .route("/api/v1/servers/{id}/login", post(servers::login_server))
        .route("/api/v1/servers/{id}/logout", post(servers::logout_server))
        .route("/api/v1/tools", get(tools::search_tools))
        .route("/api/v1/activity", get(activity::list_activity))
        .route("/api/v1/activity/export", get(activity::export_activity))
        .route("/api/v1/activity/{id}", get(activity::get_activity))
}

fn common_layers(router: Router) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(request_id::tag_request_id))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
    )
}

/// Assemble the full Axum app for the TCP listener: the unauthenticated MCP +
/// probe routes, and the API-key-gated REST + SSE routes, under one shared
/// `AppState`.
pub fn build_router(state: AppState) -> Router {
    let gated = management_routes()
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_api_key));

    common_layers(public_routes().merge(gated)).with_state(state)
}

/// Assemble the Axum app for the local IPC socket (spec §6): the same route
/// table as [`build_router`], minus the `require_api_key` layer. A caller
/// that can open this socket already had filesystem access to the data dir,
/// so the API key buys nothing further there.
pub fn build_unix_router(state: AppState) -> Router {
    common_layers(public_routes().merge(management_routes())).with_state(state)
}
