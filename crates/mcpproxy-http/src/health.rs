//! Unauthenticated liveness/readiness probes (spec §6).

use axum::extract::State;
use axum::Json;

use crate::state::AppState;

pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Ready once storage has opened and the runtime has started accepting
/// upstream connections; in practice that's always true by the time this
/// handler can run (the listener isn't bound until `Runtime::start`
/// returns), so this mirrors `healthz` but reports upstream counts too.
pub async fn readyz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.runtime.upstreams().snapshot().await;
    let ready = snapshot.iter().filter(|s| s.connection_state == "ready").count();
    Json(serde_json::json!({
        "status": "ok",
        "upstreams": {
            "total": snapshot.len(),
            "ready": ready,
        },
    }))
}
