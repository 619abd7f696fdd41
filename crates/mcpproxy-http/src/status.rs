//! `GET /api/v1/status` (spec §6): a single-call summary for the GUI tray
//! and CLI `status` command (both out of scope, both consumers of this).

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.runtime.config();
    let snapshot = state.runtime.upstreams().snapshot().await;
    let ready = snapshot.iter().filter(|s| s.connection_state == "ready").count();
    let quarantined = snapshot.iter().filter(|s| s.quarantined).count();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "listen_addr": config.listen_addr,
        "upstreams": {
            "total": snapshot.len(),
            "ready": ready,
            "quarantined": quarantined,
        },
        "subscribers": state.runtime.events().subscriber_count(),
    }))
}
