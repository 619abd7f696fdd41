//! `GET /api/v1/activity`, `GET /api/v1/activity/{id}`, and
//! `GET /api/v1/activity/export` (spec §6). Reads straight from storage:
//! the activity log isn't routed through the Management Service since it's
//! pure history, not a config mutation with gates to check.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;

use crate::error::ApiError;
use crate::request_id::RequestId;
use crate::state::AppState;

pub async fn list_activity(State(state): State<AppState>, Extension(request_id): Extension<RequestId>) -> Response {
    match state.runtime.storage().list_activity() {
        Ok(mut records) => {
            // ULID ids sort lexically by creation time; present newest first.
            records.sort_by(|a, b| b.id.cmp(&a.id));
            Json(json!({ "activity": records })).into_response()
        }
        Err(e) => ApiError::new(e.into(), request_id.0).into_response(),
    }
}

pub async fn get_activity(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Response {
    match state.runtime.storage().get_activity(&id) {
        Ok(Some(record)) => Json(json!({ "activity": record })).into_response(),
        Ok(None) => ApiError::bad_request(format!("no activity record with id {id}"), request_id.0).into_response(),
        Err(e) => ApiError::new(e.into(), request_id.0).into_response(),
    }
}

/// Newline-delimited JSON dump of the full activity log, for the CLI's
/// export command (out of scope here) or a quick `curl | jq` pull.
pub async fn export_activity(State(state): State<AppState>, Extension(request_id): Extension<RequestId>) -> Response {
    match state.runtime.storage().list_activity() {
        Ok(mut records) => {
            records.sort_by(|a, b| a.id.cmp(&b.id));
            let mut body = String::new();
            for record in &records {
                if let Ok(line) = serde_json::to_string(record) {
                    body.push_str(&line);
                    body.push('\n');
                }
            }
            (StatusCode::OK, [(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
        }
        Err(e) => ApiError::new(e.into(), request_id.0).into_response(),
    }
}
