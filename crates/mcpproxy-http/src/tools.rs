//! `GET /api/v1/tools?q=…` (spec §6): the same `retrieve_tools` search the
//! `retrieve_tools` MCP tool exposes, as a REST GET for dashboards and the
//! CLI's `tools` command (out of scope here, but this is the interface it
//! consumes).

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    #[serde(default, rename = "q")]
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn search_tools(State(state): State<AppState>, Query(params): Query<ToolsQuery>) -> Json<serde_json::Value> {
    let results = state.runtime.router().retrieve_tools(&params.query, params.limit);
    Json(json!({ "tools": results }))
}
