//! Shared Axum state: a handle to the Runtime plus the configured API key,
//! read once at startup (spec §6's "generated if missing and persisted back"
//! already happened by the time the Runtime exists).

use std::sync::Arc;

use mcpproxy_core::Runtime;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub api_key: String,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let api_key = runtime
            .config()
            .api_key
            .clone()
            .unwrap_or_default();
        Self { runtime, api_key }
    }
}
