//! Tool Router (spec §4.4): the fixed built-in tool surface every agent
//! sees — `retrieve_tools`, `call_tool_read/write/destructive`, and the
//! `upstream_servers` management tool — regardless of how many upstreams
//! are connected. Grounded on `turbomcp-proxy::proxy::router`'s
//! request/response correlation shape, generalized from one backend to a
//! prefixed-name lookup across many.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mcpproxy_protocol::{Tool, ToolVariant};
use mcpproxy_search::{SearchResult, ToolIndex, DEFAULT_LIMIT};
use mcpproxy_storage::model::{ActivityRecord, ActivityType};
use mcpproxy_storage::Storage;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{McpProxyError, McpProxyResult};
use crate::upstream::UpstreamManager;

/// Tool responses larger than this are truncated and flagged
/// `response_truncated=true` (spec §4.4).
pub const TOOL_RESPONSE_LIMIT_BYTES: usize = 20 * 1024;

pub struct ToolRouter {
    upstreams: Arc<UpstreamManager>,
    index: Arc<Mutex<ToolIndex>>,
    storage: Storage,
    /// Atomic so a config hot-reload (spec §6) can adjust these without
    /// rebuilding the router.
    tool_response_limit: AtomicUsize,
    tools_limit: AtomicUsize,
}

impl ToolRouter {
    pub fn new(upstreams: Arc<UpstreamManager>, index: Arc<Mutex<ToolIndex>>, storage: Storage) -> Self {
        Self {
            upstreams,
            index,
            storage,
            tool_response_limit: AtomicUsize::new(TOOL_RESPONSE_LIMIT_BYTES),
            tools_limit: AtomicUsize::new(DEFAULT_LIMIT),
        }
    }

    pub fn with_response_limit(self, limit: usize) -> Self {
        self.tool_response_limit.store(limit, Ordering::SeqCst);
        self
    }

    pub fn with_tools_limit(self, limit: usize) -> Self {
        self.tools_limit.store(limit.max(1), Ordering::SeqCst);
        self
    }

    pub fn set_response_limit(&self, limit: usize) {
        self.tool_response_limit.store(limit, Ordering::SeqCst);
    }

    pub fn set_tools_limit(&self, limit: usize) {
        self.tools_limit.store(limit.max(1), Ordering::SeqCst);
    }

    /// `limit` defaults to `DEFAULT_LIMIT` and is capped by the configured
    /// `tools_limit` knob regardless of what the caller asks for (spec §4.4).
    pub fn retrieve_tools(&self, query: &str, limit: Option<usize>) -> Vec<SearchResult> {
        let cap = self.tools_limit.load(Ordering::SeqCst);
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(cap);
        self.index.lock().retrieve_tools(query, limit)
    }

    pub async fn call_tool_read(&self, prefixed_name: &str, arguments: Value) -> McpProxyResult<Value> {
        self.dispatch(prefixed_name, arguments, ToolVariant::Read).await
    }

    pub async fn call_tool_write(&self, prefixed_name: &str, arguments: Value) -> McpProxyResult<Value> {
        self.dispatch(prefixed_name, arguments, ToolVariant::Write).await
    }

    pub async fn call_tool_destructive(&self, prefixed_name: &str, arguments: Value) -> McpProxyResult<Value> {
        self.dispatch(prefixed_name, arguments, ToolVariant::Destructive).await
    }

    async fn dispatch(&self, prefixed_name: &str, arguments: Value, variant: ToolVariant) -> McpProxyResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();

        let (server_name, original_name) = Tool::parse_prefixed(prefixed_name)
            .ok_or_else(|| McpProxyError::MalformedToolName(prefixed_name.to_string()))?;

        if self.upstreams.is_quarantined(server_name) {
            self.record_activity(
                &request_id,
                server_name,
                original_name,
                &arguments,
                None,
                "quarantined",
                started.elapsed(),
                variant,
            );
            return Ok(quarantine_advisory(server_name, original_name));
        }

        let client = self
            .upstreams
            .resolve(server_name)
            .ok_or_else(|| McpProxyError::ServerNotFound(server_name.to_string()))?;

        if !client.is_ready().await {
            let info = client.connection_info().await;
            self.record_activity(
                &request_id,
                server_name,
                original_name,
                &arguments,
                None,
                "not_ready",
                started.elapsed(),
                variant,
            );
            return Err(McpProxyError::NotReady {
                server: server_name.to_string(),
                state: format!("{:?}", info.state),
            });
        }

        let deadline = Duration::from_secs(30);
        let result = client.call_tool(original_name, arguments.clone(), Some(deadline)).await;

        let response_limit = self.tool_response_limit.load(Ordering::SeqCst);
        let (status, response) = match &result {
            Ok(value) => ("ok", Some(truncate(&value.content, response_limit))),
            Err(_) => ("error", None),
        };

        self.record_activity(
            &request_id,
            server_name,
            original_name,
            &arguments,
            response.as_ref(),
            status,
            started.elapsed(),
            variant,
        );

        let response = response.ok_or_else(|| result.unwrap_err())?;
        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_activity(
        &self,
        request_id: &str,
        server_name: &str,
        tool_name: &str,
        arguments: &Value,
        response: Option<&Value>,
        status: &str,
        elapsed: Duration,
        variant: ToolVariant,
    ) {
        let record = ActivityRecord {
            id: ulid::Ulid::new().to_string(),
            kind: ActivityType::ToolCall,
            source: variant.as_tool_name().to_string(),
            server_name: Some(server_name.to_string()),
            tool_name: Some(tool_name.to_string()),
            arguments: Some(arguments.clone()),
            response: response.cloned(),
            status: status.to_string(),
            error_message: None,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
            session_id: None,
            request_id: Some(request_id.to_string()),
            metadata: Default::default(),
        };
        if let Err(e) = self.storage.append_activity(&record) {
            warn!(error = %e, "failed to persist activity record");
        }
    }
}

/// Truncate a tool response once its serialized size exceeds `limit` bytes,
/// wrapping it so the caller can tell truncation happened (spec §4.4 + §8's
/// boundary test: exactly `limit` bytes is not truncated, `limit+1` is).
fn truncate(value: &Value, limit: usize) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= limit {
        return value.clone();
    }
    let mut truncated: String = serialized.chars().take(limit).collect();
    if truncated.len() > limit {
        truncated.truncate(limit);
    }
    serde_json::json!({
        "response_truncated": true,
        "original_size_bytes": serialized.len(),
        "content": truncated,
    })
}

/// Structured refusal returned instead of dispatching to a quarantined
/// upstream (spec §8 scenario 1): contains tool metadata and guidance, never
/// the caller's arguments or any upstream output.
fn quarantine_advisory(server_name: &str, tool_name: &str) -> Value {
    serde_json::json!({
        "quarantined": true,
        "server": server_name,
        "tool": tool_name,
        "message": format!(
            "{server_name}:{tool_name} is quarantined and requires manual approval before it can be called."
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_prefixed_name_is_rejected() {
        assert!(Tool::parse_prefixed("notprefixed").is_none());
    }

    #[test]
    fn truncate_is_exact_at_the_boundary() {
        let value = serde_json::json!("x".repeat(10));
        let serialized_len = value.to_string().len();
        let untouched = truncate(&value, serialized_len);
        assert_eq!(untouched, value);
        let truncated = truncate(&value, serialized_len - 1);
        assert_eq!(truncated["response_truncated"], true);
    }

    #[test]
    fn quarantine_advisory_never_echoes_arguments() {
        let advisory = quarantine_advisory("x", "echo");
        assert_eq!(advisory["quarantined"], true);
        assert!(advisory.to_string().contains("requires manual approval"));
    }
}
