//! Workspace-wide error type. Leaf errors from each crate wrap in here only
//! at this boundary (spec §7), matching `turbomcp-proxy::error::ProxyError`'s
//! layered wrap-don't-flatten approach: each variant keeps its source error
//! intact rather than collapsing it to a string immediately.

use thiserror::Error;

pub type McpProxyResult<T> = std::result::Result<T, McpProxyError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum McpProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server name already in use: {0}")]
    DuplicateName(String),

    #[error("field {field} is immutable and cannot be changed")]
    ImmutableField { field: String },

    #[error("management operation refused: {0}")]
    ManagementRefused(String),

    #[error("server {0} is not OAuth-capable")]
    NotOAuthCapable(String),

    #[error("malformed tool name: {0}")]
    MalformedToolName(String),

    #[error("server {0} is quarantined")]
    Quarantined(String),

    #[error("upstream {server} is not ready (state: {state})")]
    NotReady { server: String, state: String },

    #[error(transparent)]
    Protocol(#[from] mcpproxy_protocol::Error),

    #[error(transparent)]
    Storage(#[from] mcpproxy_storage::StorageError),

    #[error(transparent)]
    OAuth(#[from] mcpproxy_oauth::OAuthError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl McpProxyError {
    /// A version of this error safe to send to an untrusted caller: strips
    /// anything that might leak upstream internals (stdio commands, URLs,
    /// header values) beyond the coarse classification.
    pub fn sanitize(&self) -> String {
        match self {
            McpProxyError::ServerNotFound(name) => format!("server not found: {name}"),
            McpProxyError::DuplicateName(name) => format!("server name already in use: {name}"),
            McpProxyError::ImmutableField { field } => format!("field {field} is immutable"),
            McpProxyError::Quarantined(name) => format!("server {name} is quarantined"),
            McpProxyError::NotReady { server, .. } => format!("upstream {server} is not ready"),
            McpProxyError::MalformedToolName(_) => "malformed tool name".to_string(),
            McpProxyError::NotOAuthCapable(name) => format!("server {name} is not OAuth-capable"),
            McpProxyError::ManagementRefused(_) => "management operation refused".to_string(),
            McpProxyError::Config(_) => "invalid configuration".to_string(),
            McpProxyError::Protocol(_) => "upstream protocol error".to_string(),
            McpProxyError::Storage(_) => "storage error".to_string(),
            McpProxyError::OAuth(_) => "authentication error".to_string(),
            McpProxyError::Internal(_) => "internal error".to_string(),
        }
    }
}
