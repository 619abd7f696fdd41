//! Error taxonomy for the MCP wire layer.
//!
//! Mirrors the 3-tier split (protocol / transport / application) that the
//! rest of the workspace's error enums key off of: every higher-level crate
//! wraps `mcpproxy_protocol::Error` rather than re-deriving the same kinds.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result type alias used throughout the wire layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification, stable across `Display` wording changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Transport-level failure: connection refused, process exited, socket closed.
    Transport,
    /// Malformed MCP frame or JSON-RPC envelope.
    Protocol,
    /// The upstream returned a JSON-RPC error object.
    Upstream,
    /// HTTP 401 with a `WWW-Authenticate` challenge.
    Unauthorized,
    /// Request exceeded its deadline.
    Timeout,
    /// The request was canceled (shutdown, disable, disconnect).
    Canceled,
    /// A caller-supplied value failed validation.
    InvalidParams,
    /// Anything that should never happen; logged, not retried.
    Internal,
}

/// A wire-layer error with enough structure to route without string-matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    /// JSON-RPC error code, present when `kind == Upstream`.
    pub upstream_code: Option<i64>,
    /// `resource_metadata` URL from a `WWW-Authenticate` challenge, present
    /// when `kind == Unauthorized`.
    pub resource_metadata_url: Option<String>,
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            upstream_code: None,
            resource_metadata_url: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn upstream(code: i64, message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Upstream, message);
        e.upstream_code = Some(code);
        e
    }

    pub fn unauthorized(resource_metadata_url: Option<String>) -> Self {
        let mut e = Self::new(ErrorKind::Unauthorized, "authentication required");
        e.resource_metadata_url = resource_metadata_url;
        e
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("malformed JSON-RPC frame: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}
