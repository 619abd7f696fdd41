//! Persisted record shapes. These are the authoritative on-disk schema;
//! `mcpproxy-core` builds its richer in-memory config types on top of them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the two transport families an upstream can use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        working_dir: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// `http` | `sse` | `streamable-http` | `auto`
        #[serde(default = "default_http_kind")]
        mode: String,
    },
}

fn default_http_kind() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthServerConfig {
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub extra_params: HashMap<String, String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub callback_port: u16,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// The persisted form of an upstream server. `server_key` is derived, not
/// stored redundantly elsewhere, but it IS persisted here since it's the
/// storage lookup key and must survive a name-reuse collision intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamServerRecord {
    pub server_key: String,
    pub name: String,
    pub transport: TransportConfig,
    pub enabled: bool,
    pub quarantined: bool,
    pub created: chrono::DateTime<chrono::Utc>,
    pub updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub oauth: Option<OAuthServerConfig>,
    #[serde(default)]
    pub isolation: Option<IsolationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokenRecord {
    pub server_key: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub created: chrono::DateTime<chrono::Utc>,
    pub updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub callback_port: Option<u16>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl OAuthTokenRecord {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime as a fraction of [0, 1] clamped at both ends,
    /// measured from `created`/last refresh (`updated`) to `expires_at`.
    pub fn lifetime_fraction_remaining(&self, now: chrono::DateTime<chrono::Utc>) -> f64 {
        let total = (self.expires_at - self.updated).num_milliseconds().max(1) as f64;
        let remaining = (self.expires_at - now).num_milliseconds() as f64;
        (remaining / total).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ToolCall,
    PolicyDecision,
    QuarantineChange,
    ServerChange,
    SystemStart,
    SystemStop,
    InternalToolCall,
    ConfigChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: String, // ULID, sorts lexically by time
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub source: String,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Per-server per-tool hash snapshot, used by the indexer to diff against an
/// upstream's freshly listed tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolHashSnapshot {
    /// original_name -> hash
    pub hashes: HashMap<String, String>,
}
