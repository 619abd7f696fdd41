//! Top-level application configuration (spec §6): the JSON file under the
//! user data dir that holds listen address, API key, data-dir, and the
//! retention/limit/feature knobs. Hot-reloaded on change via `notify`,
//! matching the ambient-stack note in `SPEC_FULL.md` §1.
//!
//! Upstream server configs themselves live in `mcpproxy-storage` once
//! loaded — this file seeds them on first run (so a hand-written config is
//! still a valid way to describe a fleet of upstreams) but storage, not this
//! file, is authoritative for a running proxy. Unknown top-level fields are
//! rejected at load (`DESIGN NOTES` §9's "config-option enumeration").

use std::path::{Path, PathBuf};

use mcpproxy_storage::model::{IsolationConfig, OAuthServerConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{McpProxyError, McpProxyResult};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_tools_limit() -> usize {
    50
}

fn default_tool_response_limit() -> usize {
    20 * 1024
}

fn default_activity_retention_days() -> i64 {
    7
}

fn default_activity_max_rows() -> usize {
    10_000
}

fn default_oauth_refresh_threshold() -> f64 {
    0.2
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

fn default_true() -> bool {
    true
}

/// A server entry as it appears in the config file, used only to seed
/// storage on first run. Shape mirrors `UpstreamServerRecord` minus the
/// fields storage derives (`server_key`, `created`, `updated`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub quarantined: bool,
    #[serde(default)]
    pub oauth: Option<OAuthServerConfig>,
    #[serde(default)]
    pub isolation: Option<IsolationConfig>,
}

/// The on-disk application config (spec §6). `#[serde(deny_unknown_fields)]`
/// enforces "the recognized server-config options are exactly the fields
/// listed" (DESIGN NOTES §9) at the top level too: an unrecognized knob
/// fails to load with a field-name error rather than being silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Generated on first run if absent, then persisted back (spec §6).
    #[serde(default)]
    pub api_key: Option<String>,
    pub data_dir: PathBuf,
    #[serde(default = "default_tools_limit")]
    pub tools_limit: usize,
    #[serde(default = "default_tool_response_limit")]
    pub tool_response_limit: usize,
    #[serde(default = "default_activity_retention_days")]
    pub activity_retention_days: i64,
    #[serde(default = "default_activity_max_rows")]
    pub activity_max_rows: usize,
    /// Lifetime-fraction-remaining at which the proactive refresh scheduler
    /// fires; spec default is 80% elapsed (0.2 remaining).
    #[serde(default = "default_oauth_refresh_threshold")]
    pub oauth_refresh_threshold: f64,
    #[serde(default = "default_true")]
    pub enable_socket: bool,
    #[serde(default)]
    pub enable_code_execution: bool,
    #[serde(default = "default_true")]
    pub enable_web_ui: bool,
    #[serde(default)]
    pub disable_management: bool,
    #[serde(default)]
    pub read_only_mode: bool,
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default)]
    pub servers: Vec<SeedServerConfig>,
}

impl AppConfig {
    pub fn default_for_data_dir(data_dir: PathBuf) -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_key: None,
            data_dir,
            tools_limit: default_tools_limit(),
            tool_response_limit: default_tool_response_limit(),
            activity_retention_days: default_activity_retention_days(),
            activity_max_rows: default_activity_max_rows(),
            oauth_refresh_threshold: default_oauth_refresh_threshold(),
            enable_socket: true,
            enable_code_execution: false,
            enable_web_ui: true,
            disable_management: false,
            read_only_mode: false,
            container_runtime: default_container_runtime(),
            servers: Vec::new(),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("mcpproxy.db")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("mcpproxy.sock")
    }

    /// Load from disk, creating a default config (with a freshly generated
    /// API key) if the file doesn't exist yet. Always returns with
    /// `api_key` populated, persisting the generated key back to disk.
    pub fn load_or_init(path: &Path, default_data_dir: PathBuf) -> McpProxyResult<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| McpProxyError::Config(format!("failed to read {}: {e}", path.display())))?;
            serde_json::from_str::<AppConfig>(&raw)
                .map_err(|e| McpProxyError::Config(format!("invalid config at {}: {e}", path.display())))?
        } else {
            info!(path = %path.display(), "no config file found, writing defaults");
            AppConfig::default_for_data_dir(default_data_dir)
        };

        if config.api_key.is_none() {
            let generated = generate_api_key();
            warn!("no API key configured; generated one and persisted it to the config file");
            config.api_key = Some(generated);
        }

        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> McpProxyResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| McpProxyError::Config(format!("failed to create {}: {e}", parent.display())))?;
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|e| McpProxyError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, serialized)
            .map_err(|e| McpProxyError::Config(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Validate invariants that aren't already enforced by serde defaults
    /// (spec §3's per-server invariants are enforced where servers are
    /// materialized, not here — this only covers the top-level knobs).
    pub fn validate(&self) -> McpProxyResult<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(McpProxyError::Config(format!(
                "listen_addr {:?} is not a valid socket address",
                self.listen_addr
            )));
        }
        if !(0.0..=1.0).contains(&self.oauth_refresh_threshold) {
            return Err(McpProxyError::Config(
                "oauth_refresh_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(McpProxyError::Config("server name must not be empty".to_string()));
            }
            if !seen.insert(server.name.clone()) {
                return Err(McpProxyError::DuplicateName(server.name.clone()));
            }
        }
        Ok(())
    }
}

fn generate_api_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_generates_and_persists_an_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig::load_or_init(&path, dir.path().join("data")).unwrap();
        assert!(config.api_key.is_some());

        let reloaded = AppConfig::load_or_init(&path, dir.path().join("data")).unwrap();
        assert_eq!(reloaded.api_key, config.api_key, "second load must not rotate the key");
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "x", "bogus_field": true}"#).unwrap();
        let err = AppConfig::load_or_init(&path, dir.path().join("data")).unwrap_err();
        assert!(matches!(err, McpProxyError::Config(_)));
    }

    #[test]
    fn validate_rejects_bad_listen_addr() {
        let mut config = AppConfig::default_for_data_dir(PathBuf::from("x"));
        config.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_seed_server_names() {
        let mut config = AppConfig::default_for_data_dir(PathBuf::from("x"));
        let seed = SeedServerConfig {
            name: "dup".to_string(),
            transport: TransportConfig::Http {
                url: "http://u/".to_string(),
                headers: Default::default(),
                mode: "auto".to_string(),
            },
            enabled: false,
            quarantined: true,
            oauth: None,
            isolation: None,
        };
        config.servers = vec![seed.clone(), seed];
        assert!(matches!(config.validate(), Err(McpProxyError::DuplicateName(_))));
    }
}
