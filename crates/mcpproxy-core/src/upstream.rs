//! Upstream Manager (spec §4.3): the registry of `name -> Managed Client`,
//! keyed internally by `server_key` for storage stability across renames.
//! Grounded on `turbomcp-proxy::proxy::backend`'s connector-registry shape,
//! generalized from "one backend" to "many, looked up by name."

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use mcpproxy_client::{ManagedClient, ManagedClientConfig};
use mcpproxy_events::{Event, EventBus};
use mcpproxy_oauth::OAuthManager;
use mcpproxy_storage::model::{IsolationConfig, OAuthServerConfig, TransportConfig, UpstreamServerRecord};
use mcpproxy_storage::server_key::server_key;
use mcpproxy_storage::Storage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{McpProxyError, McpProxyResult};

/// A consistent point-in-time view of one upstream, for `snapshot()` and the
/// REST `/api/v1/servers` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSnapshot {
    pub server_key: String,
    pub name: String,
    pub enabled: bool,
    pub quarantined: bool,
    pub connection_state: String,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

/// Identity string a `TransportConfig` is hashed against to derive its
/// `server_key` (spec §9's "includes URL/command so renames don't collide").
fn transport_identity(transport: &TransportConfig) -> String {
    match transport {
        TransportConfig::Http { url, .. } => url.clone(),
        TransportConfig::Stdio { command, args, .. } => format!("{command} {}", args.join(" ")),
    }
}

pub struct UpstreamManager {
    storage: Storage,
    events: EventBus,
    oauth: OAuthManager,
    clients: DashMap<String, Arc<ManagedClient>>,
    names: DashMap<String, String>, // name -> server_key
    logs_dir: PathBuf,
    containers_dir: PathBuf,
    container_runtime: String,
}

impl UpstreamManager {
    pub fn new(
        storage: Storage,
        events: EventBus,
        oauth: OAuthManager,
        logs_dir: PathBuf,
        containers_dir: PathBuf,
        container_runtime: String,
    ) -> Self {
        Self {
            storage,
            events,
            oauth,
            clients: DashMap::new(),
            names: DashMap::new(),
            logs_dir,
            containers_dir,
            container_runtime,
        }
    }

    /// Load every persisted server record and construct (but do not start)
    /// its Managed Client. Called once at startup.
    pub fn load_from_storage(&self) -> McpProxyResult<()> {
        for record in self.storage.list_servers()? {
            self.materialize(&record)?;
        }
        Ok(())
    }

    fn materialize(&self, record: &UpstreamServerRecord) -> McpProxyResult<Arc<ManagedClient>> {
        let config = ManagedClientConfig {
            server_key: record.server_key.clone(),
            server_name: record.name.clone(),
            transport: record.transport.clone(),
            oauth: record.oauth.clone(),
            isolation: record.isolation.clone(),
            logs_dir: self.logs_dir.clone(),
            containers_dir: self.containers_dir.clone(),
            container_runtime: self.container_runtime.clone(),
        };
        let client = ManagedClient::new(config, self.events.clone(), self.oauth.clone())
            .map_err(|e| McpProxyError::Internal(format!("failed to open log sink: {e}")))?;
        self.clients.insert(record.server_key.clone(), client.clone());
        self.names.insert(record.name.clone(), record.server_key.clone());
        Ok(client)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<ManagedClient>> {
        let key = self.names.get(name)?;
        self.clients.get(key.value()).map(|c| c.clone())
    }

    pub fn server_key_for(&self, name: &str) -> Option<String> {
        self.names.get(name).map(|k| k.value().clone())
    }

    pub fn record(&self, name: &str) -> McpProxyResult<UpstreamServerRecord> {
        let key = self
            .server_key_for(name)
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))?;
        self.storage
            .get_server(&key)?
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))
    }

    /// Add a new upstream. `quarantined` is forced `true` when the caller is
    /// the `upstream_servers` MCP tool (an LLM acting on the user's behalf)
    /// rather than a human operator, per spec §4.3.
    pub async fn add_server(
        &self,
        name: &str,
        transport: TransportConfig,
        oauth: Option<OAuthServerConfig>,
        isolation: Option<IsolationConfig>,
        quarantined: bool,
    ) -> McpProxyResult<UpstreamServerRecord> {
        if self.names.contains_key(name) {
            return Err(McpProxyError::DuplicateName(name.to_string()));
        }
        let key = server_key(name, &transport_identity(&transport));
        let now = Utc::now();
        let record = UpstreamServerRecord {
            server_key: key,
            name: name.to_string(),
            transport,
            enabled: false,
            quarantined,
            created: now,
            updated: now,
            oauth,
            isolation,
        };
        self.storage.put_server(&record)?;
        self.materialize(&record)?;
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        info!(server = %name, quarantined, "upstream added");
        Ok(record)
    }

    pub async fn enable_server(&self, name: &str) -> McpProxyResult<()> {
        let client = self
            .resolve(name)
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))?;
        let mut record = self.record(name)?;
        record.enabled = true;
        record.updated = Utc::now();
        self.storage.put_server(&record)?;
        client.enable().await;
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        Ok(())
    }

    pub async fn disable_server(&self, name: &str) -> McpProxyResult<()> {
        let client = self
            .resolve(name)
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))?;
        let mut record = self.record(name)?;
        record.enabled = false;
        record.updated = Utc::now();
        self.storage.put_server(&record)?;
        client.disable().await;
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        Ok(())
    }

    pub async fn restart_server(&self, name: &str) -> McpProxyResult<()> {
        let client = self
            .resolve(name)
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))?;
        client.restart().await;
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        Ok(())
    }

    pub fn quarantine_server(&self, name: &str, quarantined: bool) -> McpProxyResult<()> {
        let mut record = self.record(name)?;
        record.quarantined = quarantined;
        record.updated = Utc::now();
        self.storage.put_server(&record)?;
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        Ok(())
    }

    /// Stop, drain, and forget an upstream entirely; clears its OAuth
    /// tokens and tool hashes too (spec §4.3).
    pub async fn remove_server(&self, name: &str) -> McpProxyResult<()> {
        let key = self
            .server_key_for(name)
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))?;
        if let Some((_, client)) = self.clients.remove(&key) {
            client.disable().await;
        }
        self.names.remove(name);
        self.storage.remove_server(&key)?;
        self.events.publish(Event::OAuthTokenCleared {
            server_key: key.clone(),
        });
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        info!(server = %name, "upstream removed");
        Ok(())
    }

    /// A consistent view of every upstream's config and current health
    /// (spec §4.3).
    pub async fn snapshot(&self) -> Vec<UpstreamSnapshot> {
        let mut out = Vec::new();
        for entry in self.names.iter() {
            let name = entry.key().clone();
            let key = entry.value().clone();
            let record = match self.storage.get_server(&key) {
                Ok(Some(r)) => r,
                _ => continue,
            };
            let client = self.clients.get(&key).map(|c| c.clone());
            let (state, last_error, retry_count) = if let Some(client) = client {
                let info = client.connection_info().await;
                (format!("{:?}", info.state).to_lowercase(), info.last_error, info.retry_count)
            } else {
                ("disconnected".to_string(), None, 0)
            };
            out.push(UpstreamSnapshot {
                server_key: key,
                name,
                enabled: record.enabled,
                quarantined: record.quarantined,
                connection_state: state,
                last_error,
                retry_count,
            });
        }
        out
    }

    /// Persist a record the caller (the Management Service's `patch_server`)
    /// has already validated and mutated.
    pub fn put_record(&self, record: &UpstreamServerRecord) -> McpProxyResult<()> {
        self.storage.put_server(record)?;
        Ok(())
    }

    pub fn is_quarantined(&self, name: &str) -> bool {
        self.record(name).map(|r| r.quarantined).unwrap_or(true)
    }

    pub async fn shutdown(&self) {
        for entry in self.clients.iter() {
            entry.value().disable().await;
        }
        warn!("upstream manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, UpstreamManager) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage.clone(), events.clone());
        let manager = UpstreamManager::new(
            storage,
            events,
            oauth,
            dir.path().join("logs"),
            dir.path().join("containers"),
            "docker".to_string(),
        );
        (dir, manager)
    }

    #[tokio::test]
    async fn add_server_rejects_duplicate_names() {
        let (_dir, manager) = manager();
        let transport = TransportConfig::Http {
            url: "http://u/".to_string(),
            headers: Default::default(),
            mode: "auto".to_string(),
        };
        manager
            .add_server("x", transport.clone(), None, None, false)
            .await
            .unwrap();
        let err = manager.add_server("x", transport, None, None, false).await.unwrap_err();
        assert!(matches!(err, McpProxyError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn llm_added_servers_are_quarantined() {
        let (_dir, manager) = manager();
        let transport = TransportConfig::Http {
            url: "http://u/".to_string(),
            headers: Default::default(),
            mode: "auto".to_string(),
        };
        let record = manager.add_server("x", transport, None, None, true).await.unwrap();
        assert!(record.quarantined);
        assert!(manager.is_quarantined("x"));
    }

    #[tokio::test]
    async fn remove_server_clears_registry_and_storage() {
        let (_dir, manager) = manager();
        let transport = TransportConfig::Http {
            url: "http://u/".to_string(),
            headers: Default::default(),
            mode: "auto".to_string(),
        };
        manager.add_server("x", transport, None, None, false).await.unwrap();
        manager.remove_server("x").await.unwrap();
        assert!(manager.resolve("x").is_none());
        assert!(manager.record("x").is_err());
    }
}
