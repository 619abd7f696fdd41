//! Management Service (spec §4.6): the single synchronous facade behind the
//! REST layer, the local socket, the CLI, and the built-in `upstream_servers`
//! MCP tool. Every write goes through `patch_server`'s strategic-merge
//! semantics or one of the lifecycle verbs below, and every write emits
//! `servers.changed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use mcpproxy_events::{Event, EventBus};
use mcpproxy_oauth::{LoginRequest, OAuthManager};
use mcpproxy_storage::model::{IsolationConfig, OAuthServerConfig, TransportConfig, UpstreamServerRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{McpProxyError, McpProxyResult};
use crate::upstream::UpstreamManager;

/// A strategic-merge patch request. Every field is optional: absence means
/// "leave unchanged." `oauth`/`isolation` are the "double option" shape:
/// a missing key deserializes to `None` (leave unchanged), an explicit JSON
/// `null` deserializes to `Some(None)` (remove the substructure), and a
/// present object deserializes to `Some(Some(patch))`, itself recursively
/// merged field-by-field into whatever substructure is already persisted
/// (spec §4.6: "nested-struct fields deep-merge recursively").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPatch {
    pub enabled: Option<bool>,
    pub quarantined: Option<bool>,
    /// Replaces the whole transport wholesale when present; use `env`/
    /// `headers` for a deep-merge of just the map fields instead, since the
    /// two transport kinds don't share one partial shape.
    pub transport: Option<TransportConfig>,
    /// Deep-merges into `transport`'s `env` map (stdio transports only);
    /// a `null` value for a key removes that key (spec §8 scenario 3).
    pub env: Option<HashMap<String, Option<String>>>,
    /// Deep-merges into `transport`'s `headers` map (http-family transports
    /// only); a `null` value for a key removes that key.
    pub headers: Option<HashMap<String, Option<String>>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub oauth: Option<Option<OAuthPatch>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub isolation: Option<Option<IsolationPatch>>,
    /// Rejected outright: present only so `patch_server` can return a
    /// field-immutable error if a caller tries.
    pub name: Option<String>,
}

/// Recursive per-field patch for `IsolationConfig`. Scalar/array fields
/// replace when present; `Option<String>` fields use the same double-option
/// shape as `ServerPatch.oauth`/`isolation` so a `null` clears just that
/// one field while omission preserves it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IsolationPatch {
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub image: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub network_mode: Option<Option<String>>,
    pub extra_args: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub working_dir: Option<Option<String>>,
}

/// Recursive per-field patch for `OAuthServerConfig`. `extra_params` is a
/// map and deep-merges key-by-key like `env`/`headers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthPatch {
    pub scopes: Option<Vec<String>>,
    pub extra_params: Option<HashMap<String, Option<String>>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub client_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub client_secret: Option<Option<String>>,
    pub callback_port: Option<u16>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub redirect_uri: Option<Option<String>>,
}

/// Deserializes a present-but-`null` field as `Some(None)` rather than
/// collapsing it to `None` the way a bare `Option<Option<T>>` would,
/// distinguishing "omitted" from "explicitly cleared."
fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

/// Applies a recursive `IsolationPatch` onto an existing `IsolationConfig`
/// (or a freshly defaulted one if none was persisted yet).
fn apply_isolation_patch(current: &mut IsolationConfig, patch: IsolationPatch) {
    if let Some(enabled) = patch.enabled {
        current.enabled = enabled;
    }
    if let Some(image) = patch.image {
        current.image = image;
    }
    if let Some(network_mode) = patch.network_mode {
        current.network_mode = network_mode;
    }
    if let Some(extra_args) = patch.extra_args {
        current.extra_args = extra_args;
    }
    if let Some(working_dir) = patch.working_dir {
        current.working_dir = working_dir;
    }
}

/// Applies a recursive `OAuthPatch` onto an existing `OAuthServerConfig`
/// (or a freshly defaulted one if none was persisted yet).
fn apply_oauth_patch(current: &mut OAuthServerConfig, patch: OAuthPatch) {
    if let Some(scopes) = patch.scopes {
        current.scopes = scopes;
    }
    if let Some(extra_params) = patch.extra_params {
        apply_map_patch(&mut current.extra_params, extra_params);
    }
    if let Some(client_id) = patch.client_id {
        current.client_id = client_id;
    }
    if let Some(client_secret) = patch.client_secret {
        current.client_secret = client_secret;
    }
    if let Some(callback_port) = patch.callback_port {
        current.callback_port = callback_port;
    }
    if let Some(redirect_uri) = patch.redirect_uri {
        current.redirect_uri = redirect_uri;
    }
}

/// Field-level before/after, returned from every `patch_server` call and
/// logged (spec §4.6).
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDiff {
    pub server_key: String,
    pub changed_fields: Vec<String>,
    pub before: Value,
    pub after: Value,
}

/// Aggregate result of a bulk operation (`restart_all`, `enable_all`,
/// `disable_all`): never short-circuits on a per-server failure.
#[derive(Debug, Clone, Serialize, Default)]
pub struct BulkResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct ManagementService {
    upstreams: Arc<UpstreamManager>,
    oauth: OAuthManager,
    events: EventBus,
    /// Shared with the Runtime's config-reload path so a hot config change
    /// takes effect on the next call without rebuilding this service.
    disable_management: Arc<AtomicBool>,
    read_only_mode: Arc<AtomicBool>,
}

impl ManagementService {
    pub fn new(
        upstreams: Arc<UpstreamManager>,
        oauth: OAuthManager,
        events: EventBus,
        disable_management: bool,
        read_only_mode: bool,
    ) -> Self {
        Self {
            upstreams,
            oauth,
            events,
            disable_management: Arc::new(AtomicBool::new(disable_management)),
            read_only_mode: Arc::new(AtomicBool::new(read_only_mode)),
        }
    }

    /// Apply a config-reload's gate values without reconstructing the
    /// service (spec §6: config is hot-reloaded).
    pub fn set_gates(&self, disable_management: bool, read_only_mode: bool) {
        self.disable_management.store(disable_management, Ordering::SeqCst);
        self.read_only_mode.store(read_only_mode, Ordering::SeqCst);
    }

    fn check_writable(&self) -> McpProxyResult<()> {
        if self.disable_management.load(Ordering::SeqCst) {
            return Err(McpProxyError::ManagementRefused(
                "management operations are disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn check_config_writable(&self) -> McpProxyResult<()> {
        self.check_writable()?;
        if self.read_only_mode.load(Ordering::SeqCst) {
            return Err(McpProxyError::ManagementRefused(
                "config modification is disabled (read_only_mode)".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn add_server(
        &self,
        name: &str,
        transport: TransportConfig,
        oauth: Option<OAuthServerConfig>,
        isolation: Option<IsolationConfig>,
        quarantined: bool,
    ) -> McpProxyResult<UpstreamServerRecord> {
        self.check_config_writable()?;
        self.upstreams
            .add_server(name, transport, oauth, isolation, quarantined)
            .await
    }

    pub async fn remove_server(&self, name: &str) -> McpProxyResult<()> {
        self.check_config_writable()?;
        self.upstreams.remove_server(name).await
    }

    pub async fn enable_server(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        self.upstreams.enable_server(name).await
    }

    pub async fn disable_server(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        self.upstreams.disable_server(name).await
    }

    pub async fn restart_server(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        self.upstreams.restart_server(name).await
    }

    pub fn quarantine_server(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        self.upstreams.quarantine_server(name, true)
    }

    pub fn unquarantine_server(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        self.upstreams.quarantine_server(name, false)
    }

    /// Strategic-merge patch (spec §4.6): omitted fields preserved, scalars
    /// replace, maps deep-merge with `null` removing a key, nested structs
    /// deep-merge with `null` removing the whole substructure, `name` and
    /// `created` are immutable.
    pub fn patch_server(&self, name: &str, patch: ServerPatch) -> McpProxyResult<ConfigDiff> {
        self.check_config_writable()?;
        if patch.name.is_some() {
            return Err(McpProxyError::ImmutableField {
                field: "name".to_string(),
            });
        }

        let key = self
            .upstreams
            .server_key_for(name)
            .ok_or_else(|| McpProxyError::ServerNotFound(name.to_string()))?;
        let mut record = self.upstreams.record(name)?;
        let before = serde_json::to_value(&record).unwrap_or(Value::Null);
        let mut changed_fields = Vec::new();

        if let Some(enabled) = patch.enabled {
            if record.enabled != enabled {
                record.enabled = enabled;
                changed_fields.push("enabled".to_string());
            }
        }
        if let Some(quarantined) = patch.quarantined {
            if record.quarantined != quarantined {
                record.quarantined = quarantined;
                changed_fields.push("quarantined".to_string());
            }
        }
        if let Some(transport) = patch.transport {
            record.transport = transport;
            changed_fields.push("transport".to_string());
        }
        if let Some(env_patch) = patch.env {
            if let TransportConfig::Stdio { env, .. } = &mut record.transport {
                apply_map_patch(env, env_patch);
                changed_fields.push("transport.env".to_string());
            }
        }
        if let Some(headers_patch) = patch.headers {
            if let TransportConfig::Http { headers, .. } = &mut record.transport {
                apply_map_patch(headers, headers_patch);
                changed_fields.push("transport.headers".to_string());
            }
        }
        if let Some(oauth_patch) = patch.oauth {
            match oauth_patch {
                None => {
                    record.oauth = None;
                }
                Some(p) => {
                    let mut current = record.oauth.take().unwrap_or_default();
                    apply_oauth_patch(&mut current, p);
                    record.oauth = Some(current);
                }
            }
            changed_fields.push("oauth".to_string());
        }
        if let Some(isolation_patch) = patch.isolation {
            match isolation_patch {
                None => {
                    record.isolation = None;
                }
                Some(p) => {
                    let mut current = record.isolation.take().unwrap_or_default();
                    apply_isolation_patch(&mut current, p);
                    record.isolation = Some(current);
                }
            }
            changed_fields.push("isolation".to_string());
        }

        if changed_fields.is_empty() {
            record.updated = Utc::now();
            let after = serde_json::to_value(&record).unwrap_or(Value::Null);
            self.upstreams_put(&record)?;
            return Ok(ConfigDiff {
                server_key: key,
                changed_fields,
                before,
                after,
            });
        }

        record.updated = Utc::now();
        let after = serde_json::to_value(&record).unwrap_or(Value::Null);
        self.upstreams_put(&record)?;
        self.events.publish(Event::ServersChanged {
            server_name: name.to_string(),
        });
        info!(server = %name, ?changed_fields, "server config patched");

        Ok(ConfigDiff {
            server_key: key,
            changed_fields,
            before,
            after,
        })
    }

    fn upstreams_put(&self, record: &UpstreamServerRecord) -> McpProxyResult<()> {
        self.upstreams.put_record(record)
    }

    pub async fn restart_all(&self) -> BulkResult {
        let mut result = BulkResult::default();
        for name in self.bulk_names().await {
            match self.restart_server(&name).await {
                Ok(()) => result.succeeded.push(name),
                Err(e) => result.failed.push((name, e.sanitize())),
            }
        }
        result
    }

    pub async fn enable_all(&self) -> BulkResult {
        let mut result = BulkResult::default();
        for name in self.bulk_names().await {
            match self.enable_server(&name).await {
                Ok(()) => result.succeeded.push(name),
                Err(e) => result.failed.push((name, e.sanitize())),
            }
        }
        result
    }

    pub async fn disable_all(&self) -> BulkResult {
        let mut result = BulkResult::default();
        for name in self.bulk_names().await {
            match self.disable_server(&name).await {
                Ok(()) => result.succeeded.push(name),
                Err(e) => result.failed.push((name, e.sanitize())),
            }
        }
        result
    }

    async fn bulk_names(&self) -> Vec<String> {
        self.upstreams.snapshot().await.into_iter().map(|s| s.name).collect()
    }

    pub async fn trigger_oauth_login(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        let record = self.upstreams.record(name)?;
        let base_url = match &record.transport {
            TransportConfig::Http { url, .. } => url.clone(),
            TransportConfig::Stdio { .. } => return Err(McpProxyError::NotOAuthCapable(name.to_string())),
        };
        let oauth_config = record.oauth.clone().unwrap_or_default();
        let request = LoginRequest {
            server_key: record.server_key.clone(),
            server_name: name.to_string(),
            base_url,
            configured_scopes: oauth_config.scopes,
            extra_params: oauth_config.extra_params,
            resource_metadata_url: None,
            persisted_client_id: oauth_config.client_id,
            persisted_client_secret: oauth_config.client_secret,
            persisted_callback_port: oauth_config.callback_port,
        };
        self.oauth.login(request).await?;
        Ok(())
    }

    pub fn trigger_oauth_logout(&self, name: &str) -> McpProxyResult<()> {
        self.check_writable()?;
        let record = self.upstreams.record(name)?;
        if matches!(record.transport, TransportConfig::Stdio { .. }) {
            return Err(McpProxyError::NotOAuthCapable(name.to_string()));
        }
        self.oauth.logout(&record.server_key)?;
        Ok(())
    }
}

fn apply_map_patch(target: &mut HashMap<String, String>, patch: HashMap<String, Option<String>>) {
    for (k, v) in patch {
        match v {
            Some(value) => {
                target.insert(k, value);
            }
            None => {
                target.remove(&k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_storage::Storage;

    fn service() -> (tempfile::TempDir, ManagementService) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage.clone(), events.clone());
        let upstreams = Arc::new(UpstreamManager::new(
            storage,
            events.clone(),
            oauth.clone(),
            dir.path().join("logs"),
            dir.path().join("containers"),
            "docker".to_string(),
        ));
        (dir, ManagementService::new(upstreams, oauth, events, false, false))
    }

    #[tokio::test]
    async fn patch_server_rejects_name_change() {
        let (_dir, service) = service();
        service
            .add_server(
                "x",
                TransportConfig::Http {
                    url: "http://u/".to_string(),
                    headers: Default::default(),
                    mode: "auto".to_string(),
                },
                None,
                None,
                false,
            )
            .await
            .unwrap();
        let patch = ServerPatch {
            name: Some("y".to_string()),
            ..Default::default()
        };
        let err = service.patch_server("x", patch).unwrap_err();
        assert!(matches!(err, McpProxyError::ImmutableField { .. }));
    }

    #[tokio::test]
    async fn empty_patch_changes_nothing_but_updated_timestamp() {
        let (_dir, service) = service();
        service
            .add_server(
                "x",
                TransportConfig::Http {
                    url: "http://u/".to_string(),
                    headers: Default::default(),
                    mode: "auto".to_string(),
                },
                None,
                None,
                false,
            )
            .await
            .unwrap();
        let diff = service.patch_server("x", ServerPatch::default()).unwrap();
        assert!(diff.changed_fields.is_empty());
    }

    #[tokio::test]
    async fn env_patch_deep_merges_preserving_other_keys() {
        let (_dir, service) = service();
        service
            .add_server(
                "x",
                TransportConfig::Stdio {
                    command: "uvx".to_string(),
                    args: vec![],
                    env: HashMap::from([("A".to_string(), "1".to_string())]),
                    working_dir: None,
                },
                None,
                Some(IsolationConfig {
                    enabled: true,
                    image: Some("python:3.11".to_string()),
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();

        let mut env_patch = HashMap::new();
        env_patch.insert("B".to_string(), Some("2".to_string()));
        let patch = ServerPatch {
            enabled: Some(false),
            env: Some(env_patch),
            ..Default::default()
        };
        service.patch_server("x", patch).unwrap();

        let record = service.upstreams.record("x").unwrap();
        assert!(!record.enabled);
        assert_eq!(record.isolation.unwrap().image.as_deref(), Some("python:3.11"));
        if let TransportConfig::Stdio { env, .. } = record.transport {
            assert_eq!(env.get("A").map(String::as_str), Some("1"));
            assert_eq!(env.get("B").map(String::as_str), Some("2"));
        } else {
            panic!("expected stdio transport");
        }
    }

    /// spec §8 scenario 3: a PATCH that only touches `enabled` and `env`
    /// must leave `isolation`'s other fields (`image`) untouched even though
    /// the wire body names `isolation` at all (here via a partial
    /// `IsolationPatch` that only sets `enabled`).
    #[tokio::test]
    async fn isolation_patch_deep_merges_preserving_image() {
        let (_dir, service) = service();
        service
            .add_server(
                "x",
                TransportConfig::Stdio {
                    command: "uvx".to_string(),
                    args: vec![],
                    env: HashMap::from([("A".to_string(), "1".to_string())]),
                    working_dir: None,
                },
                None,
                Some(IsolationConfig {
                    enabled: true,
                    image: Some("python:3.11".to_string()),
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();

        let body = serde_json::json!({
            "enabled": false,
            "env": {"B": "2"},
            "isolation": {"enabled": false}
        });
        let patch: ServerPatch = serde_json::from_value(body).unwrap();
        service.patch_server("x", patch).unwrap();

        let record = service.upstreams.record("x").unwrap();
        assert!(!record.enabled);
        let isolation = record.isolation.unwrap();
        assert!(!isolation.enabled);
        assert_eq!(isolation.image.as_deref(), Some("python:3.11"));
        if let TransportConfig::Stdio { env, .. } = record.transport {
            assert_eq!(env.get("A").map(String::as_str), Some("1"));
            assert_eq!(env.get("B").map(String::as_str), Some("2"));
        } else {
            panic!("expected stdio transport");
        }
    }

    /// An explicit `null` for a substructure removes it wholesale, while an
    /// explicit `null` for one of its scalar fields clears just that field.
    #[tokio::test]
    async fn isolation_patch_null_removes_whole_substructure() {
        let (_dir, service) = service();
        service
            .add_server(
                "x",
                TransportConfig::Http {
                    url: "http://u/".to_string(),
                    headers: Default::default(),
                    mode: "auto".to_string(),
                },
                None,
                Some(IsolationConfig {
                    enabled: true,
                    image: Some("python:3.11".to_string()),
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();

        let patch: ServerPatch = serde_json::from_value(serde_json::json!({ "isolation": null })).unwrap();
        service.patch_server("x", patch).unwrap();
        assert!(service.upstreams.record("x").unwrap().isolation.is_none());
    }

    #[tokio::test]
    async fn isolation_patch_null_field_clears_just_that_field() {
        let (_dir, service) = service();
        service
            .add_server(
                "x",
                TransportConfig::Http {
                    url: "http://u/".to_string(),
                    headers: Default::default(),
                    mode: "auto".to_string(),
                },
                None,
                Some(IsolationConfig {
                    enabled: true,
                    image: Some("python:3.11".to_string()),
                    ..Default::default()
                }),
                false,
            )
            .await
            .unwrap();

        let patch: ServerPatch =
            serde_json::from_value(serde_json::json!({ "isolation": {"image": null} })).unwrap();
        service.patch_server("x", patch).unwrap();

        let isolation = service.upstreams.record("x").unwrap().isolation.unwrap();
        assert!(isolation.enabled);
        assert!(isolation.image.is_none());
    }

    #[tokio::test]
    async fn disabled_management_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage.clone(), events.clone());
        let upstreams = Arc::new(UpstreamManager::new(
            storage,
            events.clone(),
            oauth.clone(),
            dir.path().join("logs"),
            dir.path().join("containers"),
            "docker".to_string(),
        ));
        let service = ManagementService::new(upstreams, oauth, events, true, false);
        let err = service
            .add_server(
                "x",
                TransportConfig::Http {
                    url: "http://u/".to_string(),
                    headers: Default::default(),
                    mode: "auto".to_string(),
                },
                None,
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, McpProxyError::ManagementRefused(_)));
    }
}
