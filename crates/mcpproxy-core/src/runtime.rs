//! Runtime (spec §2, §9): the top-level object that owns storage, the event
//! bus, the OAuth manager and refresh scheduler, the upstream manager, the
//! tool indexer and router, and the management service — plus config
//! hot-reload. Grounded on `turbomcp-proxy::runtime`'s builder-then-own
//! shape, generalized from "one backend" to the whole proxy.
//!
//! Ownership is a strict unidirectional chain (DESIGN NOTES §9): `Runtime`
//! owns everything below it; nothing below holds a back-reference to
//! `Runtime` itself, only a shared `EventBus` handle.

use std::path::PathBuf;
use std::sync::Arc;

use mcpproxy_events::{Event, EventBus};
use mcpproxy_oauth::{OAuthManager, RefreshScheduler};
use mcpproxy_search::ToolIndex;
use mcpproxy_storage::Storage;
use notify::{RecommendedWatcher, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{McpProxyError, McpProxyResult};
use crate::indexer::Indexer;
use crate::management::ManagementService;
use crate::router::ToolRouter;
use crate::upstream::UpstreamManager;

/// Everything the proxy needs to run, built once at startup and torn down
/// in reverse order on shutdown (DESIGN NOTES §9's "process-wide state").
pub struct Runtime {
    config_path: PathBuf,
    config: RwLock<AppConfig>,
    storage: Storage,
    events: EventBus,
    oauth: OAuthManager,
    refresh: RefreshScheduler,
    upstreams: Arc<UpstreamManager>,
    indexer: Arc<Indexer>,
    router: Arc<ToolRouter>,
    management: Arc<ManagementService>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Runtime {
    /// Load config, open storage, and wire every component together without
    /// starting any upstream connections yet. Split from `start()` so a
    /// caller (e.g. the CLI's `inspect`-style commands, or tests) can build
    /// a `Runtime` without spinning up background tasks. Async only because
    /// seeding config-file servers goes through the same storage/event path
    /// as a runtime `add_server` call.
    pub async fn bootstrap(config_path: PathBuf) -> McpProxyResult<Arc<Self>> {
        let default_data_dir = config_path
            .parent()
            .map(|p| p.join("data"))
            .unwrap_or_else(|| PathBuf::from("data"));
        let config = AppConfig::load_or_init(&config_path, default_data_dir)?;
        config.validate()?;

        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| McpProxyError::Config(format!("failed to create data dir: {e}")))?;
        std::fs::create_dir_all(config.logs_dir())
            .map_err(|e| McpProxyError::Config(format!("failed to create logs dir: {e}")))?;

        let storage = Storage::open(config.db_dir())?;
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage.clone(), events.clone());
        let refresh = RefreshScheduler::with_threshold(Arc::new(oauth.clone()), config.oauth_refresh_threshold);

        let upstreams = Arc::new(UpstreamManager::new(
            storage.clone(),
            events.clone(),
            oauth.clone(),
            config.logs_dir(),
            config.containers_dir(),
            config.container_runtime.clone(),
        ));
        upstreams.load_from_storage()?;
        seed_servers_from_config(&upstreams, &config).await?;

        let index = Arc::new(Mutex::new(ToolIndex::new()));
        let indexer = Arc::new(Indexer::new(storage.clone(), index.clone(), config.index_dir()));
        indexer.rebuild_from_storage()?;

        let router = Arc::new(
            ToolRouter::new(upstreams.clone(), index, storage.clone())
                .with_response_limit(config.tool_response_limit)
                .with_tools_limit(config.tools_limit),
        );

        let management = Arc::new(ManagementService::new(
            upstreams.clone(),
            oauth.clone(),
            events.clone(),
            config.disable_management,
            config.read_only_mode,
        ));

        Ok(Arc::new(Self {
            config_path,
            config: RwLock::new(config),
            storage,
            events,
            oauth,
            refresh,
            upstreams,
            indexer,
            router,
            management,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            _watcher: Mutex::new(None),
        }))
    }

    /// Start background tasks: config hot-reload, tool-index reconciliation,
    /// the proactive OAuth refresh scheduler, and every upstream marked
    /// `enabled` in storage.
    pub async fn start(self: &Arc<Self>) -> McpProxyResult<()> {
        self.arm_refresh_scheduler().await;
        self.spawn_index_sync_task();
        self.spawn_oauth_refresh_sync_task();
        self.spawn_config_watcher()?;

        for snapshot in self.upstreams.snapshot().await {
            if snapshot.enabled {
                self.upstreams.enable_server(&snapshot.name).await?;
            }
        }

        self.storage.append_activity(&system_activity("system_start"))?;
        info!(listen_addr = %self.config.read().listen_addr, "runtime started");
        Ok(())
    }

    async fn arm_refresh_scheduler(&self) {
        let tokens = match self.storage.list_tokens() {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "failed to load persisted OAuth tokens");
                return;
            }
        };
        let mut base_urls = Vec::new();
        for token in &tokens {
            let Ok(Some(record)) = self.storage.get_server(&token.server_key) else {
                continue;
            };
            if let mcpproxy_storage::model::TransportConfig::Http { url, .. } = &record.transport {
                base_urls.push(url.clone());
            } else {
                base_urls.push(String::new());
            }
        }
        let pairs = base_urls.iter().map(String::as_str).zip(tokens.iter());
        self.refresh.arm_all(pairs);
    }

    /// Subscribe to the event bus and reconcile the tool index whenever an
    /// upstream transitions to (or away from) `Ready` (spec §4.4).
    fn spawn_index_sync_task(self: &Arc<Self>) {
        let this = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut subscriber = this.events.subscribe();
            let mut was_ready: std::collections::HashMap<String, bool> = std::collections::HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = subscriber.recv() => {
                        let Some(envelope) = event else { return };
                        if let Event::ServersChanged { server_name } = envelope.event {
                            this.reconcile_one(&server_name, &mut was_ready).await;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Subscribe to the event bus and keep the proactive refresh scheduler
    /// in sync with `OAuthManager`'s token lifecycle (spec §4.5: "token-save
    /// hook re-arms; token-clear hook disarms"). `OAuthManager` publishes
    /// rather than holding a direct handle to `refresh` so the two don't
    /// form a reference cycle (DESIGN NOTES §9).
    fn spawn_oauth_refresh_sync_task(self: &Arc<Self>) {
        let this = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut subscriber = this.events.subscribe();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = subscriber.recv() => {
                        let Some(envelope) = event else { return };
                        match envelope.event {
                            Event::OAuthTokenSaved { server_key, base_url } => {
                                match this.storage.get_token(&server_key) {
                                    Ok(Some(record)) => this.refresh.arm(&server_key, &base_url, &record),
                                    Ok(None) => {}
                                    Err(e) => warn!(error = %e, server_key, "failed to load token to arm refresh"),
                                }
                            }
                            Event::OAuthTokenCleared { server_key } => {
                                this.refresh.disarm(&server_key);
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn reconcile_one(&self, server_name: &str, was_ready: &mut std::collections::HashMap<String, bool>) {
        let Some(client) = self.upstreams.resolve(server_name) else {
            self.indexer.purge_server(server_name);
            was_ready.remove(server_name);
            return;
        };
        let now_ready = client.is_ready().await;
        let previously_ready = was_ready.get(server_name).copied().unwrap_or(false);
        if now_ready && !previously_ready {
            self.indexer.reconcile_or_warn(server_name, &client).await;
        } else if !now_ready && previously_ready {
            self.indexer.purge_server(server_name);
        }
        was_ready.insert(server_name.to_string(), now_ready);
    }

    /// Watch the config file for changes and hot-reload the knobs that can
    /// safely change at runtime (spec §6): response/tools limits, the
    /// management gates, and the OAuth refresh threshold for newly armed
    /// timers. Listen address and data dir require a restart.
    fn spawn_config_watcher(self: &Arc<Self>) -> McpProxyResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| McpProxyError::Internal(format!("failed to start config watcher: {e}")))?;
        watcher
            .watch(&self.config_path, notify::RecursiveMode::NonRecursive)
            .map_err(|e| McpProxyError::Internal(format!("failed to watch config file: {e}")))?;
        *self._watcher.lock() = Some(watcher);

        let this = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    signal = rx.recv() => {
                        if signal.is_none() {
                            return;
                        }
                        this.reload_config().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn reload_config(&self) {
        let reloaded = match AppConfig::load_or_init(&self.config_path, self.config.read().data_dir.clone()) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "config reload failed, keeping previous config");
                return;
            }
        };
        if let Err(e) = reloaded.validate() {
            error!(error = %e, "reloaded config failed validation, keeping previous config");
            return;
        }

        self.router.set_response_limit(reloaded.tool_response_limit);
        self.router.set_tools_limit(reloaded.tools_limit);
        self.management.set_gates(reloaded.disable_management, reloaded.read_only_mode);

        *self.config.write() = reloaded;
        self.events.publish(Event::ConfigReloaded);
        info!("config reloaded");
    }

    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn oauth(&self) -> &OAuthManager {
        &self.oauth
    }

    pub fn upstreams(&self) -> &Arc<UpstreamManager> {
        &self.upstreams
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    pub fn management(&self) -> &Arc<ManagementService> {
        &self.management
    }

    /// Cancel every background task, stop every upstream, flush storage.
    /// Callers should bound this with the 10-second shutdown budget spec §5
    /// names; the subprocess/container teardown inside `UpstreamManager`
    /// already enforces its own per-client budget.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.upstreams.shutdown().await;
        if let Err(e) = self.storage.append_activity(&system_activity("system_stop")) {
            warn!(error = %e, "failed to record shutdown activity");
        }
        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "failed to flush storage on shutdown");
        }
        info!("runtime shut down");
    }
}

async fn seed_servers_from_config(upstreams: &UpstreamManager, config: &AppConfig) -> McpProxyResult<()> {
    for seed in &config.servers {
        if upstreams.resolve(&seed.name).is_some() {
            continue;
        }
        upstreams
            .add_server(
                &seed.name,
                seed.transport.clone(),
                seed.oauth.clone(),
                seed.isolation.clone(),
                seed.quarantined,
            )
            .await?;
        if seed.enabled {
            upstreams.enable_server(&seed.name).await?;
        }
    }
    Ok(())
}

fn system_activity(status: &str) -> mcpproxy_storage::model::ActivityRecord {
    mcpproxy_storage::model::ActivityRecord {
        id: ulid::Ulid::new().to_string(),
        kind: mcpproxy_storage::model::ActivityType::SystemStart,
        source: "runtime".to_string(),
        server_name: None,
        tool_name: None,
        arguments: None,
        response: None,
        status: status.to_string(),
        error_message: None,
        duration_ms: 0,
        timestamp: chrono::Utc::now(),
        session_id: None,
        request_id: None,
        metadata: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("config.json")
    }

    #[tokio::test]
    async fn bootstrap_creates_data_dir_and_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(&dir);
        let runtime = Runtime::bootstrap(path.clone()).await.unwrap();
        assert!(path.exists());
        assert!(runtime.config().data_dir.exists());
    }

    #[tokio::test]
    async fn start_and_shutdown_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(&dir);
        let runtime = Runtime::bootstrap(path).await.unwrap();
        runtime.start().await.unwrap();
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn seeded_servers_are_materialized_quarantined_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(&dir);
        let mut config = AppConfig::load_or_init(&path, dir.path().join("data")).unwrap();
        config.servers.push(crate::config::SeedServerConfig {
            name: "seeded".to_string(),
            transport: mcpproxy_storage::model::TransportConfig::Http {
                url: "http://u/".to_string(),
                headers: Default::default(),
                mode: "auto".to_string(),
            },
            enabled: false,
            quarantined: true,
            oauth: None,
            isolation: None,
        });
        config.save(&path).unwrap();

        let runtime = Runtime::bootstrap(path).await.unwrap();
        assert!(runtime.upstreams().resolve("seeded").is_some());
        assert!(runtime.upstreams().is_quarantined("seeded"));
    }
}
