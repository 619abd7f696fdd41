//! `ManagedClient`: the production wrapper around a stateless Core Client
//! (spec §4.2). Owns the connection state machine, retry/backoff, OAuth
//! integration, optional container isolation, and the per-upstream log
//! sink. One `ManagedClient` per upstream; the Upstream Manager owns the
//! registry of them (spec §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mcpproxy_events::{Event, EventBus};
use mcpproxy_oauth::{LoginRequest, OAuthManager};
use mcpproxy_protocol::{CallToolResult, Error, ErrorKind, InitializeParams, RawTool, Result};
use mcpproxy_storage::model::{IsolationConfig, OAuthServerConfig, TransportConfig};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use super::container;
use super::log_sink::LogSink;
use super::state::{transition, ConnectionInfo, ConnectionState, Effect, StateEvent};
use crate::core::{CoreClient, SseCoreClient, StdioCoreClient, StreamableHttpCoreClient, Transport};

/// Per-call deadline applied when no caller-specific timeout is given.
const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the initialize handshake itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Budget components get to drain on shutdown before being force-killed.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

pub struct ManagedClientConfig {
    pub server_key: String,
    pub server_name: String,
    pub transport: TransportConfig,
    pub oauth: Option<OAuthServerConfig>,
    pub isolation: Option<IsolationConfig>,
    pub logs_dir: PathBuf,
    pub containers_dir: PathBuf,
    /// `docker` or `podman`; only consulted when isolation is enabled.
    pub container_runtime: String,
}

pub struct ManagedClient {
    config: SyncRwLock<ManagedClientConfig>,
    state: Arc<RwLock<ConnectionInfo>>,
    core: Arc<RwLock<Option<CoreClient>>>,
    backoff: Mutex<BackoffPolicy>,
    log_sink: Arc<LogSink>,
    events: EventBus,
    oauth: OAuthManager,
    cancel: SyncRwLock<CancellationToken>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    call_counts: DashMap<String, u64>,
    next_request_seq: AtomicU64,
}

impl ManagedClient {
    pub fn new(config: ManagedClientConfig, events: EventBus, oauth: OAuthManager) -> std::io::Result<Arc<Self>> {
        let log_sink = Arc::new(LogSink::open(&config.logs_dir, &config.server_name)?);
        Ok(Arc::new(Self {
            config: SyncRwLock::new(config),
            state: Arc::new(RwLock::new(ConnectionInfo::default())),
            core: Arc::new(RwLock::new(None)),
            backoff: Mutex::new(BackoffPolicy::new()),
            log_sink,
            events,
            oauth,
            cancel: SyncRwLock::new(CancellationToken::new()),
            supervisor: Mutex::new(None),
            call_counts: DashMap::new(),
            next_request_seq: AtomicU64::new(1),
        }))
    }

    pub fn server_name(&self) -> String {
        self.config.read().server_name.clone()
    }

    pub fn server_key(&self) -> String {
        self.config.read().server_key.clone()
    }

    pub async fn connection_info(&self) -> ConnectionInfo {
        self.state.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.state.read().await.is_ready()
    }

    pub fn call_count(&self, tool_name: &str) -> u64 {
        self.call_counts.get(tool_name).map(|c| *c).unwrap_or(0)
    }

    /// Start (or restart) the connection supervisor loop. Idempotent: a
    /// second `enable` while already running is a no-op event feed, not a
    /// duplicate task (spec §4.2's `Disconnected --enable--> Connecting`).
    pub async fn enable(self: &Arc<Self>) {
        self.feed_event(StateEvent::Enable).await;
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }
        *self.cancel.write() = CancellationToken::new();
        let this = self.clone();
        *supervisor = Some(tokio::spawn(async move { this.supervisor_loop().await }));
    }

    /// Stop the connection: cancels the supervisor, tears down the
    /// transport and any container, and returns to `Disconnected`.
    pub async fn disable(self: &Arc<Self>) {
        self.cancel.read().cancel();
        self.feed_event(StateEvent::Disable).await;
        self.teardown_transport().await;
        if let Some(task) = self.supervisor.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_BUDGET, task).await;
        }
    }

    /// Stop then start, resetting the backoff counter but preserving OAuth
    /// credentials (which live in storage, untouched by this call).
    pub async fn restart(self: &Arc<Self>) {
        self.disable().await;
        self.backoff.lock().await.reset();
        self.enable().await;
    }

    pub async fn list_tools(&self) -> Result<Vec<RawTool>> {
        let guard = self.core.read().await;
        let core = guard
            .as_ref()
            .ok_or_else(|| Error::canceled("upstream is not connected"))?;
        core.list_tools().await
    }

    /// Dispatch a tool call with a per-call deadline, logging request and
    /// response to the per-upstream sink and tracking the per-tool call
    /// count (spec §4.4).
    pub async fn call_tool(
        &self,
        original_name: &str,
        arguments: serde_json::Value,
        deadline: Option<Duration>,
    ) -> Result<CallToolResult> {
        let request_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();
        self.log_sink.request(&request_id, original_name).await;

        let guard = self.core.read().await;
        let core = match guard.as_ref() {
            Some(core) => core,
            None => {
                self.log_sink.response(&request_id, 0, "not_connected").await;
                return Err(Error::canceled("upstream is not connected"));
            }
        };

        let timeout = deadline.unwrap_or(DEFAULT_TOOL_CALL_TIMEOUT);
        let result = tokio::time::timeout(timeout, core.call_tool(original_name, arguments)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(value)) => {
                self.log_sink.response(&request_id, duration_ms, "ok").await;
                *self.call_counts.entry(original_name.to_string()).or_insert(0) += 1;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.log_sink.response(&request_id, duration_ms, "error").await;
                if e.kind == ErrorKind::Unauthorized {
                    self.feed_event(StateEvent::Unauthorized {
                        resource_metadata_url: e.resource_metadata_url.clone(),
                    })
                    .await;
                }
                Err(e)
            }
            Err(_) => {
                self.log_sink.response(&request_id, duration_ms, "timeout").await;
                Err(Error::timeout(format!("{original_name} exceeded its {timeout:?} deadline")))
            }
        }
    }

    async fn feed_event(&self, event: StateEvent) {
        let mut state = self.state.write().await;
        let (next, effects) = transition(state.state, &event);
        let from = state.state;
        if let StateEvent::Error { message } = &event {
            state.last_error = Some(message.clone());
        }
        if let StateEvent::Unauthorized { .. } = &event {
            state.is_oauth_error = true;
        }
        state.state = next;
        drop(state);

        if from != next {
            self.log_sink.state_transition(state_name(from), state_name(next)).await;
            self.events.publish(Event::ServersChanged {
                server_name: self.server_name(),
            });
        }

        for effect in effects {
            self.apply_effect(effect).await;
        }
    }

    async fn apply_effect(&self, effect: Effect) {
        match effect {
            Effect::ResetRetryCounter => self.backoff.lock().await.reset(),
            Effect::TeardownTransport => self.teardown_transport().await,
            Effect::ScheduleRetry { .. } | Effect::StartConnecting | Effect::StartOAuthFlow { .. } => {
                // Carried out by `supervisor_loop`'s own control flow, which
                // already knows the current state; these effects exist so
                // unit tests over `transition` can assert on them without a
                // live supervisor.
            }
        }
    }

    async fn teardown_transport(&self) {
        let mut guard = self.core.write().await;
        if let Some(core) = guard.take() {
            let _ = core.close().await;
        }
    }

    /// The supervisor loop: connect, handshake, and on failure either start
    /// an OAuth flow (401) or retry with backoff, until canceled.
    async fn supervisor_loop(self: Arc<Self>) {
        let cancel = self.cancel.read().clone();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_and_handshake().await {
                Ok(()) => {
                    self.feed_event(StateEvent::HandshakeOk).await;
                    info!(server = %self.server_name(), "upstream ready");
                    return self.await_disconnect_or_cancel(cancel).await;
                }
                Err(e) if e.kind == ErrorKind::Unauthorized => {
                    self.feed_event(StateEvent::Unauthorized {
                        resource_metadata_url: e.resource_metadata_url.clone(),
                    })
                    .await;
                    match self.run_oauth_flow(e.resource_metadata_url.clone()).await {
                        Ok(()) => {
                            self.feed_event(StateEvent::TokenAcquired).await;
                            continue;
                        }
                        Err(e) => {
                            warn!(server = %self.server_name(), error = %e, "OAuth login failed");
                            self.feed_event(StateEvent::Error { message: e.to_string() }).await;
                        }
                    }
                }
                Err(e) => {
                    error!(server = %self.server_name(), error = %e, "connect failed");
                    self.feed_event(StateEvent::Error { message: e.to_string() }).await;
                }
            }

            let delay = self.backoff.lock().await.next_delay();
            let mut info = self.state.write().await;
            info.retry_count += 1;
            info.last_retry_at = Some(chrono::Utc::now());
            drop(info);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Once `Ready`, the supervisor has nothing more to do until the
    /// transport itself reports an error (surfaced through `call_tool`'s
    /// `Unauthorized`/connection-closed handling) or the owner cancels.
    async fn await_disconnect_or_cancel(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }

    async fn connect_and_handshake(&self) -> Result<()> {
        let core = self.build_core_client().await?;
        let params = InitializeParams::new("mcpproxy", env!("CARGO_PKG_VERSION"));
        tokio::time::timeout(HANDSHAKE_TIMEOUT, core.initialize(params))
            .await
            .map_err(|_| Error::timeout("initialize handshake timed out"))??;
        *self.core.write().await = Some(core);
        Ok(())
    }

    async fn build_core_client(&self) -> Result<CoreClient> {
        let transport = self.config.read().transport.clone();
        let server_name = self.server_name();
        match transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                working_dir,
            } => {
                let isolation = self.config.read().isolation.clone();
                if let Some(isolation) = isolation.filter(|i| i.enabled) {
                    if container::is_already_containerized(&command) {
                        debug!(server = %server_name, "command is already a container runtime; skipping isolation");
                    } else {
                        let runtime_binary = self.config.read().container_runtime.clone();
                        let containers_dir = self.config.read().containers_dir.clone();
                        let launch = container::build_launch(
                            &isolation,
                            &runtime_binary,
                            &command,
                            &args,
                            &env,
                            working_dir.as_deref(),
                            &containers_dir,
                            &self.server_key(),
                        );
                        let client = StdioCoreClient::spawn(
                            &launch.runtime,
                            &launch.args,
                            &HashMap::new(),
                            None,
                            server_name,
                        )
                        .await?;
                        return Ok(CoreClient::Stdio(client));
                    }
                }
                let client = StdioCoreClient::spawn(&command, &args, &env, working_dir.as_deref(), server_name).await?;
                Ok(CoreClient::Stdio(client))
            }
            TransportConfig::Http { url, headers, mode } => {
                let headers = self.with_bearer_token(headers).await;
                match mode.as_str() {
                    "sse" => Ok(CoreClient::Sse(SseCoreClient::new(url, &headers, server_name)?)),
                    "streamable-http" => Ok(CoreClient::StreamableHttp(StreamableHttpCoreClient::new(
                        url, &headers, server_name,
                    )?)),
                    _ => self.probe_auto(url, headers, server_name).await,
                }
            }
        }
    }

    /// `auto` transport resolution (spec §4.1): try streamable-http first,
    /// fall back to sse on a 404/405 surfaced as a transport error.
    async fn probe_auto(
        &self,
        url: String,
        headers: HashMap<String, String>,
        server_name: String,
    ) -> Result<CoreClient> {
        let http_client = StreamableHttpCoreClient::new(url.clone(), &headers, server_name.clone())?;
        match http_client.list_tools().await {
            Ok(_) | Err(Error { kind: ErrorKind::Unauthorized, .. }) => Ok(CoreClient::StreamableHttp(http_client)),
            Err(e) if e.kind == ErrorKind::Transport => {
                debug!(server = %server_name, "streamable-http probe failed, falling back to sse");
                Ok(CoreClient::Sse(SseCoreClient::new(url, &headers, server_name)?))
            }
            Err(_) => Ok(CoreClient::StreamableHttp(http_client)),
        }
    }

    /// Merge a persisted OAuth access token (if any) into outbound headers.
    async fn with_bearer_token(&self, mut headers: HashMap<String, String>) -> HashMap<String, String> {
        if let Ok(Some(token)) = self.oauth.storage().get_token(&self.server_key()) {
            if !token.is_expired(chrono::Utc::now()) {
                headers.insert("Authorization".to_string(), format!("Bearer {}", token.access_token));
            }
        }
        headers
    }

    async fn run_oauth_flow(&self, resource_metadata_url: Option<String>) -> mcpproxy_oauth::OAuthResult<()> {
        let (oauth_config, base_url) = {
            let config = self.config.read();
            let base_url = match &config.transport {
                TransportConfig::Http { url, .. } => url.clone(),
                TransportConfig::Stdio { .. } => {
                    return Err(mcpproxy_oauth::OAuthError::NotOAuthCapable(config.server_name.clone()))
                }
            };
            (config.oauth.clone().unwrap_or_default(), base_url)
        };

        let request = LoginRequest {
            server_key: self.server_key(),
            server_name: self.server_name(),
            base_url,
            configured_scopes: oauth_config.scopes,
            extra_params: oauth_config.extra_params,
            resource_metadata_url,
            persisted_client_id: oauth_config.client_id,
            persisted_client_secret: oauth_config.client_secret,
            persisted_callback_port: oauth_config.callback_port,
        };
        self.oauth.login(request).await?;
        Ok(())
    }
}

fn state_name(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Authenticating => "authenticating",
        ConnectionState::Ready => "ready",
        ConnectionState::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_storage::Storage;

    fn test_config(tempdir: &tempfile::TempDir, server_key: &str) -> ManagedClientConfig {
        ManagedClientConfig {
            server_key: server_key.to_string(),
            server_name: server_key.to_string(),
            transport: TransportConfig::Http {
                url: "http://127.0.0.1:1/mcp".to_string(),
                headers: HashMap::new(),
                mode: "streamable-http".to_string(),
            },
            oauth: None,
            isolation: None,
            logs_dir: tempdir.path().join("logs"),
            containers_dir: tempdir.path().join("containers"),
            container_runtime: "docker".to_string(),
        }
    }

    #[tokio::test]
    async fn starts_disconnected_and_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage, events.clone());
        let client = ManagedClient::new(test_config(&dir, "s1"), events, oauth).unwrap();
        assert!(!client.is_ready().await);
        assert_eq!(client.connection_info().await.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disable_before_enable_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage, events.clone());
        let client = ManagedClient::new(test_config(&dir, "s1"), events, oauth).unwrap();
        client.disable().await;
        assert_eq!(client.connection_info().await.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn call_tool_without_connection_is_canceled_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage, events.clone());
        let client = ManagedClient::new(test_config(&dir, "s1"), events, oauth).unwrap();
        let err = client.call_tool("echo", serde_json::json!({}), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Canceled);
    }
}
