//! `OAuthManager`: ties discovery, DCR, PKCE, the loopback callback server,
//! the per-server flow coordinator, and persisted tokens into the single
//! entry point the rest of the proxy (managed client, management service)
//! calls into. Grounded in shape on
//! `zed-industries-codex`'s `perform_oauth_login.rs` flow-object pattern,
//! adapted to axum for the loopback listener per SPEC_FULL §4.5.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use mcpproxy_events::{Event, EventBus};
use mcpproxy_storage::{OAuthTokenRecord, Storage};
use tracing::{info, warn};

use crate::callback::CallbackServer;
use crate::discovery::DiscoveryClient;
use crate::error::{OAuthError, OAuthResult};
use crate::flow::FlowCoordinator;
use crate::pkce::{generate_state, PkcePair};
use crate::token::{self, resolve_resource};

/// How long a login attempt waits for the user to complete the browser flow.
const BROWSER_AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the manager needs to know about one login attempt. Callers
/// build this from an `UpstreamServerRecord` plus, for automatic 401-driven
/// flows, the `resource_metadata` URL parsed from `WWW-Authenticate`.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub server_key: String,
    pub server_name: String,
    pub base_url: String,
    pub configured_scopes: Vec<String>,
    pub extra_params: HashMap<String, String>,
    pub resource_metadata_url: Option<String>,
    pub persisted_client_id: Option<String>,
    pub persisted_client_secret: Option<String>,
    pub persisted_callback_port: u16,
}

#[derive(Clone)]
pub struct OAuthManager {
    storage: Storage,
    events: EventBus,
    discovery: DiscoveryClient,
    flows: FlowCoordinator,
    http: reqwest::Client,
}

impl OAuthManager {
    pub fn new(storage: Storage, events: EventBus) -> Self {
        Self {
            storage,
            events,
            discovery: DiscoveryClient::new(),
            flows: FlowCoordinator::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn flow_coordinator(&self) -> &FlowCoordinator {
        &self.flows
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Run one full interactive login: resolve scopes/resource, DCR if
    /// needed, open the browser, await the callback, exchange the code,
    /// and persist the resulting token record.
    pub async fn login(&self, req: LoginRequest) -> OAuthResult<OAuthTokenRecord> {
        let Some(_guard) = self.flows.start_flow(&req.server_key) else {
            return Err(OAuthError::Flow(format!(
                "an OAuth login for {} is already in progress",
                req.server_name
            )));
        };

        let asm = self
            .discovery
            .fetch_authorization_server_metadata(&req.base_url)
            .await
            .ok_or_else(|| {
                OAuthError::Discovery(format!(
                    "no authorization server metadata for {}",
                    req.base_url
                ))
            })?;

        let resolved = self
            .discovery
            .resolve_auth_params(
                &req.configured_scopes,
                req.resource_metadata_url.as_deref(),
                &req.base_url,
            )
            .await;
        let resource = resolve_resource(resolved.resource.as_deref(), &req.extra_params);

        let (client_id, client_secret, callback_port) =
            self.resolve_client_credentials(&req, &asm).await?;

        let callback = CallbackServer::bind(callback_port).await?;
        if callback_port != 0 && callback.port != callback_port {
            warn!(
                server = %req.server_name,
                "callback port changed after bind; this should not happen for an explicit port"
            );
        }
        let redirect_uri = callback.redirect_uri();

        let pkce = PkcePair::generate();
        let state = generate_state();
        let auth_url = build_authorization_url(
            &asm.authorization_endpoint,
            &client_id,
            &redirect_uri,
            &resolved.scopes,
            &state,
            &pkce.challenge,
            resource.as_deref(),
            &req.extra_params,
        )?;

        info!(server = %req.server_name, %auth_url, "opening browser for OAuth authorization");
        if webbrowser::open(&auth_url).is_err() {
            warn!(server = %req.server_name, "failed to launch browser; authorize manually at the URL above");
        }

        let (code, returned_state) = callback.wait_for_callback(BROWSER_AUTH_TIMEOUT).await?;
        if returned_state != state {
            return Err(OAuthError::Flow("state mismatch on OAuth callback (possible CSRF)".into()));
        }

        let token_response = token::exchange_code(
            &self.http,
            &asm.token_endpoint,
            &code,
            &redirect_uri,
            &client_id,
            client_secret.as_deref(),
            &pkce.verifier,
            resource.as_deref(),
            &req.extra_params,
        )
        .await?;

        let now = Utc::now();
        let record = OAuthTokenRecord {
            server_key: req.server_key.clone(),
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            token_type: token_response.token_type,
            expires_at: now
                + chrono::Duration::seconds(token_response.expires_in.unwrap_or(3600)),
            scopes: if token_response.scope.is_some() {
                token_response.scopes()
            } else {
                resolved.scopes
            },
            created: now,
            updated: now,
            client_id: Some(client_id),
            client_secret,
            callback_port: Some(callback.port),
            redirect_uri: Some(redirect_uri),
        };
        self.storage.put_token(&record)?;
        // The proactive refresh scheduler lives on `Runtime`, not here (a
        // scheduler holding this manager as its `TokenRefresher` plus this
        // manager holding the scheduler back would be a reference cycle);
        // it re-arms itself by subscribing to this event instead, per
        // spec §4.5's "token-save hook re-arms."
        self.events.publish(Event::OAuthTokenSaved {
            server_key: record.server_key.clone(),
            base_url: req.base_url.clone(),
        });
        info!(server = %req.server_name, "OAuth login succeeded");
        Ok(record)
    }

    /// Resolve the client_id/secret to use for this attempt, performing DCR
    /// when no client_id is configured and the server advertises a
    /// registration endpoint. Also implements the port-conflict re-DCR rule:
    /// if the persisted port is non-zero but can't be bound, fall back to a
    /// kernel-chosen port and clear the stored credentials so a fresh DCR
    /// runs against the new (as yet unknown) redirect_uri.
    async fn resolve_client_credentials(
        &self,
        req: &LoginRequest,
        asm: &crate::discovery::AuthorizationServerMetadata,
    ) -> OAuthResult<(String, Option<String>, u16)> {
        let port_available = req.persisted_callback_port == 0
            || port_is_bindable(req.persisted_callback_port).await;

        if !port_available {
            warn!(
                server = %req.server_name,
                port = req.persisted_callback_port,
                "persisted OAuth callback port is in use; falling back to a kernel-chosen port and re-registering"
            );
            self.storage.clear_token(&req.server_key)?;
            let registered = self.register_new_client(req, asm, 0).await?;
            return Ok((registered.client_id, registered.client_secret, 0));
        }

        if let Some(client_id) = &req.persisted_client_id {
            return Ok((
                client_id.clone(),
                req.persisted_client_secret.clone(),
                req.persisted_callback_port,
            ));
        }

        let registered = self
            .register_new_client(req, asm, req.persisted_callback_port)
            .await?;
        Ok((registered.client_id, registered.client_secret, req.persisted_callback_port))
    }

    async fn register_new_client(
        &self,
        req: &LoginRequest,
        asm: &crate::discovery::AuthorizationServerMetadata,
        callback_port: u16,
    ) -> OAuthResult<crate::dcr::RegisteredClient> {
        let registration_endpoint = asm.registration_endpoint.as_deref().ok_or_else(|| {
            OAuthError::Registration(format!(
                "{} does not advertise a registration_endpoint and no client_id is configured",
                req.server_name
            ))
        })?;
        let placeholder_redirect = format!("http://127.0.0.1:{callback_port}/callback");
        crate::dcr::register(&self.http, registration_endpoint, &placeholder_redirect, "mcpproxy").await
    }

    /// Refresh a persisted token via the `refresh_token` grant, rediscovering
    /// the authorization server metadata from `base_url` since the token
    /// record itself doesn't carry a token endpoint.
    pub async fn refresh(&self, server_key: &str, base_url: &str) -> OAuthResult<OAuthTokenRecord> {
        let mut record = self
            .storage
            .get_token(server_key)?
            .ok_or_else(|| OAuthError::Flow(format!("no token on file for {server_key}")))?;
        let refresh_token = record
            .refresh_token
            .clone()
            .ok_or_else(|| OAuthError::Flow(format!("{server_key} has no refresh_token")))?;
        let client_id = record
            .client_id
            .clone()
            .ok_or_else(|| OAuthError::Flow(format!("{server_key} has no client_id on file")))?;

        let asm = self
            .discovery
            .fetch_authorization_server_metadata(base_url)
            .await
            .ok_or_else(|| OAuthError::Discovery(format!("no authorization server metadata for {base_url}")))?;

        let response = token::exchange_refresh_token(
            &self.http,
            &asm.token_endpoint,
            &refresh_token,
            &client_id,
            record.client_secret.as_deref(),
        )
        .await?;

        let now = Utc::now();
        record.access_token = response.access_token;
        if response.refresh_token.is_some() {
            record.refresh_token = response.refresh_token;
        }
        record.token_type = response.token_type;
        record.expires_at = now + chrono::Duration::seconds(response.expires_in.unwrap_or(3600));
        record.updated = now;

        self.storage.put_token(&record)?;
        self.events.publish(Event::OAuthTokenRefreshed {
            server_key: server_key.to_string(),
        });
        Ok(record)
    }

    /// Clear the persisted token for one server.
    pub fn logout(&self, server_key: &str) -> OAuthResult<()> {
        self.storage.clear_token(server_key)?;
        // Disarms the proactive refresh scheduler via the event bus; see
        // the comment in `login` for why this isn't a direct call.
        self.events.publish(Event::OAuthTokenCleared {
            server_key: server_key.to_string(),
        });
        Ok(())
    }

    pub fn emit_refresh_failed(&self, server_key: &str, reason: &str) {
        self.events.publish(Event::OAuthRefreshFailed {
            server_key: server_key.to_string(),
            reason: reason.to_string(),
        });
    }
}

#[async_trait::async_trait]
impl crate::refresh::TokenRefresher for OAuthManager {
    async fn refresh(&self, server_key: &str, base_url: &str) -> OAuthResult<OAuthTokenRecord> {
        OAuthManager::refresh(self, server_key, base_url).await
    }

    fn emit_refresh_failed(&self, server_key: &str, reason: &str) {
        OAuthManager::emit_refresh_failed(self, server_key, reason)
    }

    async fn wait_for_flow(&self, server_key: &str) {
        self.flows.wait_for_flow(server_key).await
    }
}

async fn port_is_bindable(port: u16) -> bool {
    use std::net::{Ipv4Addr, SocketAddr};
    tokio::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .is_ok()
}

#[allow(clippy::too_many_arguments)]
fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    code_challenge: &str,
    resource: Option<&str>,
    extra_params: &HashMap<String, String>,
) -> OAuthResult<String> {
    crate::token::validate_extra_params(extra_params)?;
    let mut url = url::Url::parse(authorization_endpoint)
        .map_err(|e| OAuthError::Flow(format!("invalid authorization_endpoint: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("response_type", "code");
        pairs.append_pair("client_id", client_id);
        pairs.append_pair("redirect_uri", redirect_uri);
        pairs.append_pair("state", state);
        pairs.append_pair("code_challenge", code_challenge);
        pairs.append_pair("code_challenge_method", "S256");
        if !scopes.is_empty() {
            pairs.append_pair("scope", &scopes.join(" "));
        }
        if let Some(resource) = resource {
            pairs.append_pair("resource", resource);
        }
        for (k, v) in extra_params {
            pairs.append_pair(k, v);
        }
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let url = build_authorization_url(
            "https://auth.example/authorize",
            "client1",
            "http://127.0.0.1:4000/callback",
            &["read".to_string(), "write".to_string()],
            "state1",
            "challenge1",
            Some("http://u/api"),
            &HashMap::new(),
        )
        .unwrap();
        assert!(url.contains("client_id=client1"));
        assert!(url.contains("code_challenge=challenge1"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=state1"));
        assert!(url.contains("resource=http%3A%2F%2Fu%2Fapi"));
    }

    #[test]
    fn authorization_url_rejects_reserved_extra_param() {
        let mut extra = HashMap::new();
        extra.insert("client_secret".to_string(), "sneaky".to_string());
        let result = build_authorization_url(
            "https://auth.example/authorize",
            "client1",
            "http://127.0.0.1:4000/callback",
            &[],
            "state1",
            "challenge1",
            None,
            &extra,
        );
        assert!(result.is_err());
    }

    fn sample_token(server_key: &str) -> OAuthTokenRecord {
        let now = Utc::now();
        OAuthTokenRecord {
            server_key: server_key.to_string(),
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: now + chrono::Duration::seconds(3600),
            scopes: vec![],
            created: now,
            updated: now,
            client_id: Some("c".to_string()),
            client_secret: None,
            callback_port: None,
            redirect_uri: None,
        }
    }

    #[tokio::test]
    async fn logout_publishes_token_cleared_for_the_refresh_scheduler_to_pick_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let events = EventBus::new();
        let oauth = OAuthManager::new(storage.clone(), events.clone());
        let mut sub = events.subscribe();

        let record = sample_token("s1");
        storage.put_token(&record).unwrap();
        assert!(oauth.logout("s1").is_ok());
        assert!(storage.get_token("s1").unwrap().is_none());

        let envelope = sub.recv().await.unwrap();
        match envelope.event {
            Event::OAuthTokenCleared { server_key } => assert_eq!(server_key, "s1"),
            other => panic!("expected OAuthTokenCleared, got {other:?}"),
        }
    }
}
