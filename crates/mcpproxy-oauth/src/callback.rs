//! Loopback authorization-code callback listener (RFC 8252).
//!
//! A short-lived `axum` server bound to `127.0.0.1`, built and torn down
//! once per login attempt — consistent with the rest of the workspace's HTTP
//! stack rather than pulling in a second HTTP crate, per SPEC_FULL §4.5.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{OAuthError, OAuthResult};

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub struct CallbackResult {
    pub code: String,
    pub state: String,
}

struct CallbackServerState {
    tx: Mutex<Option<oneshot::Sender<Result<CallbackResult, String>>>>,
}

async fn handle_callback(
    State(state): State<Arc<CallbackServerState>>,
    Query(query): Query<CallbackQuery>,
) -> Html<&'static str> {
    let outcome = match (query.code, query.state) {
        (Some(code), Some(csrf_state)) => Ok(CallbackResult { code, state: csrf_state }),
        _ => {
            let reason = query
                .error_description
                .or(query.error)
                .unwrap_or_else(|| "missing code/state in callback".to_string());
            Err(reason)
        }
    };

    let is_ok = outcome.is_ok();
    if let Some(tx) = state.tx.lock().take() {
        let _ = tx.send(outcome);
    }

    if is_ok {
        Html("<html><body>Authentication complete. You may close this window.</body></html>")
    } else {
        Html("<html><body>Authorization failed. You may close this window.</body></html>")
    }
}

/// An acquired loopback listener, bound before the browser is opened so the
/// exact redirect URI is known ahead of time.
pub struct CallbackServer {
    pub port: u16,
    completion: oneshot::Receiver<Result<CallbackResult, String>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind a loopback listener. `preferred_port` of `0` asks the kernel to
    /// choose; a non-zero value is tried first and the caller is expected to
    /// fall back to `0` (and clear DCR credentials, per spec §4.5) on a
    /// bind failure.
    pub async fn bind(preferred_port: u16) -> OAuthResult<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, preferred_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| OAuthError::Flow(format!("failed to bind callback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| OAuthError::Flow(format!("failed to read bound callback address: {e}")))?
            .port();

        let (completion_tx, completion_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app_state = Arc::new(CallbackServerState {
            tx: Mutex::new(Some(completion_tx)),
        });

        let app = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(app_state);

        info!(port, "OAuth loopback callback listener bound");

        let join = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                debug!(error = %e, "OAuth callback listener exited with an error");
            }
        });

        Ok(Self {
            port,
            completion: completion_rx,
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Wait for the callback, up to `timeout`. The listener is torn down the
    /// instant a valid callback arrives or the deadline elapses.
    pub async fn wait_for_callback(mut self, timeout: Duration) -> OAuthResult<(String, String)> {
        let result = tokio::time::timeout(timeout, &mut self.completion).await;
        self.shutdown().await;
        match result {
            Ok(Ok(Ok(callback))) => Ok((callback.code, callback.state)),
            Ok(Ok(Err(reason))) => Err(OAuthError::Flow(format!("authorization denied: {reason}"))),
            Ok(Err(_)) => Err(OAuthError::Flow("callback channel closed unexpectedly".into())),
            Err(_) => Err(OAuthError::Timeout),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_to_a_kernel_chosen_port_when_zero() {
        let server = CallbackServer::bind(0).await.unwrap();
        assert_ne!(server.port, 0);
    }

    #[tokio::test]
    async fn redirect_uri_embeds_the_bound_port() {
        let server = CallbackServer::bind(0).await.unwrap();
        assert_eq!(server.redirect_uri(), format!("http://127.0.0.1:{}/callback", server.port));
    }

    #[tokio::test]
    async fn delivers_code_and_state_from_a_get_callback() {
        let server = CallbackServer::bind(0).await.unwrap();
        let port = server.port;
        let client = reqwest::Client::new();
        let wait = tokio::spawn(server.wait_for_callback(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        client
            .get(format!("http://127.0.0.1:{port}/callback?code=abc&state=xyz"))
            .send()
            .await
            .unwrap();
        let (code, state) = wait.await.unwrap().unwrap();
        assert_eq!(code, "abc");
        assert_eq!(state, "xyz");
    }

    #[tokio::test]
    async fn times_out_when_nothing_ever_calls_back() {
        let server = CallbackServer::bind(0).await.unwrap();
        let result = server.wait_for_callback(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(OAuthError::Timeout)));
    }
}
