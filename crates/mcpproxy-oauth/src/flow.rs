//! Per-server OAuth flow coordinator (spec §4.5).
//!
//! Serializes interactive authorization flows per `server_key` so a manual
//! "login" click and the proactive refresh scheduler never race each other,
//! and a stale flow (browser closed, network died mid-flow) doesn't wedge
//! the server forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A flow older than this is considered abandoned and its lock released on
/// the next contending caller, per spec §5 ("stale in-progress flow").
const BROWSER_AUTH_TIMEOUT: Duration = Duration::from_secs(300);

struct FlowState {
    active: bool,
    started_at: Option<Instant>,
    notify: Arc<Notify>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            active: false,
            started_at: None,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Guard returned by [`FlowCoordinator::start_flow`]; dropping it (or calling
/// [`FlowGuard::end`] explicitly) releases the per-server lock.
pub struct FlowGuard {
    coordinator: FlowCoordinator,
    server_key: String,
    released: bool,
}

impl FlowGuard {
    pub fn end(mut self) {
        self.coordinator.end_flow(&self.server_key);
        self.released = true;
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.end_flow(&self.server_key);
        }
    }
}

#[derive(Clone, Default)]
pub struct FlowCoordinator {
    flows: Arc<Mutex<HashMap<String, FlowState>>>,
}

impl FlowCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to begin a flow for `server_key`. Returns `None` if another flow
    /// is already active and not stale.
    pub fn start_flow(&self, server_key: &str) -> Option<FlowGuard> {
        let mut flows = self.flows.lock();
        let state = flows.entry(server_key.to_string()).or_default();

        if state.active {
            let stale = state
                .started_at
                .map(|t| t.elapsed() > BROWSER_AUTH_TIMEOUT)
                .unwrap_or(false);
            if !stale {
                return None;
            }
        }

        state.active = true;
        state.started_at = Some(Instant::now());
        Some(FlowGuard {
            coordinator: self.clone(),
            server_key: server_key.to_string(),
            released: false,
        })
    }

    pub fn end_flow(&self, server_key: &str) {
        let mut flows = self.flows.lock();
        if let Some(state) = flows.get_mut(server_key) {
            state.active = false;
            state.started_at = None;
            state.notify.notify_waiters();
        }
    }

    pub fn is_flow_active(&self, server_key: &str) -> bool {
        self.flows
            .lock()
            .get(server_key)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Wait for any in-progress flow on `server_key` to end. Returns
    /// immediately if no flow is active.
    pub async fn wait_for_flow(&self, server_key: &str) {
        loop {
            let notify = {
                let mut flows = self.flows.lock();
                let state = flows.entry(server_key.to_string()).or_default();
                if !state.active {
                    return;
                }
                state.notify.clone()
            };
            notify.notified().await;
            if !self.is_flow_active(server_key) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_fails_while_first_active() {
        let coordinator = FlowCoordinator::new();
        let _guard = coordinator.start_flow("s1").unwrap();
        assert!(coordinator.start_flow("s1").is_none());
    }

    #[test]
    fn ending_releases_the_lock() {
        let coordinator = FlowCoordinator::new();
        let guard = coordinator.start_flow("s1").unwrap();
        guard.end();
        assert!(coordinator.start_flow("s1").is_some());
    }

    #[test]
    fn different_servers_do_not_contend() {
        let coordinator = FlowCoordinator::new();
        let _a = coordinator.start_flow("s1").unwrap();
        assert!(coordinator.start_flow("s2").is_some());
    }

    #[tokio::test]
    async fn wait_for_flow_returns_immediately_when_idle() {
        let coordinator = FlowCoordinator::new();
        coordinator.wait_for_flow("s1").await;
    }

    #[tokio::test]
    async fn wait_for_flow_unblocks_on_end() {
        let coordinator = FlowCoordinator::new();
        let guard = coordinator.start_flow("s1").unwrap();
        let waiter_coordinator = coordinator.clone();
        let waiter = tokio::spawn(async move {
            waiter_coordinator.wait_for_flow("s1").await;
        });
        tokio::task::yield_now().await;
        guard.end();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_flow should unblock after end_flow")
            .unwrap();
    }
}
