//! Proactive token refresh scheduler (spec §4.5).
//!
//! Arms a one-shot timer per server at 80% of the token's remaining
//! lifetime. On fire, refreshes via the `refresh_token` grant with
//! exponential backoff (1s/2s/4s, three attempts) before giving up and
//! emitting `oauth.refresh_failed`. Decoupled from `OAuthManager` through
//! the `TokenRefresher` trait so the arming/backoff logic can be tested
//! without a live HTTP stack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mcpproxy_storage::OAuthTokenRecord;
use parking_lot::Mutex;
use tracing::{info, warn};

const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Minimum lifetime fraction remaining at which a refresh is armed; see
/// `OAuthTokenRecord::lifetime_fraction_remaining`.
const REFRESH_AT_FRACTION_REMAINING: f64 = 0.2;

#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    async fn refresh(&self, server_key: &str, base_url: &str) -> crate::error::OAuthResult<OAuthTokenRecord>;
    fn emit_refresh_failed(&self, server_key: &str, reason: &str);

    /// Waits out any interactive login flow currently active for
    /// `server_key` (spec §4.5: "on fire, if a flow is active, no-op").
    /// Returns immediately when no flow is in progress. Default
    /// implementation never blocks, for refreshers with no flow concept.
    async fn wait_for_flow(&self, _server_key: &str) {}
}

/// Tracks one armed timer task per server so re-arming (after a successful
/// refresh, or a config reload) cancels whatever was previously scheduled.
#[derive(Clone)]
pub struct RefreshScheduler {
    refresher: Arc<dyn TokenRefresher>,
    timers: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
    /// Lifetime-fraction-remaining at which a refresh fires; overridable
    /// from config (`oauth_refresh_threshold`), defaults to the spec's 80%
    /// (`REFRESH_AT_FRACTION_REMAINING` = 0.2 remaining).
    threshold: f64,
}

impl RefreshScheduler {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::with_threshold(refresher, REFRESH_AT_FRACTION_REMAINING)
    }

    pub fn with_threshold(refresher: Arc<dyn TokenRefresher>, threshold: f64) -> Self {
        Self {
            refresher,
            timers: Arc::new(Mutex::new(HashMap::new())),
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Arm (or re-arm) the refresh timer for one server from its current
    /// token record. A token with no `refresh_token` is not scheduled.
    pub fn arm(&self, server_key: &str, base_url: &str, record: &OAuthTokenRecord) {
        if record.refresh_token.is_none() {
            return;
        }
        let delay = refresh_delay(record, self.threshold);
        self.arm_after(server_key, base_url, delay);
    }

    fn arm_after(&self, server_key: &str, base_url: &str, delay: Duration) {
        let server_key = server_key.to_string();
        let base_url = base_url.to_string();
        let refresher = self.refresher.clone();
        let scheduler = self.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(&refresher, &server_key, &base_url).await;
        });

        if let Some(previous) = self.timers.lock().insert(server_key, handle) {
            previous.abort();
        }
    }

    async fn fire(&self, refresher: &Arc<dyn TokenRefresher>, server_key: &str, base_url: &str) {
        // An interactive login already in flight owns this server_key; let
        // it finish (and re-arm on its own success) rather than racing it.
        refresher.wait_for_flow(server_key).await;

        for (attempt, backoff) in std::iter::once(Duration::ZERO).chain(BACKOFF).enumerate() {
            if backoff > Duration::ZERO {
                tokio::time::sleep(backoff).await;
            }
            match refresher.refresh(server_key, base_url).await {
                Ok(record) => {
                    info!(server_key, attempt, "OAuth token refreshed proactively");
                    self.arm(server_key, base_url, &record);
                    return;
                }
                Err(e) => {
                    warn!(server_key, attempt, error = %e, "proactive OAuth refresh attempt failed");
                }
            }
        }
        refresher.emit_refresh_failed(server_key, "exhausted refresh retries");
    }

    /// Cancel a server's armed timer, e.g. on logout or server removal.
    pub fn disarm(&self, server_key: &str) {
        if let Some(handle) = self.timers.lock().remove(server_key) {
            handle.abort();
        }
    }

    /// Arm timers for every non-expired, refreshable token at startup.
    pub fn arm_all<'a>(&self, tokens: impl IntoIterator<Item = (&'a str, &'a OAuthTokenRecord)>) {
        let now = Utc::now();
        for (base_url, record) in tokens {
            if !record.is_expired(now) {
                self.arm(&record.server_key, base_url, record);
            }
        }
    }
}

/// How long to wait before refreshing: arm at `1 - threshold` of the token's
/// lifetime elapsed, clamped to zero if already past that point.
fn refresh_delay(record: &OAuthTokenRecord, threshold: f64) -> Duration {
    let now = Utc::now();
    let fraction_remaining = record.lifetime_fraction_remaining(now);
    if fraction_remaining <= threshold {
        return Duration::ZERO;
    }
    let total_secs = (record.expires_at - record.updated).num_milliseconds().max(0) as f64 / 1000.0;
    let remaining_secs = total_secs * fraction_remaining;
    let wait = remaining_secs - threshold * total_secs;
    Duration::from_secs_f64(wait.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeRefresher {
        calls: AtomicUsize,
        fail_until: usize,
        failed_events: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, server_key: &str, _base_url: &str) -> crate::error::OAuthResult<OAuthTokenRecord> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_until {
                return Err(crate::error::OAuthError::TokenExchange("simulated failure".into()));
            }
            let now = Utc::now();
            Ok(OAuthTokenRecord {
                server_key: server_key.to_string(),
                access_token: "new".into(),
                refresh_token: Some("refresh".into()),
                token_type: "Bearer".into(),
                expires_at: now + chrono::Duration::seconds(3600),
                scopes: vec![],
                created: now,
                updated: now,
                client_id: Some("c".into()),
                client_secret: None,
                callback_port: None,
                redirect_uri: None,
            })
        }

        fn emit_refresh_failed(&self, server_key: &str, reason: &str) {
            self.failed_events
                .try_lock()
                .unwrap()
                .push(format!("{server_key}:{reason}"));
        }
    }

    fn expired_record(server_key: &str) -> OAuthTokenRecord {
        let now = Utc::now();
        OAuthTokenRecord {
            server_key: server_key.to_string(),
            access_token: "old".into(),
            refresh_token: Some("refresh".into()),
            token_type: "Bearer".into(),
            expires_at: now - chrono::Duration::seconds(1),
            scopes: vec![],
            created: now - chrono::Duration::seconds(3600),
            updated: now,
            client_id: Some("c".into()),
            client_secret: None,
            callback_port: None,
            redirect_uri: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_for_an_already_due_token() {
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            fail_until: 0,
            failed_events: AsyncMutex::new(Vec::new()),
        });
        let scheduler = RefreshScheduler::new(refresher.clone());
        scheduler.arm("s1", "http://base", &expired_record("s1"));
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert!(refresher.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_gives_up() {
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            fail_until: 10,
            failed_events: AsyncMutex::new(Vec::new()),
        });
        let scheduler = RefreshScheduler::new(refresher.clone());
        scheduler.arm("s1", "http://base", &expired_record("s1"));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(5)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            refresher.failed_events.lock().await.as_slice(),
            ["s1:exhausted refresh retries"]
        );
    }

    #[tokio::test]
    async fn disarm_cancels_the_pending_timer() {
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            fail_until: 0,
            failed_events: AsyncMutex::new(Vec::new()),
        });
        let scheduler = RefreshScheduler::new(refresher.clone());
        scheduler.arm("s1", "http://base", &expired_record("s1"));
        scheduler.disarm("s1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    struct FlowGatedRefresher {
        calls: AtomicUsize,
        flow_active: std::sync::atomic::AtomicBool,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl TokenRefresher for FlowGatedRefresher {
        async fn refresh(&self, server_key: &str, _base_url: &str) -> crate::error::OAuthResult<OAuthTokenRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(OAuthTokenRecord {
                server_key: server_key.to_string(),
                access_token: "new".into(),
                refresh_token: Some("refresh".into()),
                token_type: "Bearer".into(),
                expires_at: now + chrono::Duration::seconds(3600),
                scopes: vec![],
                created: now,
                updated: now,
                client_id: Some("c".into()),
                client_secret: None,
                callback_port: None,
                redirect_uri: None,
            })
        }

        fn emit_refresh_failed(&self, _server_key: &str, _reason: &str) {}

        async fn wait_for_flow(&self, _server_key: &str) {
            while self.flow_active.load(Ordering::SeqCst) {
                self.notify.notified().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fire_waits_for_an_active_login_flow_before_refreshing() {
        let refresher = Arc::new(FlowGatedRefresher {
            calls: AtomicUsize::new(0),
            flow_active: std::sync::atomic::AtomicBool::new(true),
            notify: tokio::sync::Notify::new(),
        });
        let scheduler = RefreshScheduler::new(refresher.clone());
        scheduler.arm("s1", "http://base", &expired_record("s1"));

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0, "should block while flow is active");

        refresher.flow_active.store(false, Ordering::SeqCst);
        refresher.notify.notify_waiters();
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}
