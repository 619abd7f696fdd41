//! In-process publish/subscribe event bus.
//!
//! Built on `tokio::sync::broadcast`: subscribers get their own buffered
//! channel, a slow subscriber drops events rather than ever blocking a
//! publisher (spec §4.7, §5). Event publication is FIFO per subscriber;
//! cross-subscriber order is unspecified, matching `broadcast`'s contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity. Sized generously since the cost of a slow
/// subscriber is a warning + dropped events, not backpressure.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    #[serde(rename = "servers.changed")]
    ServersChanged { server_name: String },
    #[serde(rename = "config.reloaded")]
    ConfigReloaded,
    #[serde(rename = "oauth.token_refreshed")]
    OAuthTokenRefreshed { server_key: String },
    #[serde(rename = "oauth.refresh_failed")]
    OAuthRefreshFailed { server_key: String, reason: String },
    /// A token was just persisted (fresh login or successful refresh). The
    /// proactive refresh scheduler arms itself off this rather than being
    /// handed a direct reference back to the manager that published it.
    #[serde(rename = "oauth.token_saved")]
    OAuthTokenSaved { server_key: String, base_url: String },
    /// A server's token was cleared (logout, or the server was removed).
    #[serde(rename = "oauth.token_cleared")]
    OAuthTokenCleared { server_key: String },
    #[serde(rename = "activity.recorded")]
    ActivityRecorded { id: String, kind: String },
}

/// Envelope wrapping an `Event` with a publish timestamp, used by SSE and
/// other consumers that want ordering/staleness information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: Event,
    pub published_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Never blocks; if there are no subscribers this is a
    /// no-op (broadcast's `send` errors in that case, which we swallow).
    pub fn publish(&self, event: Event) {
        let envelope = EventEnvelope {
            event,
            published_at: Utc::now(),
        };
        // An error here only means "no subscribers currently listening",
        // which is a perfectly normal state, not a fault.
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventSubscriber {
    receiver: broadcast::Receiver<EventEnvelope>,
}

impl EventSubscriber {
    /// Await the next event. On lag (subscriber fell behind and some events
    /// were dropped), logs a warning and resumes from the oldest surviving
    /// event rather than erroring out to the caller.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, dropped events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(Event::ConfigReloaded);
        let envelope = sub.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::ConfigReloaded));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::ConfigReloaded);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Event::ServersChanged {
            server_name: "x".into(),
        });
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }
}
