//! Connection state machine for the Managed Client (spec §4.2, DESIGN NOTES
//! §9 "state machines as data"): an enum plus timestamps/counters, mutated
//! only through a pure `transition(state, event) -> (state, Vec<Effect>)`
//! function rather than subclassing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mirrors spec §3's `ConnectionInfo.state` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Error,
}

/// Events the owning `ManagedClient` feeds into `transition`. Each event
/// corresponds to something that actually happened (a handshake succeeded,
/// a 401 arrived, a timer fired) — never a command; commands (`enable`,
/// `disable`) are handled one level up, by deciding which event to feed in.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Enable,
    HandshakeOk,
    Unauthorized { resource_metadata_url: Option<String> },
    TokenAcquired,
    Error { message: String },
    Disable,
    ManualRestart,
}

/// Side effects the owner must carry out in response to a transition. Kept
/// separate from the state itself so `transition` stays a pure function the
/// unit tests can exercise without a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartConnecting,
    StartOAuthFlow { resource_metadata_url: Option<String> },
    ScheduleRetry { after: std::time::Duration },
    TeardownTransport,
    ResetRetryCounter,
}

/// In-memory per-upstream connection info (spec §3). `state` is mutated only
/// via `transition`; everything else here is bookkeeping the owner updates
/// alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub server_version: Option<String>,
    pub last_oauth_attempt: Option<DateTime<Utc>>,
    pub oauth_retry_count: u32,
    pub is_oauth_error: bool,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            retry_count: 0,
            last_retry_at: None,
            server_version: None,
            last_oauth_attempt: None,
            oauth_retry_count: 0,
            is_oauth_error: false,
        }
    }
}

impl ConnectionInfo {
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }
}

/// The pure transition function spec's DESIGN NOTES §9 calls for. Returns
/// the next state plus any effects the caller must perform; never mutates
/// `info` itself, leaving that to the caller so tests can assert on the
/// returned pair directly.
pub fn transition(current: ConnectionState, event: &StateEvent) -> (ConnectionState, Vec<Effect>) {
    use ConnectionState::*;
    use StateEvent::*;

    match (current, event) {
        (Disconnected, Enable) => (Connecting, vec![Effect::StartConnecting]),

        (Connecting, HandshakeOk) => (Ready, vec![Effect::ResetRetryCounter]),
        (Connecting, Unauthorized { resource_metadata_url }) => (
            Authenticating,
            vec![Effect::StartOAuthFlow {
                resource_metadata_url: resource_metadata_url.clone(),
            }],
        ),
        (Connecting, Error { .. }) => (
            Error,
            vec![Effect::ScheduleRetry {
                after: std::time::Duration::from_secs(1),
            }],
        ),

        (Authenticating, TokenAcquired) => (Connecting, vec![Effect::StartConnecting]),
        (Authenticating, Error { .. }) => (
            Error,
            vec![Effect::ScheduleRetry {
                after: std::time::Duration::from_secs(1),
            }],
        ),

        (Ready, Error { .. }) => (
            Error,
            vec![
                Effect::TeardownTransport,
                Effect::ScheduleRetry {
                    after: std::time::Duration::from_secs(1),
                },
            ],
        ),
        (Ready, Unauthorized { resource_metadata_url }) => (
            Authenticating,
            vec![
                Effect::TeardownTransport,
                Effect::StartOAuthFlow {
                    resource_metadata_url: resource_metadata_url.clone(),
                },
            ],
        ),

        (_, Disable) => (Disconnected, vec![Effect::TeardownTransport]),
        (Error, ManualRestart) => (Connecting, vec![Effect::ResetRetryCounter, Effect::StartConnecting]),
        (Error, Enable) => (Connecting, vec![Effect::StartConnecting]),

        // No-op transitions: event doesn't apply to the current state, stay put.
        (state, _) => (state, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_from_disconnected_starts_connecting() {
        let (next, effects) = transition(ConnectionState::Disconnected, &StateEvent::Enable);
        assert_eq!(next, ConnectionState::Connecting);
        assert_eq!(effects, vec![Effect::StartConnecting]);
    }

    #[test]
    fn handshake_ok_reaches_ready_and_resets_retries() {
        let (next, effects) = transition(ConnectionState::Connecting, &StateEvent::HandshakeOk);
        assert_eq!(next, ConnectionState::Ready);
        assert_eq!(effects, vec![Effect::ResetRetryCounter]);
    }

    #[test]
    fn unauthorized_moves_to_authenticating() {
        let (next, _) = transition(
            ConnectionState::Connecting,
            &StateEvent::Unauthorized {
                resource_metadata_url: Some("http://u/prm".into()),
            },
        );
        assert_eq!(next, ConnectionState::Authenticating);
    }

    #[test]
    fn token_acquired_returns_to_connecting_to_retry_handshake() {
        let (next, _) = transition(ConnectionState::Authenticating, &StateEvent::TokenAcquired);
        assert_eq!(next, ConnectionState::Connecting);
    }

    #[test]
    fn error_from_ready_tears_down_and_schedules_retry() {
        let (next, effects) = transition(
            ConnectionState::Ready,
            &StateEvent::Error {
                message: "eof".into(),
            },
        );
        assert_eq!(next, ConnectionState::Error);
        assert!(effects.contains(&Effect::TeardownTransport));
    }

    #[test]
    fn disable_always_returns_to_disconnected() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Ready,
            ConnectionState::Error,
        ] {
            let (next, _) = transition(state, &StateEvent::Disable);
            assert_eq!(next, ConnectionState::Disconnected);
        }
    }

    #[test]
    fn manual_restart_resets_counter_and_reconnects() {
        let (next, effects) = transition(ConnectionState::Error, &StateEvent::ManualRestart);
        assert_eq!(next, ConnectionState::Connecting);
        assert!(effects.contains(&Effect::ResetRetryCounter));
    }

    #[test]
    fn irrelevant_event_is_a_no_op() {
        let (next, effects) = transition(ConnectionState::Ready, &StateEvent::Enable);
        assert_eq!(next, ConnectionState::Ready);
        assert!(effects.is_empty());
    }
}
