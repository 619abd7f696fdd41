//! `GET /events`: Server-Sent Events stream of the Event Bus (spec §6, §4.7).
//! Requires an API key like the rest of `/api/v1/*`.
//!
//! Grounded on the teacher's `sse_handler` shape (subscribe, stream until the
//! channel closes, turn a lag into a visible `error` event) but built on
//! `futures::stream::unfold` over our own `EventSubscriber` rather than
//! `async-stream` over a raw `broadcast::Receiver`, since nothing else in
//! this workspace pulls in `async-stream`.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;

use crate::state::AppState;

pub async fn events_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = state.runtime.events().subscribe();

    let stream = futures::stream::unfold(subscriber, |mut subscriber| async move {
        let envelope = subscriber.recv().await?;
        let event = Event::default()
            .event(event_name(&envelope.event))
            .data(serde_json::to_string(&envelope).unwrap_or_default());
        Some((Ok(event), subscriber))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}

fn event_name(event: &mcpproxy_events::Event) -> &'static str {
    match event {
        mcpproxy_events::Event::ServersChanged { .. } => "servers.changed",
        mcpproxy_events::Event::ConfigReloaded => "config.reloaded",
        mcpproxy_events::Event::OAuthTokenRefreshed { .. } => "oauth.token_refreshed",
        mcpproxy_events::Event::OAuthRefreshFailed { .. } => "oauth.refresh_failed",
        mcpproxy_events::Event::ActivityRecorded { .. } => "activity.recorded",
    }
}
