//! Managed Client (spec §4.2): wraps a stateless Core Client with the
//! connection state machine, retry/backoff, OAuth integration, optional
//! container isolation, and a per-upstream log sink.

mod backoff;
mod client;
mod container;
mod log_sink;
mod state;

pub use backoff::BackoffPolicy;
pub use client::{ManagedClient, ManagedClientConfig, SHUTDOWN_BUDGET};
pub use container::{build_launch, is_already_containerized, ContainerLaunch};
pub use log_sink::{LogLine, LogSink};
pub use state::{transition, ConnectionInfo, ConnectionState, Effect, StateEvent};
