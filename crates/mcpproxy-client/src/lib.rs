//! Upstream MCP clients: the stateless Core Client transports (spec §4.1)
//! and the stateful Managed Client that wraps them with a connection state
//! machine, retry/backoff, OAuth integration, container isolation, and a
//! per-upstream rotating log sink (spec §4.2).

pub mod core;
pub mod managed;

pub use crate::core::{CoreClient, StreamableHttpCoreClient, StdioCoreClient, SseCoreClient, Transport};
pub use managed::{
    BackoffPolicy, ConnectionInfo, ConnectionState, Effect, ManagedClient, ManagedClientConfig,
    StateEvent,
};
