//! OAuth 2.1 + PKCE client flow for upstream MCP servers: RFC 9728/8414
//! discovery, RFC 7591 dynamic client registration, an RFC 8252 loopback
//! callback listener, per-server flow coordination, and proactive token
//! refresh.
//!
//! [`manager::OAuthManager`] is the entry point the rest of the proxy talks
//! to; the other modules are its building blocks.

pub mod callback;
pub mod dcr;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod manager;
pub mod pkce;
pub mod refresh;
pub mod token;

pub use discovery::{
    parse_resource_metadata_url, AuthorizationServerMetadata, DiscoveryClient,
    ProtectedResourceMetadata, ResolvedAuthParams,
};
pub use error::{OAuthError, OAuthResult};
pub use flow::{FlowCoordinator, FlowGuard};
pub use manager::{LoginRequest, OAuthManager};
pub use pkce::PkcePair;
pub use refresh::{RefreshScheduler, TokenRefresher};
pub use token::TokenResponse;
