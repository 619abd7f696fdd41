use thiserror::Error;

pub type OAuthResult<T> = std::result::Result<T, OAuthError>;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("discovery request failed: {0}")]
    Discovery(String),

    #[error("dynamic client registration failed: {0}")]
    Registration(String),

    #[error("authorization flow failed: {0}")]
    Flow(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("server is not OAuth-capable: {0}")]
    NotOAuthCapable(String),

    #[error("reserved OAuth parameter cannot be overridden: {0}")]
    ReservedParameter(String),

    #[error("storage error: {0}")]
    Storage(#[from] mcpproxy_storage::StorageError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out waiting for browser authorization")]
    Timeout,
}
