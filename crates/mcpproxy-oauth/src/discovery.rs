//! RFC 9728 Protected Resource Metadata + RFC 8414 Authorization Server
//! Metadata discovery, with the scope/resource waterfall from spec §4.5.
//!
//! Grounded on `turbomcp-auth::discovery`'s fetcher shape (timeout, capped
//! redirects, in-process TTL cache keyed by URL) adapted from a
//! resource-server validator to a client-side discovery waterfall.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OAuthError, OAuthResult};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REDIRECTS: usize = 3;
const CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// Resolved scopes + resource parameter for a token request, per the
/// waterfall in spec §4.5.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAuthParams {
    pub scopes: Vec<String>,
    pub resource: Option<String>,
}

#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    fetched_at: std::time::Instant,
}

/// Fetches and caches discovery documents. One instance is shared across all
/// upstreams; cache entries are invalidated per-server on config change by
/// the caller calling `invalidate`.
#[derive(Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    prm_cache: Arc<DashMap<String, CacheEntry<ProtectedResourceMetadata>>>,
    asm_cache: Arc<DashMap<String, CacheEntry<AuthorizationServerMetadata>>>,
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .expect("reqwest client builder with static config never fails");
        Self {
            http,
            prm_cache: Arc::new(DashMap::new()),
            asm_cache: Arc::new(DashMap::new()),
        }
    }

    pub fn invalidate(&self, metadata_url: &str) {
        self.prm_cache.remove(metadata_url);
        self.asm_cache.remove(metadata_url);
    }

    async fn fetch_prm(&self, metadata_url: &str) -> Option<ProtectedResourceMetadata> {
        if let Some(entry) = self.prm_cache.get(metadata_url) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Some(entry.value.clone());
            }
        }
        match self.http.get(metadata_url).send().await {
            Ok(resp) => match resp.json::<ProtectedResourceMetadata>().await {
                Ok(metadata) => {
                    self.prm_cache.insert(
                        metadata_url.to_string(),
                        CacheEntry {
                            value: metadata.clone(),
                            fetched_at: std::time::Instant::now(),
                        },
                    );
                    Some(metadata)
                }
                Err(e) => {
                    warn!(%metadata_url, error = %e, "malformed protected resource metadata");
                    None
                }
            },
            Err(e) => {
                debug!(%metadata_url, error = %e, "protected resource metadata fetch failed");
                None
            }
        }
    }

    async fn fetch_asm(&self, base_url: &str) -> Option<AuthorizationServerMetadata> {
        let url = format!(
            "{}/.well-known/oauth-authorization-server",
            base_url.trim_end_matches('/')
        );
        if let Some(entry) = self.asm_cache.get(&url) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Some(entry.value.clone());
            }
        }
        match self.http.get(&url).send().await {
            Ok(resp) => match resp.json::<AuthorizationServerMetadata>().await {
                Ok(metadata) => {
                    self.asm_cache.insert(
                        url,
                        CacheEntry {
                            value: metadata.clone(),
                            fetched_at: std::time::Instant::now(),
                        },
                    );
                    Some(metadata)
                }
                Err(e) => {
                    warn!(%url, error = %e, "malformed authorization server metadata");
                    None
                }
            },
            Err(e) => {
                debug!(%url, error = %e, "authorization server metadata fetch failed");
                None
            }
        }
    }

    pub async fn fetch_authorization_server_metadata(
        &self,
        base_url: &str,
    ) -> Option<AuthorizationServerMetadata> {
        self.fetch_asm(base_url).await
    }

    /// Resolve scopes + resource per the waterfall:
    /// 1. explicit config scopes win outright
    /// 2. else RFC 9728 PRM (from the `WWW-Authenticate` challenge URL)
    /// 3. else RFC 8414 ASM at `{base_url}/.well-known/oauth-authorization-server`
    /// 4. else empty scopes
    ///
    /// Each step's failure falls through rather than aborting — discovery
    /// is best-effort, never fatal to the OAuth attempt.
    pub async fn resolve_auth_params(
        &self,
        configured_scopes: &[String],
        resource_metadata_url: Option<&str>,
        base_url: &str,
    ) -> ResolvedAuthParams {
        if !configured_scopes.is_empty() {
            return ResolvedAuthParams {
                scopes: configured_scopes.to_vec(),
                resource: None,
            };
        }

        if let Some(prm_url) = resource_metadata_url {
            if let Some(prm) = self.fetch_prm(prm_url).await {
                if !prm.scopes_supported.is_empty() || prm.resource.is_some() {
                    return ResolvedAuthParams {
                        scopes: prm.scopes_supported,
                        resource: prm.resource,
                    };
                }
            }
        }

        if let Some(asm) = self.fetch_asm(base_url).await {
            if !asm.scopes_supported.is_empty() {
                return ResolvedAuthParams {
                    scopes: asm.scopes_supported,
                    resource: None,
                };
            }
        }

        ResolvedAuthParams {
            scopes: Vec::new(),
            resource: None,
        }
    }
}

/// Parse the `resource_metadata` parameter out of a `WWW-Authenticate`
/// header value, e.g.
/// `Bearer resource_metadata="http://u/.well-known/oauth-protected-resource"`.
pub fn parse_resource_metadata_url(www_authenticate: &str) -> OAuthResult<Option<String>> {
    let marker = "resource_metadata=";
    let Some(idx) = www_authenticate.find(marker) else {
        return Ok(None);
    };
    let rest = &www_authenticate[idx + marker.len()..];
    let rest = rest.trim_start_matches('"');
    let end = rest.find('"').ok_or_else(|| {
        OAuthError::Discovery("malformed resource_metadata parameter (unterminated quote)".into())
    })?;
    Ok(Some(rest[..end].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_metadata_url() {
        let header = r#"Bearer resource_metadata="http://u/.well-known/oauth-protected-resource""#;
        let url = parse_resource_metadata_url(header).unwrap();
        assert_eq!(
            url,
            Some("http://u/.well-known/oauth-protected-resource".to_string())
        );
    }

    #[test]
    fn returns_none_without_marker() {
        assert_eq!(parse_resource_metadata_url("Bearer").unwrap(), None);
    }

    #[tokio::test]
    async fn explicit_scopes_short_circuit_discovery() {
        let client = DiscoveryClient::new();
        let resolved = client
            .resolve_auth_params(&["configured".to_string()], None, "http://unused.invalid")
            .await;
        assert_eq!(resolved.scopes, vec!["configured".to_string()]);
    }
}
