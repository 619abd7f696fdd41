//! Token exchange (authorization_code and refresh_token grants) plus the
//! `extra_params` reserved-key validator from spec §4.5.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::error::{OAuthError, OAuthResult};

/// Parameters no caller-supplied `extra_params` map may override, checked
/// case-insensitively.
const RESERVED_PARAMS: &[&str] = &[
    "client_id",
    "client_secret",
    "redirect_uri",
    "response_type",
    "scope",
    "state",
    "code_challenge",
    "code_challenge_method",
    "grant_type",
    "code",
    "refresh_token",
    "token_type",
];

/// Reject `extra_params` keys that collide with a reserved OAuth parameter.
pub fn validate_extra_params(extra_params: &HashMap<String, String>) -> OAuthResult<()> {
    for key in extra_params.keys() {
        let lower = key.to_ascii_lowercase();
        if RESERVED_PARAMS.contains(&lower.as_str()) {
            return Err(OAuthError::ReservedParameter(key.clone()));
        }
    }
    Ok(())
}

/// Merge a discovered `resource` (RFC 8707) with a user-provided one from
/// `extra_params`. Per spec §9 open question: user wins, and the override is
/// logged so it's visible when debugging a token request that didn't carry
/// the resource an operator expected.
pub fn resolve_resource(discovered: Option<&str>, extra_params: &HashMap<String, String>) -> Option<String> {
    if let Some(user_resource) = extra_params.get("resource") {
        if let Some(discovered) = discovered {
            if discovered != user_resource {
                warn!(
                    discovered,
                    user = %user_resource,
                    "user-provided resource parameter overrides discovered value"
                );
            }
        }
        return Some(user_resource.clone());
    }
    discovered.map(str::to_string)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Exchange an authorization code for tokens, PKCE verifier included, with
/// the resolved `resource` (RFC 8707) and any validated `extra_params`
/// injected into the form body.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code_verifier: &str,
    resource: Option<&str>,
    extra_params: &HashMap<String, String>,
) -> OAuthResult<TokenResponse> {
    validate_extra_params(extra_params)?;

    let mut form: HashMap<String, String> = HashMap::new();
    form.insert("grant_type".to_string(), "authorization_code".to_string());
    form.insert("code".to_string(), code.to_string());
    form.insert("redirect_uri".to_string(), redirect_uri.to_string());
    form.insert("client_id".to_string(), client_id.to_string());
    form.insert("code_verifier".to_string(), code_verifier.to_string());
    if let Some(secret) = client_secret {
        form.insert("client_secret".to_string(), secret.to_string());
    }
    if let Some(resource) = resource {
        form.insert("resource".to_string(), resource.to_string());
    }
    for (k, v) in extra_params {
        form.insert(k.clone(), v.clone());
    }

    post_token_form(http, token_endpoint, form).await
}

/// Refresh an access token via the `refresh_token` grant.
pub async fn exchange_refresh_token(
    http: &reqwest::Client,
    token_endpoint: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: Option<&str>,
) -> OAuthResult<TokenResponse> {
    let mut form: HashMap<String, String> = HashMap::new();
    form.insert("grant_type".to_string(), "refresh_token".to_string());
    form.insert("refresh_token".to_string(), refresh_token.to_string());
    form.insert("client_id".to_string(), client_id.to_string());
    if let Some(secret) = client_secret {
        form.insert("client_secret".to_string(), secret.to_string());
    }

    post_token_form(http, token_endpoint, form).await
}

async fn post_token_form(
    http: &reqwest::Client,
    token_endpoint: &str,
    form: HashMap<String, String>,
) -> OAuthResult<TokenResponse> {
    let response = http
        .post(token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| OAuthError::TokenExchange(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| OAuthError::TokenExchange(format!("malformed token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_param_case_insensitively() {
        let mut params = HashMap::new();
        params.insert("Client_ID".to_string(), "evil".to_string());
        assert!(validate_extra_params(&params).is_err());
    }

    #[test]
    fn allows_non_reserved_param() {
        let mut params = HashMap::new();
        params.insert("audience".to_string(), "http://u/api".to_string());
        assert!(validate_extra_params(&params).is_ok());
    }

    #[test]
    fn user_resource_wins_over_discovered() {
        let mut params = HashMap::new();
        params.insert("resource".to_string(), "http://user/api".to_string());
        let resolved = resolve_resource(Some("http://discovered/api"), &params);
        assert_eq!(resolved, Some("http://user/api".to_string()));
    }

    #[test]
    fn discovered_used_when_no_user_override() {
        let resolved = resolve_resource(Some("http://discovered/api"), &HashMap::new());
        assert_eq!(resolved, Some("http://discovered/api".to_string()));
    }

    #[test]
    fn scopes_splits_on_whitespace() {
        let resp = TokenResponse {
            access_token: "a".into(),
            refresh_token: None,
            token_type: "Bearer".into(),
            expires_in: Some(3600),
            scope: Some("read write".into()),
        };
        assert_eq!(resp.scopes(), vec!["read".to_string(), "write".to_string()]);
    }
}
