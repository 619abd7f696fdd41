//! RFC 7591 Dynamic Client Registration.
//!
//! Grounded on `turbomcp-auth::oauth2::dcr`'s request/response shape, trimmed
//! to the fields this proxy actually persists (client id/secret + the
//! callback-port-derived redirect_uri — see spec §4.5 on port-conflict
//! re-registration).

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OAuthError, OAuthResult};

#[derive(Debug, Clone, Serialize)]
struct RegistrationRequest {
    client_name: String,
    redirect_uris: Vec<String>,
    grant_types: Vec<String>,
    response_types: Vec<String>,
    token_endpoint_auth_method: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

pub async fn register(
    http: &reqwest::Client,
    registration_endpoint: &str,
    redirect_uri: &str,
    client_name: &str,
) -> OAuthResult<RegisteredClient> {
    let request = RegistrationRequest {
        client_name: client_name.to_string(),
        redirect_uris: vec![redirect_uri.to_string()],
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
    };

    let response = http
        .post(registration_endpoint)
        .json(&request)
        .send()
        .await
        .map_err(|e| OAuthError::Registration(e.to_string()))?;

    if !response.status().is_success() {
        return Err(OAuthError::Registration(format!(
            "registration endpoint returned {}",
            response.status()
        )));
    }

    let client: RegisteredClient = response
        .json()
        .await
        .map_err(|e| OAuthError::Registration(format!("malformed registration response: {e}")))?;

    info!(client_id = %client.client_id, "registered new OAuth client via DCR");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn registers_and_parses_client_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "client_id": "c1",
                "client_secret": "s1"
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let endpoint = format!("{}/register", server.uri());
        let client = register(&http, &endpoint, "http://127.0.0.1:1234/callback", "mcpproxy")
            .await
            .unwrap();
        assert_eq!(client.client_id, "c1");
        assert_eq!(client.client_secret, Some("s1".to_string()));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let endpoint = format!("{}/register", server.uri());
        let result = register(&http, &endpoint, "http://127.0.0.1:1/callback", "mcpproxy").await;
        assert!(result.is_err());
    }
}
