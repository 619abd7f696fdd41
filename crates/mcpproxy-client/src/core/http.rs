//! Streamable-HTTP Core Client: one POST per JSON-RPC request to the
//! server's URL. The response is either a plain JSON body or a
//! `text/event-stream` carrying the matching response plus any
//! server-initiated messages emitted while the request was in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use mcpproxy_protocol::{
    jsonrpc::JsonRpcId, CallToolParams, CallToolResult, Error, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, RawTool, Result,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use tracing::trace;

use super::sse_frame::SseEventParser;
use super::Transport;

pub struct StreamableHttpCoreClient {
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    next_id: AtomicI64,
    server_name: String,
}

impl StreamableHttpCoreClient {
    pub fn new(
        url: impl Into<String>,
        extra_headers: &HashMap<String, String>,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (k, v) in extra_headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| Error::invalid_params(format!("invalid header name {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| Error::invalid_params(format!("invalid header value for {k}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            url: url.into(),
            headers,
            next_id: AtomicI64::new(1),
            server_name: server_name.into(),
        })
    }

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let id = JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let body = JsonRpcRequest::new(id.clone(), method, params);

        let response = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transport(format!("{}: {e}", self.server_name)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let resource_metadata_url = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| mcpproxy_oauth::parse_resource_metadata_url(v).ok().flatten());
            return Err(Error::unauthorized(resource_metadata_url));
        }
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
        {
            return Err(Error::transport(format!(
                "{} does not support streamable-http ({})",
                self.server_name,
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(Error::transport(format!(
                "{} returned {}",
                self.server_name,
                response.status()
            )));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let text = response
            .text()
            .await
            .map_err(|e| Error::transport(format!("{}: {e}", self.server_name)))?;

        let rpc_response = if is_event_stream {
            extract_matching_response(&text, &id, &self.server_name)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text)?
        };

        rpc_response
            .into_result()
            .map_err(|e| Error::upstream(e.code, e.message))
    }
}

fn extract_matching_response(body: &str, id: &JsonRpcId, server_name: &str) -> Result<JsonRpcResponse> {
    let mut parser = SseEventParser::new();
    let mut events = parser.push(body);
    events.extend(parser.push("\n\n")); // flush a trailing event missing its blank-line terminator

    for event in events {
        match serde_json::from_str::<JsonRpcResponse>(&event.data) {
            Ok(response) if &response.id == id => return Ok(response),
            Ok(_) => trace!(server = %server_name, "dropping SSE event for a different request id"),
            Err(_) => trace!(server = %server_name, "dropping non-JSON-RPC SSE event"),
        }
    }

    Err(Error::protocol(format!(
        "{server_name}: no matching response in event stream for request {id:?}"
    )))
}

#[async_trait]
impl Transport for StreamableHttpCoreClient {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let value = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_tools(&self) -> Result<Vec<RawTool>> {
        let value = self.request("tools/list", None).await?;
        let result: ListToolsResult = serde_json::from_value(value)?;
        Ok(result.tools)
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self.request("tools/call", Some(serde_json::to_value(params)?)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_plain_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"tools": []}
            })))
            .mount(&server)
            .await;

        let client = StreamableHttpCoreClient::new(
            format!("{}/mcp", server.uri()),
            &HashMap::new(),
            "test",
        )
        .unwrap();
        let tools = client.list_tools().await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn surfaces_401_as_unauthorized_with_resource_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Bearer resource_metadata="http://u/.well-known/oauth-protected-resource""#,
            ))
            .mount(&server)
            .await;

        let client = StreamableHttpCoreClient::new(
            format!("{}/mcp", server.uri()),
            &HashMap::new(),
            "test",
        )
        .unwrap();
        let err = client.list_tools().await.unwrap_err();
        assert_eq!(err.kind, mcpproxy_protocol::ErrorKind::Unauthorized);
        assert_eq!(
            err.resource_metadata_url.as_deref(),
            Some("http://u/.well-known/oauth-protected-resource")
        );
    }
}
