//! Plain SSE Core Client: a long-lived `GET` for the server-initiated event
//! stream, one `POST` per outbound JSON-RPC request. Used for upstreams that
//! speak the older "HTTP+SSE" MCP transport rather than streamable-http.
//!
//! Unlike `StreamableHttpCoreClient`, where each POST's own response body
//! carries the matching reply, here replies arrive asynchronously on the
//! shared GET stream and must be matched to a waiter by request id — the
//! same dispatch-by-id shape `StdioCoreClient` uses, just over HTTP instead
//! of a pipe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use mcpproxy_protocol::{
    jsonrpc::JsonRpcId, CallToolParams, CallToolResult, Error, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, RawTool, Result,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, WWW_AUTHENTICATE};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::sse_frame::SseEventParser;
use super::Transport;

pub struct SseCoreClient {
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    next_id: AtomicI64,
    server_name: String,
    pending: Arc<DashMap<JsonRpcId, oneshot::Sender<JsonRpcResponse>>>,
    stream_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseCoreClient {
    pub fn new(
        url: impl Into<String>,
        extra_headers: &HashMap<String, String>,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let url = url.into();
        let server_name = server_name.into();
        let mut headers = HeaderMap::new();
        for (k, v) in extra_headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| Error::invalid_params(format!("invalid header name {k}: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| Error::invalid_params(format!("invalid header value for {k}: {e}")))?;
            headers.insert(name, value);
        }

        let pending: Arc<DashMap<JsonRpcId, oneshot::Sender<JsonRpcResponse>>> = Arc::new(DashMap::new());
        let http = reqwest::Client::new();
        let stream_task = tokio::spawn(run_event_stream(
            http.clone(),
            url.clone(),
            headers.clone(),
            pending.clone(),
            server_name.clone(),
        ));

        Ok(Self {
            http,
            url,
            headers,
            next_id: AtomicI64::new(1),
            server_name,
            pending,
            stream_task: tokio::sync::Mutex::new(Some(stream_task)),
        })
    }

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let id = JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let body = JsonRpcRequest::new(id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let response = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.pending.remove(&id);
                Error::transport(format!("{}: {e}", self.server_name))
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.pending.remove(&id);
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
            self.pending.remove(&id);
            return Err(Error::transport(format!(
                "{} does not support the sse transport ({})",
                self.server_name,
                response.status()
            )));
        }
        if !response.status().is_success() {
            self.pending.remove(&id);
            return Err(Error::transport(format!(
                "{} returned {}",
                self.server_name,
                response.status()
            )));
        }

        let response = rx.await.map_err(|_| {
            Error::canceled(format!(
                "{}: event stream closed while awaiting response to {method}",
                self.server_name
            ))
        })?;
        response.into_result().map_err(|e| Error::upstream(e.code, e.message))
    }
}

async fn run_event_stream(
    http: reqwest::Client,
    url: String,
    headers: HeaderMap,
    pending: Arc<DashMap<JsonRpcId, oneshot::Sender<JsonRpcResponse>>>,
    server_name: String,
) {
    let response = match http.get(&url).headers(headers).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(server = %server_name, error = %e, "failed to open sse event stream");
            return;
        }
    };

    let mut byte_stream = response.bytes_stream();
    let mut parser = SseEventParser::new();
    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(server = %server_name, error = %e, "sse stream read error; closing");
                break;
            }
        };
        let text = String::from_utf8_lossy(&chunk);
        for event in parser.push(&text) {
            match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                Ok(response) => {
                    if let Some((_, tx)) = pending.remove(&response.id) {
                        let _ = tx.send(response);
                    } else {
                        debug!(server = %server_name, id = ?response.id, "sse response for unknown request id");
                    }
                }
                Err(_) => debug!(server = %server_name, "dropping non-JSON-RPC sse event"),
            }
        }
    }
    debug!(server = %server_name, "sse event stream closed");
}

#[async_trait]
impl Transport for SseCoreClient {
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
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn surfaces_401_as_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(Vec::new(), "text/event-stream"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Bearer resource_metadata="http://u/.well-known/oauth-protected-resource""#,
            ))
            .mount(&server)
            .await;

        let client = SseCoreClient::new(format!("{}/sse", server.uri()), &HashMap::new(), "test").unwrap();
        let err = client.list_tools().await.unwrap_err();
        assert_eq!(err.kind, mcpproxy_protocol::ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn not_found_surfaces_as_transport_error_for_auto_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(Vec::new(), "text/event-stream"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = SseCoreClient::new(format!("{}/sse", server.uri()), &HashMap::new(), "test").unwrap();
        let err = client.list_tools().await.unwrap_err();
        assert_eq!(err.kind, mcpproxy_protocol::ErrorKind::Transport);
    }
}
