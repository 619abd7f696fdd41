//! Stdio Core Client: newline-delimited JSON-RPC over a child process's
//! stdin/stdout, multiplexed by request id.
//!
//! Interior mutability follows the same hybrid pattern `turbomcp-stdio`
//! documents: short-lived `std::sync::Mutex`/atomics for state that never
//! crosses an `.await`, `tokio::sync::Mutex` for the writer half that does.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use mcpproxy_protocol::{
    jsonrpc::{InboundFrame, JsonRpcId, JsonRpcRequest},
    CallToolParams, CallToolResult, Error, InitializeParams, InitializeResult, ListToolsResult,
    RawTool, Result,
};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

use super::Transport;

type Writer = FramedWrite<ChildStdin, LinesCodec>;
type Reader = FramedRead<BufReader<ChildStdout>, LinesCodec>;

/// One spawned upstream process speaking MCP over stdio.
pub struct StdioCoreClient {
    server_name: String,
    child: AsyncMutex<Child>,
    stdin: AsyncMutex<Writer>,
    next_id: AtomicI64,
    pending: Arc<DashMap<JsonRpcId, oneshot::Sender<mcpproxy_protocol::JsonRpcResponse>>>,
    reader_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioCoreClient {
    /// Spawn `command` with `args`/`env`/`working_dir` and wire up the
    /// reader loop that dispatches responses to waiters by id and logs
    /// server-initiated notifications and stderr lines.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&str>,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let server_name = server_name.into();
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transport(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("child stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("child stdout was not piped"))?;
        let stderr = child.stderr.take();

        let writer = FramedWrite::new(stdin, LinesCodec::new());
        let reader = FramedRead::new(BufReader::new(stdout), LinesCodec::new());

        let pending: Arc<DashMap<JsonRpcId, oneshot::Sender<mcpproxy_protocol::JsonRpcResponse>>> =
            Arc::new(DashMap::new());

        let reader_task = tokio::spawn(run_reader_loop(reader, pending.clone(), server_name.clone()));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr, server_name.clone()));
        }

        Ok(Self {
            server_name,
            child: AsyncMutex::new(child),
            stdin: AsyncMutex::new(writer),
            next_id: AtomicI64::new(1),
            pending,
            reader_task: AsyncMutex::new(Some(reader_task)),
        })
    }

    async fn request(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let id = JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let line = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let mut stdin = self.stdin.lock().await;
        if let Err(e) = stdin.send(line).await {
            self.pending.remove(&id);
            return Err(Error::transport(format!(
                "{}: failed to write to child stdin: {e}",
                self.server_name
            )));
        }
        drop(stdin);

        let response = rx.await.map_err(|_| {
            Error::canceled(format!(
                "{}: connection closed while awaiting response to {method}",
                self.server_name
            ))
        })?;
        response.into_result().map_err(|e| Error::upstream(e.code, e.message))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = mcpproxy_protocol::jsonrpc::JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params: None,
        };
        let line = serde_json::to_string(&notification)?;
        self.stdin
            .lock()
            .await
            .send(line)
            .await
            .map_err(|e| Error::transport(format!("{}: failed to send notification: {e}", self.server_name)))
    }
}

async fn run_reader_loop(
    mut reader: Reader,
    pending: Arc<DashMap<JsonRpcId, oneshot::Sender<mcpproxy_protocol::JsonRpcResponse>>>,
    server_name: String,
) {
    loop {
        match reader.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match mcpproxy_protocol::jsonrpc::parse_inbound(&line) {
                    Ok(InboundFrame::Response(response)) => {
                        if let Some((_, tx)) = pending.remove(&response.id) {
                            let _ = tx.send(response);
                        } else {
                            warn!(server = %server_name, id = ?response.id, "response for unknown request id");
                        }
                    }
                    Ok(InboundFrame::Notification(notification)) => {
                        trace!(server = %server_name, method = %notification.method, "upstream notification");
                    }
                    Err(e) => {
                        warn!(server = %server_name, error = %e, "malformed frame from upstream");
                    }
                }
            }
            Some(Err(e)) => {
                warn!(server = %server_name, error = %e, "stdio read error; closing");
                break;
            }
            None => {
                debug!(server = %server_name, "upstream stdout closed");
                break;
            }
        }
    }

    for (_, tx) in pending_drain(&pending) {
        let _ = tx.send(canceled_response());
    }
}

fn pending_drain(
    pending: &Arc<DashMap<JsonRpcId, oneshot::Sender<mcpproxy_protocol::JsonRpcResponse>>>,
) -> Vec<(JsonRpcId, oneshot::Sender<mcpproxy_protocol::JsonRpcResponse>)> {
    let keys: Vec<JsonRpcId> = pending.iter().map(|e| e.key().clone()).collect();
    keys.into_iter()
        .filter_map(|k| pending.remove(&k))
        .collect()
}

fn canceled_response() -> mcpproxy_protocol::JsonRpcResponse {
    mcpproxy_protocol::JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: JsonRpcId::Number(-1),
        result: None,
        error: Some(mcpproxy_protocol::JsonRpcError {
            code: -32000,
            message: "connection closed".to_string(),
            data: None,
        }),
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr, server_name: String) {
    use tokio::io::AsyncBufReadExt;
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(server = %server_name, stderr = %line, "upstream stderr"),
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server_name, error = %e, "error reading upstream stderr");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioCoreClient {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let value = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        self.notify("notifications/initialized").await?;
        Ok(result)
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
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            warn!(server = %self.server_name, error = %e, "failed to signal child process");
        }
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await;
        Ok(())
    }
}
