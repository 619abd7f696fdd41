//! Core Client: stateless MCP transport (spec §4.1).
//!
//! One [`Transport`] trait implemented by three concrete transports, unified
//! behind the [`CoreClient`] tagged enum so the Managed Client never deals
//! with a transport-specific type. Grounded on
//! `turbomcp-proxy::proxy::backend`'s `AnyClient` + `dispatch_client!` shape,
//! adapted from wrapping a third-party client to owning the wire protocol
//! directly.

mod http;
mod sse;
mod sse_frame;
mod stdio;

pub use http::StreamableHttpCoreClient;
pub use sse::SseCoreClient;
pub use stdio::StdioCoreClient;

use async_trait::async_trait;
use mcpproxy_protocol::{CallToolResult, InitializeParams, InitializeResult, RawTool, Result};

/// Maximum size, in bytes, of a single framed message in either direction.
/// Matches the 10 MB figure the rest of the workspace uses for request caps.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// The four operations spec.md §4.1 assigns the Core Client. Stateless
/// across calls: all retry/reconnect/auth state lives one level up, in the
/// Managed Client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult>;
    async fn list_tools(&self) -> Result<Vec<RawTool>>;
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<CallToolResult>;
    async fn close(&self) -> Result<()>;
}

/// Type-erased client wrapper supporting the three MCP transports, so the
/// Managed Client can hold one value regardless of which transport a
/// particular upstream negotiated.
pub enum CoreClient {
    Stdio(StdioCoreClient),
    StreamableHttp(StreamableHttpCoreClient),
    Sse(SseCoreClient),
}

macro_rules! dispatch_core {
    ($self:expr, $method:ident($($args:expr),*)) => {
        match $self {
            CoreClient::Stdio(c) => c.$method($($args),*).await,
            CoreClient::StreamableHttp(c) => c.$method($($args),*).await,
            CoreClient::Sse(c) => c.$method($($args),*).await,
        }
    };
}

#[async_trait]
impl Transport for CoreClient {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        dispatch_core!(self, initialize(params))
    }

    async fn list_tools(&self) -> Result<Vec<RawTool>> {
        dispatch_core!(self, list_tools())
    }

    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<CallToolResult> {
        dispatch_core!(self, call_tool(name, arguments))
    }

    async fn close(&self) -> Result<()> {
        dispatch_core!(self, close())
    }
}
