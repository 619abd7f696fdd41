//! Wire-level MCP types shared by every other `mcpproxy` crate.
//!
//! This crate owns the JSON-RPC envelope, the MCP 2024-11 method payloads
//! the proxy actually speaks (`initialize`, `tools/list`, `tools/call`), and
//! the error taxonomy that the transport, OAuth and routing layers all
//! convert into.

pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod tool;

pub use error::{Error, ErrorKind, Result};
pub use jsonrpc::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
pub use methods::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    ListToolsResult, RawTool, ServerInfo, PROTOCOL_VERSION,
};
pub use tool::{compute_tool_hash, Annotations, InputSchema, Tool, ToolVariant};
