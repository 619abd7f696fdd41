//! MCP 2024-11 method payloads: `initialize`, `tools/list`, `tools/call`.
//!
//! These are the only three methods this proxy's Core Client speaks to an
//! upstream (spec §4.1); everything else an upstream might support
//! (resources, prompts, sampling) is out of scope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::Annotations;

/// The MCP protocol revision this proxy negotiates.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

impl InitializeParams {
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: client_name.into(),
                version: client_version.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: ServerInfo,
}

/// A tool exactly as an upstream describes it on the wire, before the proxy
/// attaches `server_name`/`hash` and prefixes its name.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<RawTool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_params_serialize_with_camel_case_keys() {
        let params = InitializeParams::new("mcpproxy", "0.1.0");
        let raw = serde_json::to_value(&params).unwrap();
        assert_eq!(raw["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(raw["clientInfo"]["name"], "mcpproxy");
    }

    #[test]
    fn list_tools_result_parses_camel_case_input_schema() {
        let raw = serde_json::json!({
            "tools": [{
                "name": "echo",
                "description": "echoes input",
                "inputSchema": {"type": "object"},
            }]
        });
        let parsed: ListToolsResult = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.tools[0].name, "echo");
        assert_eq!(parsed.tools[0].input_schema["type"], "object");
    }
}
