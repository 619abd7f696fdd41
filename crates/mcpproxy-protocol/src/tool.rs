//! The `Tool` type as discovered from upstreams and as indexed/dispatched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read/write/destructive hints an upstream advertises for a tool. Absent
/// fields default to the conservative "unknown" reading used by the router
/// when picking a `call_tool_*` variant recommendation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default, rename = "readOnlyHint")]
    pub read_only: Option<bool>,
    #[serde(default, rename = "destructiveHint")]
    pub destructive: Option<bool>,
    #[serde(default, rename = "idempotentHint")]
    pub idempotent: Option<bool>,
}

/// The three dispatch variants exposed to agents. Chosen from `Annotations`;
/// `Write` is the default when annotations are absent, per spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolVariant {
    Read,
    Write,
    Destructive,
}

impl ToolVariant {
    pub fn from_annotations(annotations: &Annotations) -> Self {
        if annotations.destructive == Some(true) {
            ToolVariant::Destructive
        } else if annotations.read_only == Some(true) {
            ToolVariant::Read
        } else {
            ToolVariant::Write
        }
    }

    pub fn as_tool_name(self) -> &'static str {
        match self {
            ToolVariant::Read => "call_tool_read",
            ToolVariant::Write => "call_tool_write",
            ToolVariant::Destructive => "call_tool_destructive",
        }
    }
}

/// Opaque JSON Schema for tool input, kept as `Value` since the proxy never
/// validates it itself — upstreams do.
pub type InputSchema = Value;

/// A tool as discovered from an upstream. `hash` is computed by the indexer,
/// not the upstream, and is stable across re-serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub server_name: String,
    pub original_name: String,
    pub description: String,
    pub input_schema: InputSchema,
    #[serde(default)]
    pub annotations: Annotations,
    pub hash: String,
}

impl Tool {
    pub fn prefixed_name(&self) -> String {
        format!("{}:{}", self.server_name, self.original_name)
    }

    pub fn recommended_variant(&self) -> ToolVariant {
        ToolVariant::from_annotations(&self.annotations)
    }

    /// Parse `server:tool` into its parts. Rejects empty halves and multiple
    /// colons beyond the first (a tool name may itself be `server:a:b` only
    /// if the server name doesn't contain a colon — MCP tool names don't, so
    /// splitting on the first colon is unambiguous).
    pub fn parse_prefixed(prefixed: &str) -> Option<(&str, &str)> {
        let (server, tool) = prefixed.split_once(':')?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some((server, tool))
    }
}

/// Stable digest over name + description + schema, used to diff an
/// upstream's tool list against what's already indexed.
pub fn compute_tool_hash(name: &str, description: &str, schema: &Value) -> String {
    use sha2::{Digest, Sha256};
    let canonical = canonicalize(schema);
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(description.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Re-serialize a JSON value with sorted object keys so that hash stability
/// doesn't depend on an upstream's field ordering.
fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted = std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), sort(v));
                }
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = serde_json::json!({"type": "object", "properties": {"x": 1, "y": 2}});
        let b = serde_json::json!({"properties": {"y": 2, "x": 1}, "type": "object"});
        assert_eq!(
            compute_tool_hash("t", "d", &a),
            compute_tool_hash("t", "d", &b)
        );
    }

    #[test]
    fn variant_defaults_to_write() {
        let annotations = Annotations::default();
        assert_eq!(ToolVariant::from_annotations(&annotations), ToolVariant::Write);
    }

    #[test]
    fn destructive_wins_over_read_only() {
        let annotations = Annotations {
            read_only: Some(true),
            destructive: Some(true),
            idempotent: None,
        };
        assert_eq!(
            ToolVariant::from_annotations(&annotations),
            ToolVariant::Destructive
        );
    }

    #[test]
    fn parse_prefixed_rejects_malformed() {
        assert!(Tool::parse_prefixed("noserver").is_none());
        assert!(Tool::parse_prefixed(":tool").is_none());
        assert!(Tool::parse_prefixed("server:").is_none());
        assert_eq!(Tool::parse_prefixed("server:tool"), Some(("server", "tool")));
    }
}
