//! `ToolIndex`: the search-facing wrapper around `Bm25Index` that speaks in
//! `Tool`s rather than raw text, and applies the substring-boost and
//! variant-recommendation rules from spec §4.4.

use std::collections::HashMap;

use mcpproxy_protocol::{Annotations, Tool, ToolVariant};
use serde::{Deserialize, Serialize};

use crate::bm25::Bm25Index;
use crate::tokenizer::tokenize;

pub const DEFAULT_LIMIT: usize = 5;

/// Boost multiplier applied when the raw query string is a substring of the
/// tool's unprefixed name — a cheap exact-ish-match signal BM25 alone won't
/// capture for short tool names like `ls` or `grep`.
const SUBSTRING_BOOST: f64 = 1.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub prefixed_name: String,
    pub description: String,
    pub annotations: Annotations,
    pub recommended_variant: ToolVariant,
    pub score: f64,
}

#[derive(Default)]
pub struct ToolIndex {
    bm25: Bm25Index,
    tools: HashMap<String, Tool>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Index or re-index one tool.
    pub fn upsert(&mut self, tool: Tool) {
        let doc_id = tool.prefixed_name();
        let text = format!("{} {}", tool.original_name, tool.description);
        self.bm25.upsert(&doc_id, &text);
        self.tools.insert(doc_id, tool);
    }

    /// Remove one tool by its prefixed name.
    pub fn remove(&mut self, prefixed_name: &str) {
        self.bm25.remove(prefixed_name);
        self.tools.remove(prefixed_name);
    }

    /// Purge every tool belonging to `server_name` — used on server removal
    /// and on full re-index after a connection drop.
    pub fn purge_server(&mut self, server_name: &str) {
        let prefix = format!("{server_name}:");
        self.bm25.remove_where(|id| id.starts_with(&prefix));
        self.tools.retain(|id, _| !id.starts_with(&prefix));
    }

    /// Rebuild the whole index from a fresh set of tools (used at startup
    /// from storage, and whenever the caller wants a clean slate).
    pub fn rebuild(&mut self, tools: impl IntoIterator<Item = Tool>) {
        self.bm25 = Bm25Index::new();
        self.tools.clear();
        for tool in tools {
            self.upsert(tool);
        }
    }

    pub fn retrieve_tools(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        let limit = limit.max(1);
        let terms = tokenize(query);
        let query_lower = query.to_lowercase();

        let mut scored = self.bm25.score(&terms);
        for (doc_id, score) in &mut scored {
            let boosted = self
                .tools
                .get(doc_id)
                .map(|tool| {
                    !query_lower.is_empty() && tool.original_name.to_lowercase().contains(&query_lower)
                })
                .unwrap_or(false);
            if boosted {
                *score *= SUBSTRING_BOOST;
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(limit)
            .filter_map(|(doc_id, score)| {
                let tool = self.tools.get(&doc_id)?;
                Some(SearchResult {
                    prefixed_name: tool.prefixed_name(),
                    description: tool.description.clone(),
                    annotations: tool.annotations.clone(),
                    recommended_variant: tool.recommended_variant(),
                    score,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: &str, name: &str, desc: &str) -> Tool {
        Tool {
            server_name: server.to_string(),
            original_name: name.to_string(),
            description: desc.to_string(),
            input_schema: json!({}),
            annotations: Annotations::default(),
            hash: "h".to_string(),
        }
    }

    #[test]
    fn rebuild_equals_union_of_upstream_tools() {
        let mut index = ToolIndex::new();
        index.rebuild(vec![
            tool("a", "one", "first tool"),
            tool("b", "two", "second tool"),
        ]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn purge_server_removes_only_its_prefix() {
        let mut index = ToolIndex::new();
        index.upsert(tool("a", "one", "first"));
        index.upsert(tool("b", "two", "second"));
        index.purge_server("a");
        assert_eq!(index.len(), 1);
        assert!(index.retrieve_tools("second", 5).iter().any(|r| r.prefixed_name == "b:two"));
    }

    #[test]
    fn substring_match_boosts_over_longer_description_match() {
        let mut index = ToolIndex::new();
        index.upsert(tool("a", "echo", "echoes the input back"));
        index.upsert(tool("b", "logger", "echo style structured logging utility"));
        let results = index.retrieve_tools("echo", 5);
        assert_eq!(results[0].prefixed_name, "a:echo");
    }

    #[test]
    fn default_limit_is_five() {
        assert_eq!(DEFAULT_LIMIT, 5);
    }
}
