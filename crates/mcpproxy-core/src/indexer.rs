//! Tool indexing (spec §4.4): when a Managed Client reaches `Ready`, fetch
//! its tools, diff their hashes against the persisted snapshot for that
//! server, and submit the delta to the search index. Runs as a single
//! background task per spec §5 ("the tool indexer runs as a single
//! background task").
//!
//! The index itself lives in memory (`ToolIndex`), but each server's full
//! tool list — not just its hashes — is also mirrored to a JSON segment
//! under `<data_dir>/index/` (spec §6), so `retrieve_tools` can serve real
//! descriptions and schemas immediately after a restart instead of only
//! placeholder stubs until every upstream reconnects.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use mcpproxy_protocol::{compute_tool_hash, Tool};
use mcpproxy_storage::model::ToolHashSnapshot;
use mcpproxy_storage::Storage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mcpproxy_client::ManagedClient;
use mcpproxy_search::ToolIndex;

use crate::error::McpProxyResult;

/// Owns the one shared `ToolIndex` and knows how to reconcile it against a
/// single upstream's freshly listed tools.
pub struct Indexer {
    storage: Storage,
    index: Arc<Mutex<ToolIndex>>,
    index_dir: PathBuf,
}

impl Indexer {
    pub fn new(storage: Storage, index: Arc<Mutex<ToolIndex>>, index_dir: PathBuf) -> Self {
        Self {
            storage,
            index,
            index_dir,
        }
    }

    pub fn index(&self) -> Arc<Mutex<ToolIndex>> {
        self.index.clone()
    }

    fn segment_path(&self, server_name: &str) -> PathBuf {
        self.index_dir.join(format!("{server_name}.json"))
    }

    fn load_segment(&self, server_name: &str) -> Vec<Tool> {
        let path = self.segment_path(server_name);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt index segment, ignoring");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    fn save_segment(&self, server_name: &str, tools: &[Tool]) {
        if let Err(e) = std::fs::create_dir_all(&self.index_dir) {
            warn!(error = %e, "failed to create index directory");
            return;
        }
        let path = self.segment_path(server_name);
        match serde_json::to_vec(tools) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "failed to persist index segment");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize index segment"),
        }
    }

    fn remove_segment(&self, server_name: &str) {
        let _ = std::fs::remove_file(self.segment_path(server_name));
    }

    /// Rebuild the whole index from the on-disk JSON segments at startup,
    /// before any upstream has reconnected, so `retrieve_tools` has
    /// something to serve immediately from the last known-good state.
    /// Falls back to a hash-only stub (empty description/schema) for a
    /// server whose segment is missing or unreadable — replaced wholesale
    /// once that upstream reconnects.
    pub fn rebuild_from_storage(&self) -> McpProxyResult<()> {
        let mut all_tools = Vec::new();
        for record in self.storage.list_servers()? {
            let segment = self.load_segment(&record.name);
            if !segment.is_empty() {
                all_tools.extend(segment);
                continue;
            }
            let snapshot = self.storage.get_tool_hashes(&record.server_key)?;
            for (original_name, hash) in snapshot.hashes {
                all_tools.push(Tool {
                    server_name: record.name.clone(),
                    original_name,
                    description: String::new(),
                    input_schema: serde_json::json!({}),
                    annotations: Default::default(),
                    hash,
                });
            }
        }
        self.index.lock().rebuild(all_tools);
        Ok(())
    }

    /// Reconcile one upstream's tools after it reaches `Ready`: compute each
    /// tool's hash, diff against the persisted snapshot, upsert changed
    /// entries, remove dropped ones, and persist the new snapshot.
    pub async fn reconcile_server(&self, server_name: &str, client: &Arc<ManagedClient>) -> McpProxyResult<usize> {
        let server_key = client.server_key();
        let raw_tools = client.list_tools().await?;
        let previous = self.storage.get_tool_hashes(&server_key)?;

        let mut current = HashMap::new();
        let mut changed = 0usize;
        let mut segment = Vec::with_capacity(raw_tools.len());
        {
            let mut index = self.index.lock();
            for raw in &raw_tools {
                let hash = compute_tool_hash(&raw.name, &raw.description, &raw.input_schema);
                current.insert(raw.name.clone(), hash.clone());
                if previous.hashes.get(&raw.name) != Some(&hash) {
                    changed += 1;
                }
                let tool = Tool {
                    server_name: server_name.to_string(),
                    original_name: raw.name.clone(),
                    description: raw.description.clone(),
                    input_schema: raw.input_schema.clone(),
                    annotations: raw.annotations.clone(),
                    hash,
                };
                index.upsert(tool.clone());
                segment.push(tool);
            }
            for stale_name in previous.hashes.keys().filter(|name| !current.contains_key(*name)) {
                let prefixed = format!("{server_name}:{stale_name}");
                index.remove(&prefixed);
                changed += 1;
            }
        }

        self.storage
            .put_tool_hashes(&server_key, &ToolHashSnapshot { hashes: current })?;
        self.save_segment(server_name, &segment);
        if changed > 0 {
            debug!(server = %server_name, changed, "tool index reconciled");
        }
        Ok(changed)
    }

    /// Drop every tool belonging to a server, used on removal and on
    /// connection loss (so stale tools aren't served while disconnected).
    pub fn purge_server(&self, server_name: &str) {
        self.index.lock().purge_server(server_name);
        self.remove_segment(server_name);
    }

    pub async fn reconcile_or_warn(&self, server_name: &str, client: &Arc<ManagedClient>) {
        if let Err(e) = self.reconcile_server(server_name, client).await {
            warn!(server = %server_name, error = %e, "failed to reconcile tool index");
        } else {
            info!(server = %server_name, "tool index reconciled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_protocol::Annotations;

    fn make_indexer() -> (Indexer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("db")).unwrap();
        let index = Arc::new(Mutex::new(ToolIndex::new()));
        let indexer = Indexer::new(storage, index, dir.path().join("index"));
        (indexer, dir)
    }

    fn sample_tool(server: &str, name: &str) -> Tool {
        Tool {
            server_name: server.to_string(),
            original_name: name.to_string(),
            description: format!("does {name}"),
            input_schema: serde_json::json!({"type": "object"}),
            annotations: Annotations::default(),
            hash: compute_tool_hash(name, &format!("does {name}"), &serde_json::json!({"type": "object"})),
        }
    }

    #[test]
    fn save_and_load_segment_round_trips() {
        let (indexer, _dir) = make_indexer();
        let tools = vec![sample_tool("demo", "echo"), sample_tool("demo", "sum")];
        indexer.save_segment("demo", &tools);

        let loaded = indexer.load_segment("demo");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].original_name, "echo");
    }

    #[test]
    fn load_segment_is_empty_when_missing() {
        let (indexer, _dir) = make_indexer();
        assert!(indexer.load_segment("nonexistent").is_empty());
    }

    #[test]
    fn load_segment_ignores_corrupt_file() {
        let (indexer, dir) = make_indexer();
        std::fs::create_dir_all(dir.path().join("index")).unwrap();
        std::fs::write(dir.path().join("index/demo.json"), b"not json").unwrap();
        assert!(indexer.load_segment("demo").is_empty());
    }

    #[test]
    fn rebuild_from_storage_prefers_segment_over_hash_stub() {
        let (indexer, _dir) = make_indexer();
        let record = mcpproxy_storage::model::UpstreamServerRecord {
            server_key: "demo-key".to_string(),
            name: "demo".to_string(),
            transport: mcpproxy_storage::model::TransportConfig::Http {
                url: "http://localhost/".to_string(),
                headers: Default::default(),
                mode: "auto".to_string(),
            },
            oauth: None,
            isolation: None,
            enabled: true,
            quarantined: false,
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
        };
        indexer.storage.put_server(&record).unwrap();
        indexer.save_segment("demo", &[sample_tool("demo", "echo")]);

        indexer.rebuild_from_storage().unwrap();
        let results = indexer.index.lock().retrieve_tools("echo", 10);
        assert!(results
            .iter()
            .any(|r| r.prefixed_name == "demo:echo" && !r.description.is_empty()));
    }

    #[test]
    fn purge_server_removes_segment_file() {
        let (indexer, dir) = make_indexer();
        indexer.save_segment("demo", &[sample_tool("demo", "echo")]);
        assert!(dir.path().join("index/demo.json").exists());

        indexer.purge_server("demo");
        assert!(!dir.path().join("index/demo.json").exists());
    }
}
