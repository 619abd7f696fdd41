//! Embedded ordered key-value store with named logical partitions ("buckets").
//!
//! Backed by `sled`, whose `Tree`s already serialize individual writes; the
//! `parking_lot::Mutex` per bucket held here exists one level up, to make
//! multi-step read-modify-write sequences (patch-server, activity-retention
//! eviction) atomic from the caller's point of view — sled gives us
//! durability and ordering per key, not cross-call atomicity.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::model::{ActivityRecord, OAuthTokenRecord, ToolHashSnapshot, UpstreamServerRecord};

const TREE_SERVERS: &str = "servers";
const TREE_OAUTH_TOKENS: &str = "oauth_tokens";
const TREE_TOOL_HASHES: &str = "tool_hashes";
const TREE_ACTIVITY: &str = "activity";
const TREE_META: &str = "meta";

/// Activity retention policy: 7 days or 10k rows, whichever hits first.
pub const ACTIVITY_RETENTION: chrono::Duration = chrono::Duration::days(7);
pub const ACTIVITY_MAX_ROWS: usize = 10_000;

#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    servers: sled::Tree,
    oauth_tokens: sled::Tree,
    tool_hashes: sled::Tree,
    activity: sled::Tree,
    meta: sled::Tree,
    write_lock: Arc<Mutex<()>>,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            servers: db.open_tree(TREE_SERVERS)?,
            oauth_tokens: db.open_tree(TREE_OAUTH_TOKENS)?,
            tool_hashes: db.open_tree(TREE_TOOL_HASHES)?,
            activity: db.open_tree(TREE_ACTIVITY)?,
            meta: db.open_tree(TREE_META)?,
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ---- servers -----------------------------------------------------

    pub fn put_server(&self, record: &UpstreamServerRecord) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        put_json(&self.servers, &record.server_key, record)
    }

    pub fn get_server(&self, server_key: &str) -> StorageResult<Option<UpstreamServerRecord>> {
        get_json(&self.servers, server_key)
    }

    pub fn remove_server(&self, server_key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        self.servers.remove(server_key.as_bytes())?;
        self.tool_hashes.remove(server_key.as_bytes())?;
        self.oauth_tokens.remove(server_key.as_bytes())?;
        Ok(())
    }

    pub fn list_servers(&self) -> StorageResult<Vec<UpstreamServerRecord>> {
        list_json(&self.servers)
    }

    // ---- oauth tokens --------------------------------------------------

    pub fn put_token(&self, record: &OAuthTokenRecord) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        put_json(&self.oauth_tokens, &record.server_key, record)
    }

    pub fn get_token(&self, server_key: &str) -> StorageResult<Option<OAuthTokenRecord>> {
        get_json(&self.oauth_tokens, server_key)
    }

    pub fn clear_token(&self, server_key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        self.oauth_tokens.remove(server_key.as_bytes())?;
        Ok(())
    }

    pub fn list_tokens(&self) -> StorageResult<Vec<OAuthTokenRecord>> {
        list_json(&self.oauth_tokens)
    }

    // ---- tool hashes ----------------------------------------------------

    pub fn get_tool_hashes(&self, server_key: &str) -> StorageResult<ToolHashSnapshot> {
        Ok(get_json(&self.tool_hashes, server_key)?.unwrap_or_default())
    }

    pub fn put_tool_hashes(&self, server_key: &str, snapshot: &ToolHashSnapshot) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        put_json(&self.tool_hashes, server_key, snapshot)
    }

    // ---- activity -------------------------------------------------------

    /// Append an activity record and enforce retention. Never returns an
    /// error path that would block the caller's request; callers that can't
    /// afford to wait should fire this on a spawned task.
    pub fn append_activity(&self, record: &ActivityRecord) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        put_json(&self.activity, &record.id, record)?;
        self.enforce_retention_locked()
    }

    fn enforce_retention_locked(&self) -> StorageResult<()> {
        let cutoff = chrono::Utc::now() - ACTIVITY_RETENTION;
        let mut keys_in_order: Vec<(sled::IVec, ActivityRecord)> = Vec::new();
        for entry in self.activity.iter() {
            let (k, v) = entry?;
            let record: ActivityRecord = serde_json::from_slice(&v)?;
            keys_in_order.push((k, record));
        }
        // ULID ids sort lexically by creation time, so tree-iteration order
        // is already chronological; no extra sort needed.
        let mut evicted = 0usize;
        let overflow = keys_in_order.len().saturating_sub(ACTIVITY_MAX_ROWS);
        for (idx, (key, record)) in keys_in_order.iter().enumerate() {
            let too_old = record.timestamp < cutoff;
            let over_cap = idx < overflow;
            if too_old || over_cap {
                self.activity.remove(key)?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "evicted activity records past retention policy");
        }
        Ok(())
    }

    pub fn get_activity(&self, id: &str) -> StorageResult<Option<ActivityRecord>> {
        get_json(&self.activity, id)
    }

    pub fn list_activity(&self) -> StorageResult<Vec<ActivityRecord>> {
        list_json(&self.activity)
    }

    // ---- meta (singleton config values: api key, etc.) ------------------

    pub fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        match self.meta.get(key.as_bytes())? {
            Some(ivec) => Ok(Some(
                String::from_utf8(ivec.to_vec()).map_err(|e| {
                    warn!("non-utf8 meta value for {key}: {e}");
                    StorageError::NotFound(key.to_string())
                })?,
            )),
            None => Ok(None),
        }
    }

    pub fn put_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        self.meta.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }
}

fn put_json<T: Serialize>(tree: &sled::Tree, key: &str, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

fn get_json<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> StorageResult<Option<T>> {
    match tree.get(key.as_bytes())? {
        Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
        None => Ok(None),
    }
}

fn list_json<T: DeserializeOwned>(tree: &sled::Tree) -> StorageResult<Vec<T>> {
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (_, v) = entry?;
        out.push(serde_json::from_slice(&v)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransportConfig;

    fn sample_server(key: &str) -> UpstreamServerRecord {
        let now = chrono::Utc::now();
        UpstreamServerRecord {
            server_key: key.to_string(),
            name: "x".to_string(),
            transport: TransportConfig::Http {
                url: "http://u/".to_string(),
                headers: Default::default(),
                mode: "auto".to_string(),
            },
            enabled: true,
            quarantined: true,
            created: now,
            updated: now,
            oauth: None,
            isolation: None,
        }
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let record = sample_server("x_aabbccdd");
        storage.put_server(&record).unwrap();
        let loaded = storage.get_server("x_aabbccdd").unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn remove_server_clears_oauth_and_hashes_too() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let record = sample_server("x_aabbccdd");
        storage.put_server(&record).unwrap();
        storage
            .put_token(&OAuthTokenRecord {
                server_key: "x_aabbccdd".to_string(),
                access_token: "tok".to_string(),
                refresh_token: None,
                token_type: "Bearer".to_string(),
                expires_at: chrono::Utc::now(),
                scopes: vec![],
                created: chrono::Utc::now(),
                updated: chrono::Utc::now(),
                client_id: None,
                client_secret: None,
                callback_port: None,
                redirect_uri: None,
            })
            .unwrap();

        storage.remove_server("x_aabbccdd").unwrap();

        assert!(storage.get_server("x_aabbccdd").unwrap().is_none());
        assert!(storage.get_token("x_aabbccdd").unwrap().is_none());
    }

    #[test]
    fn activity_retention_evicts_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        for i in 0..5 {
            let record = ActivityRecord {
                id: ulid::Ulid::new().to_string(),
                kind: crate::model::ActivityType::ToolCall,
                source: "test".into(),
                server_name: None,
                tool_name: None,
                arguments: None,
                response: None,
                status: "ok".into(),
                error_message: None,
                duration_ms: i,
                timestamp: chrono::Utc::now(),
                session_id: None,
                request_id: None,
                metadata: Default::default(),
            };
            storage.append_activity(&record).unwrap();
        }
        assert_eq!(storage.list_activity().unwrap().len(), 5);
    }
}
