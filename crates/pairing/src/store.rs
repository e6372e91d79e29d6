//! File-backed paired-node store: one JSON file mapping nodeId → record.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tokio::sync::Mutex,
    tracing::debug,
};

use crate::now_ms;

/// A node that completed pairing. `token` is a bearer secret and must never
/// appear in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedNode {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub token: String,
    pub created_at_ms: i64,
    pub last_seen_at_ms: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown node {0}")]
    UnknownNode(String),
}

/// Durable map of nodeId → pairing record, backed by a single JSON file
/// under an application-private directory. All mutation is serialized behind
/// the store's lock and persisted before returning.
pub struct PairedNodeStore {
    path: PathBuf,
    nodes: Mutex<HashMap<String, PairedNode>>,
}

impl PairedNodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Default store location: `<data dir>/tether/paired-nodes.json`.
    pub fn default_path() -> Option<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "tether")?;
        Some(dirs.data_dir().join("paired-nodes.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the store file into memory. A missing file is an empty store,
    /// not an error. Returns the number of records loaded.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no paired-nodes file, starting empty");
                return Ok(0);
            },
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            },
        };
        let map: HashMap<String, PairedNode> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Json {
                path: self.path.clone(),
                source: e,
            })?;
        let count = map.len();
        *self.nodes.lock().await = map;
        debug!(count, "loaded paired nodes");
        Ok(count)
    }

    pub async fn find(&self, node_id: &str) -> Option<PairedNode> {
        self.nodes.lock().await.get(node_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.nodes.lock().await.len()
    }

    /// All records, sorted by node id.
    pub async fn all(&self) -> Vec<PairedNode> {
        let mut nodes: Vec<PairedNode> = self.nodes.lock().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Insert or replace the record for `node.node_id` and persist.
    /// Re-pairing overwrites the prior record under the same key.
    pub async fn upsert(&self, node: PairedNode) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().await;
        nodes.insert(node.node_id.clone(), node);
        self.persist(&nodes)
    }

    /// Bump `last_seen_at_ms` for a known node and persist.
    pub async fn touch_seen(&self, node_id: &str) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::UnknownNode(node_id.to_string()))?;
        node.last_seen_at_ms = now_ms();
        self.persist(&nodes)
    }

    fn persist(&self, nodes: &HashMap<String, PairedNode>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        }
        let data = serde_json::to_string_pretty(nodes).map_err(|e| StoreError::Json {
            path: self.path.clone(),
            source: e,
        })?;
        std::fs::write(&self.path, &data).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })?;

        // Tokens live in this file; keep it private to the user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).map_err(
                |e| StoreError::Io {
                    path: self.path.clone(),
                    source: e,
                },
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mint_token;

    fn record(node_id: &str) -> PairedNode {
        let now = now_ms();
        PairedNode {
            node_id: node_id.into(),
            display_name: Some("Test Node".into()),
            platform: Some("ios".into()),
            version: Some("1.0".into()),
            token: mint_token(),
            created_at_ms: now,
            last_seen_at_ms: now,
        }
    }

    #[tokio::test]
    async fn upsert_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedNodeStore::new(dir.path().join("paired-nodes.json"));
        store.upsert(record("n1")).await.unwrap();

        let found = store.find("n1").await.unwrap();
        assert_eq!(found.node_id, "n1");
        assert!(store.find("n2").await.is_none());
    }

    #[tokio::test]
    async fn load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired-nodes.json");

        let store = PairedNodeStore::new(&path);
        store.upsert(record("n1")).await.unwrap();
        store.upsert(record("n2")).await.unwrap();

        let reloaded = PairedNodeStore::new(&path);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert!(reloaded.find("n1").await.is_some());
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedNodeStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().await.unwrap(), 0);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn repair_overwrites_token_and_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedNodeStore::new(dir.path().join("paired-nodes.json"));

        store.upsert(record("n1")).await.unwrap();
        let first = store.find("n1").await.unwrap();

        store.upsert(record("n1")).await.unwrap();
        let second = store.find("n1").await.unwrap();

        assert_eq!(store.count().await, 1);
        assert_ne!(first.token, second.token);
    }

    #[tokio::test]
    async fn touch_seen_advances_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedNodeStore::new(dir.path().join("paired-nodes.json"));

        let mut node = record("n1");
        node.last_seen_at_ms = 0;
        store.upsert(node).await.unwrap();

        store.touch_seen("n1").await.unwrap();
        let touched = store.find("n1").await.unwrap();
        assert!(touched.last_seen_at_ms > 0);

        assert!(matches!(
            store.touch_seen("ghost").await,
            Err(StoreError::UnknownNode(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired-nodes.json");
        let store = PairedNodeStore::new(&path);
        store.upsert(record("n1")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
