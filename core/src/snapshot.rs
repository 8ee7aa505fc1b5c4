use crate::backend::{Backend, object_basename};
use crate::crypto::Encryptor;
use crate::{ChunkID, Error, Result, SnapshotID, TreeNode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SNAPSHOT_AAD: &[u8] = b"snapvault-snapshot";
const SNAPSHOT_PREFIX: &str = "snapshots";

/// Shortest prefix accepted when resolving a snapshot by partial id.
pub const MIN_ID_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Content hash of the serialized body; not part of the body itself.
    #[serde(skip)]
    pub id: SnapshotID,
    pub time: DateTime<Utc>,
    pub tree: ChunkID,
    pub paths: Vec<String>,
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SnapshotID>,
}

impl Snapshot {
    pub fn new(tree: ChunkID, paths: Vec<String>) -> Self {
        Self {
            id: SnapshotID::new(),
            time: Utc::now(),
            tree,
            paths,
            hostname: local_hostname(),
            username: local_username(),
            tags: Vec::new(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: SnapshotID) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn short_id(&self) -> String {
        self.id.chars().take(8).collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} paths on {} at {}",
            self.short_id(),
            self.paths.len(),
            self.hostname,
            self.time.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A directory listing. Nodes are kept sorted by name so that identical
/// directories serialize, and therefore deduplicate, identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn from_nodes(mut nodes: Vec<TreeNode>) -> Self {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Self { nodes }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8], object: &str) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::integrity(object, format!("malformed tree: {}", e)))
    }
}

/// Selects snapshots. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub hosts: Vec<String>,
    pub tags: Vec<String>,
    pub paths: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SnapshotFilter {
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        if !self.hosts.is_empty() && !self.hosts.iter().any(|h| *h == snapshot.hostname) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| snapshot.has_tag(t)) {
            return false;
        }
        if !self.paths.is_empty()
            && !self
                .paths
                .iter()
                .any(|p| snapshot.paths.iter().any(|sp| sp.contains(p.as_str())))
        {
            return false;
        }
        if self.since.is_some_and(|since| snapshot.time < since) {
            return false;
        }
        if self.until.is_some_and(|until| snapshot.time > until) {
            return false;
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.hosts.is_empty()
            && self.tags.is_empty()
            && self.paths.is_empty()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
    }

    /// Filters, orders newest first and truncates to `limit`.
    pub fn apply(&self, snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
        if self.is_empty() {
            return snapshots;
        }
        let mut selected: Vec<Snapshot> = snapshots.into_iter().filter(|s| self.matches(s)).collect();
        selected.sort_by(|a, b| b.time.cmp(&a.time));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

pub fn snapshot_object_name(id: &str) -> String {
    format!("{}/{}", SNAPSHOT_PREFIX, id)
}

/// Persists and resolves snapshot objects.
pub struct SnapshotManager {
    backend: Arc<dyn Backend>,
    encryptor: Arc<Encryptor>,
}

impl SnapshotManager {
    pub fn new(backend: Arc<dyn Backend>, encryptor: Arc<Encryptor>) -> Self {
        Self { backend, encryptor }
    }

    /// Stores the snapshot and returns it with its content-derived id set.
    pub async fn create(&self, mut snapshot: Snapshot) -> Result<Snapshot> {
        let body = serde_json::to_vec(&snapshot)?;
        let id = blake3::hash(&body).to_hex().to_string();
        let sealed = self.encryptor.seal(&body, SNAPSHOT_AAD)?;

        self.backend
            .write(&snapshot_object_name(&id), Bytes::from(sealed))
            .await?;

        snapshot.id = id;
        info!(snapshot = %snapshot.short_id(), tree = %snapshot.tree.short_string(), "Created snapshot");
        Ok(snapshot)
    }

    pub async fn list_ids(&self) -> Result<Vec<SnapshotID>> {
        let names = self.backend.list(SNAPSHOT_PREFIX).await?;
        Ok(names
            .iter()
            .map(|name| object_basename(name).to_string())
            .collect())
    }

    /// Loads every readable snapshot. Objects that fail to decrypt or parse
    /// are logged and skipped.
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        for id in self.list_ids().await? {
            match self.load(&id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(snapshot = %id, error = %e, "Skipping unreadable snapshot"),
            }
        }
        debug!(count = snapshots.len(), "Listed snapshots");
        Ok(snapshots)
    }

    /// Loads a snapshot by its full id, verifying that the body hashes to it.
    pub async fn load(&self, id: &str) -> Result<Snapshot> {
        let object = snapshot_object_name(id);
        if !self.backend.exists(&object).await? {
            return Err(Error::SnapshotNotFound { id: id.to_string() });
        }

        let sealed = self.backend.read(&object).await?;
        let body = self
            .encryptor
            .open(&sealed, SNAPSHOT_AAD)
            .map_err(|_| Error::integrity(&object, "snapshot failed authentication"))?;
        if blake3::hash(&body).to_hex().as_str() != id {
            return Err(Error::integrity(&object, "snapshot content does not match its id"));
        }

        let mut snapshot: Snapshot = serde_json::from_slice(&body)
            .map_err(|e| Error::integrity(&object, format!("malformed snapshot: {}", e)))?;
        snapshot.id = id.to_string();
        Ok(snapshot)
    }

    /// Deletes the snapshot object. Blobs it referenced stay in their packs.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let object = snapshot_object_name(id);
        if !self.backend.exists(&object).await? {
            return Err(Error::SnapshotNotFound { id: id.to_string() });
        }
        self.backend.delete(&object).await?;
        debug!(snapshot = %id, "Removed snapshot");
        Ok(())
    }

    /// Resolves a full id or a unique prefix of at least `MIN_ID_PREFIX` characters.
    pub async fn find(&self, prefix: &str) -> Result<Snapshot> {
        if prefix.len() < MIN_ID_PREFIX {
            return Err(Error::InvalidParams(format!(
                "snapshot id prefix '{}' is shorter than {} characters",
                prefix, MIN_ID_PREFIX
            )));
        }

        let ids = self.list_ids().await?;
        if ids.iter().any(|id| id == prefix) {
            return self.load(prefix).await;
        }

        let mut matches = ids.iter().filter(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => self.load(id).await,
            (None, _) => Err(Error::SnapshotNotFound { id: prefix.to_string() }),
            (Some(_), Some(_)) => Err(Error::InvalidParams(format!(
                "snapshot id prefix '{}' is ambiguous",
                prefix
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeType;
    use crate::crypto::MasterKey;
    use crate::memory::MemoryBackend;
    use chrono::Duration;

    fn manager() -> (Arc<MemoryBackend>, SnapshotManager) {
        let backend = Arc::new(MemoryBackend::new());
        let enc = Encryptor::new(MasterKey::generate().as_bytes()).unwrap();
        let manager = SnapshotManager::new(backend.clone(), Arc::new(enc));
        (backend, manager)
    }

    fn node(name: &str) -> TreeNode {
        TreeNode {
            name: name.to_string(),
            node_type: NodeType::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 1,
            mtime: 0,
            subtree_id: None,
            content: Vec::new(),
            link_target: None,
        }
    }

    #[test]
    fn test_tree_nodes_sorted() {
        let tree = Tree::from_nodes(vec![node("b"), node("c"), node("a")]);

        let names: Vec<_> = tree.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(tree, Tree::from_nodes(vec![node("c"), node("a"), node("b")]));
    }

    #[tokio::test]
    async fn test_create_load_and_find() {
        let (_, manager) = manager();
        let snapshot = Snapshot::new(ChunkID::from_data(b"root"), vec!["/home".into()])
            .with_tags(vec!["daily".into()]);

        let created = manager.create(snapshot).await.unwrap();
        assert_eq!(created.id.len(), 64);

        let loaded = manager.load(&created.id).await.unwrap();
        assert_eq!(loaded, created);

        let found = manager.find(&created.id[..8]).await.unwrap();
        assert_eq!(found.id, created.id);

        assert!(matches!(manager.find("abc").await, Err(Error::InvalidParams(_))));
        assert!(matches!(
            manager.load(&"0".repeat(64)).await,
            Err(Error::SnapshotNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_snapshot_skipped_in_list() {
        let (backend, manager) = manager();
        let a = manager
            .create(Snapshot::new(ChunkID::from_data(b"a"), vec!["/a".into()]))
            .await
            .unwrap();
        let b = manager
            .create(Snapshot::new(ChunkID::from_data(b"b"), vec!["/b".into()]))
            .await
            .unwrap();

        backend.flip_bit(&snapshot_object_name(&a.id), 20).unwrap();

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);
        assert!(matches!(manager.load(&a.id).await, Err(Error::Integrity { .. })));
    }

    #[test]
    fn test_filter() {
        let now = Utc::now();
        let mut old = Snapshot::new(ChunkID::from_data(b"1"), vec!["/srv/www".into()]);
        old.hostname = "web".into();
        old.time = now - Duration::days(3);
        old.id = "old".into();
        let mut new = Snapshot::new(ChunkID::from_data(b"2"), vec!["/home/me".into()])
            .with_tags(vec!["daily".into()]);
        new.hostname = "laptop".into();
        new.time = now;
        new.id = "new".into();

        let all = vec![old.clone(), new.clone()];

        let by_host = SnapshotFilter { hosts: vec!["web".into()], ..Default::default() };
        assert_eq!(by_host.apply(all.clone()), vec![old.clone()]);

        let by_tag = SnapshotFilter { tags: vec!["daily".into()], ..Default::default() };
        assert_eq!(by_tag.apply(all.clone()), vec![new.clone()]);

        let by_path = SnapshotFilter { paths: vec!["www".into()], ..Default::default() };
        assert_eq!(by_path.apply(all.clone()), vec![old.clone()]);

        let recent = SnapshotFilter { since: Some(now - Duration::days(1)), ..Default::default() };
        assert_eq!(recent.apply(all.clone()), vec![new.clone()]);

        let newest = SnapshotFilter { limit: Some(1), ..Default::default() };
        assert_eq!(newest.apply(all), vec![new]);
    }
}
