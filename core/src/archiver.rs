use crate::chunker::Chunker;
use crate::repository::Repository;
use crate::snapshot::{Snapshot, Tree};
use crate::store::BlobStore;
use crate::{BlobType, ChunkID, Error, NodeType, Result, SnapshotID, TreeNode};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Chunks buffered between a file's reader thread and its uploader.
const CHUNK_QUEUE: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub tags: Vec<String>,
    /// Glob patterns matched against each entry's file name and its path
    /// relative to the backed-up root.
    pub excludes: Vec<String>,
    pub hostname: Option<String>,
    pub parent: Option<SnapshotID>,
}

impl BackupOptions {
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupSummary {
    pub snapshot_id: SnapshotID,
    pub tree: Option<ChunkID>,
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes_processed: u64,
    pub blobs_added: u64,
    pub bytes_added: u64,
    pub duration: Duration,
}

/// One filesystem entry found by the scan, keyed by its path inside the
/// snapshot (`<root name>/...`).
struct ScanEntry {
    rel: PathBuf,
    abs: PathBuf,
    depth: usize,
    node: TreeNode,
}

struct FileContent {
    chunks: Vec<ChunkID>,
    size: u64,
    /// Chunks that were not yet indexed when stored.
    pending: Vec<ChunkID>,
}

pub(crate) struct Archiver<'a> {
    repo: &'a Repository,
    options: &'a BackupOptions,
    excludes: Option<Arc<GlobSet>>,
}

impl<'a> Archiver<'a> {
    pub(crate) fn new(repo: &'a Repository, options: &'a BackupOptions) -> Result<Self> {
        Ok(Self {
            repo,
            options,
            excludes: build_globset(&options.excludes)?.map(Arc::new),
        })
    }

    pub(crate) async fn run(&self, paths: &[PathBuf]) -> Result<BackupSummary> {
        if paths.is_empty() {
            return Err(Error::InvalidParams("no paths to back up".to_string()));
        }
        let started = Instant::now();
        let before = self.repo.stats();
        let roots = resolve_roots(paths)?;

        let mut entries = Vec::new();
        for (name, abs) in &roots {
            entries.extend(scan_root(name.clone(), abs.clone(), self.excludes.clone()).await?);
        }
        debug!(entries = entries.len(), roots = roots.len(), "Scanned backup sources");

        let mut summary = BackupSummary::default();
        for entry in &entries {
            match entry.node.node_type {
                NodeType::File => summary.files += 1,
                NodeType::Directory => summary.dirs += 1,
                NodeType::Symlink => summary.symlinks += 1,
            }
        }

        // Every blob the snapshot references that was not durable when
        // stored, whether packed by this backup or by a concurrent one.
        let mut pending = HashSet::new();
        summary.bytes_processed = self.store_files(&mut entries, &mut pending).await?;
        let root_tree = self.assemble_trees(entries, &mut pending).await?;

        self.repo
            .store()
            .flush_pending(&pending)
            .await
            .map_err(|e| Error::backup_failed("flush", e))?;

        let mut snapshot = Snapshot::new(
            root_tree,
            roots.iter().map(|(_, abs)| abs.display().to_string()).collect(),
        )
        .with_tags(self.options.tags.clone());
        if let Some(hostname) = &self.options.hostname {
            snapshot = snapshot.with_hostname(hostname.clone());
        }
        if let Some(parent) = &self.options.parent {
            snapshot = snapshot.with_parent(parent.clone());
        }
        let snapshot = self
            .repo
            .snapshot_manager()
            .create(snapshot)
            .await
            .map_err(|e| Error::backup_failed("snapshot", e))?;

        let after = self.repo.stats();
        summary.snapshot_id = snapshot.id.clone();
        summary.tree = Some(root_tree);
        summary.blobs_added = after.blobs_added - before.blobs_added;
        summary.bytes_added = after.bytes_added - before.bytes_added;
        summary.duration = started.elapsed();

        info!(
            snapshot = %snapshot.short_id(),
            files = summary.files,
            dirs = summary.dirs,
            bytes = summary.bytes_processed,
            new_blobs = summary.blobs_added,
            "Backup complete"
        );
        Ok(summary)
    }

    /// Chunks and stores every regular file, at most `parallelism` at a time.
    /// Returns the number of content bytes read.
    async fn store_files(&self, entries: &mut [ScanEntry], pending: &mut HashSet<ChunkID>) -> Result<u64> {
        let semaphore = Arc::new(Semaphore::new(self.repo.parallelism()));
        let mut tasks = JoinSet::new();

        for (pos, entry) in entries.iter().enumerate() {
            if !entry.node.is_file() {
                continue;
            }
            let semaphore = semaphore.clone();
            let store = self.repo.store().clone();
            let chunker = self.repo.chunker();
            let path = entry.abs.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => store_file(store, chunker, path).await,
                    Err(e) => Err(Error::Other(e.to_string())),
                };
                (pos, result)
            });
        }

        let mut bytes = 0;
        while let Some(joined) = tasks.join_next().await {
            let (pos, result) = joined.map_err(|e| {
                Error::backup_failed("file worker", Error::Other(e.to_string()))
            })?;
            let entry = &mut entries[pos];
            let content = result
                .map_err(|e| Error::backup_failed(entry.rel.display().to_string(), e))?;
            debug!(path = %entry.rel.display(), chunks = content.chunks.len(), "Stored file");
            bytes += content.size;
            entry.node.size = content.size;
            entry.node.content = content.chunks;
            pending.extend(content.pending);
        }
        Ok(bytes)
    }

    /// Builds directory trees deepest first, so every subtree id is known
    /// before its parent is serialized. Returns the root tree id.
    async fn assemble_trees(&self, mut entries: Vec<ScanEntry>, pending: &mut HashSet<ChunkID>) -> Result<ChunkID> {
        entries.sort_by(|a, b| b.depth.cmp(&a.depth));
        let mut children: HashMap<PathBuf, Vec<TreeNode>> = HashMap::new();

        for mut entry in entries {
            if entry.node.is_dir() {
                let tree = Tree::from_nodes(children.remove(&entry.rel).unwrap_or_default());
                let id = self
                    .save_tree(&tree, pending)
                    .await
                    .map_err(|e| Error::backup_failed(entry.rel.display().to_string(), e))?;
                entry.node.subtree_id = Some(id);
            }
            let parent = entry.rel.parent().map(Path::to_path_buf).unwrap_or_default();
            children.entry(parent).or_default().push(entry.node);
        }

        let root = Tree::from_nodes(children.remove(Path::new("")).unwrap_or_default());
        self.save_tree(&root, pending)
            .await
            .map_err(|e| Error::backup_failed("root tree", e))
    }

    async fn save_tree(&self, tree: &Tree, pending: &mut HashSet<ChunkID>) -> Result<ChunkID> {
        let data = tree.to_bytes()?;
        let id = ChunkID::from_data(&data);
        let stored = self.repo.store().put_blob(BlobType::Tree, id, &data).await?;
        if !stored.indexed {
            pending.insert(id);
        }
        Ok(id)
    }
}

/// Streams one file through the chunker on a blocking thread and stores the
/// chunks in file order.
async fn store_file(store: Arc<BlobStore>, chunker: Chunker, path: PathBuf) -> Result<FileContent> {
    let (tx, mut rx) = mpsc::channel::<Result<(ChunkID, Vec<u8>)>>(CHUNK_QUEUE);

    let reader = tokio::task::spawn_blocking(move || {
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.blocking_send(Err(Error::Io(e)));
                return;
            }
        };
        for chunk in chunker.chunk_reader(std::io::BufReader::new(file)) {
            let item = chunk.map(|c| (c.id(), c.data));
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                return;
            }
        }
    });

    let mut content = FileContent {
        chunks: Vec::new(),
        size: 0,
        pending: Vec::new(),
    };
    while let Some(item) = rx.recv().await {
        let (id, data) = item?;
        let stored = store.put_blob(BlobType::Data, id, &data).await?;
        if !stored.indexed {
            content.pending.push(id);
        }
        content.size += data.len() as u64;
        content.chunks.push(id);
    }

    reader
        .await
        .map_err(|e| Error::Other(format!("chunk reader failed: {}", e)))?;
    Ok(content)
}

/// Pairs each root with the name it gets in the snapshot's root tree.
fn resolve_roots(paths: &[PathBuf]) -> Result<Vec<(String, PathBuf)>> {
    let mut seen = HashSet::new();
    let mut roots = Vec::with_capacity(paths.len());

    for path in paths {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidParams("empty backup path".to_string()));
        }
        let abs = std::path::absolute(path)
            .map_err(|e| Error::backup_failed(path.display().to_string(), e.into()))?;
        std::fs::symlink_metadata(&abs)
            .map_err(|e| Error::backup_failed(path.display().to_string(), e.into()))?;

        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .or_else(|| {
                abs.canonicalize()
                    .ok()
                    .and_then(|c| c.file_name().map(|n| n.to_string_lossy().to_string()))
            })
            .ok_or_else(|| {
                Error::InvalidParams(format!("cannot back up {} as a named root", path.display()))
            })?;

        if !seen.insert(name.clone()) {
            return Err(Error::InvalidParams(format!(
                "two backup paths share the name '{}'",
                name
            )));
        }
        roots.push((name, abs));
    }
    Ok(roots)
}

async fn scan_root(name: String, root: PathBuf, excludes: Option<Arc<GlobSet>>) -> Result<Vec<ScanEntry>> {
    let context = root.display().to_string();
    tokio::task::spawn_blocking(move || scan_root_blocking(&name, &root, excludes.as_deref()))
        .await
        .map_err(|e| Error::backup_failed(context, Error::Other(e.to_string())))?
}

fn scan_root_blocking(name: &str, root: &Path, excludes: Option<&GlobSet>) -> Result<Vec<ScanEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(excludes, root, e.path()));

    for item in walker {
        let entry = item.map_err(|e| {
            let context = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string());
            let source = match e.into_io_error() {
                Some(io) => Error::Io(io),
                None => Error::Other("filesystem loop detected".to_string()),
            };
            Error::backup_failed(context, source)
        })?;

        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(suffix) if suffix.as_os_str().is_empty() => PathBuf::from(name),
            Ok(suffix) => Path::new(name).join(suffix),
            Err(_) => continue,
        };
        let metadata = entry
            .metadata()
            .map_err(|e| Error::backup_failed(path.display().to_string(), Error::Other(e.to_string())))?;

        let file_type = metadata.file_type();
        let node_type = if file_type.is_dir() {
            NodeType::Directory
        } else if file_type.is_file() {
            NodeType::File
        } else if file_type.is_symlink() {
            NodeType::Symlink
        } else {
            warn!(path = %path.display(), "Skipping special file");
            continue;
        };

        let link_target = if node_type == NodeType::Symlink {
            let target = std::fs::read_link(path)
                .map_err(|e| Error::backup_failed(path.display().to_string(), e.into()))?;
            Some(target.to_string_lossy().to_string())
        } else {
            None
        };

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string());
        let mut node = node_from_metadata(file_name, node_type, &metadata);
        node.link_target = link_target;

        entries.push(ScanEntry {
            rel,
            abs: path.to_path_buf(),
            depth: entry.depth(),
            node,
        });
    }
    Ok(entries)
}

fn is_excluded(excludes: Option<&GlobSet>, root: &Path, path: &Path) -> bool {
    let Some(set) = excludes else {
        return false;
    };
    if path.file_name().is_some_and(|name| set.is_match(name)) {
        return true;
    }
    path.strip_prefix(root).is_ok_and(|rel| set.is_match(rel))
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InvalidParams(format!("invalid pattern '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::InvalidParams(e.to_string()))
}

fn node_from_metadata(name: String, node_type: NodeType, metadata: &Metadata) -> TreeNode {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    #[cfg(unix)]
    let (mode, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (metadata.mode(), metadata.uid(), metadata.gid())
    };
    #[cfg(not(unix))]
    let (mode, uid, gid) = (if metadata.is_dir() { 0o755 } else { 0o644 }, 0, 0);

    TreeNode {
        name,
        node_type,
        mode,
        uid,
        gid,
        size: if node_type == NodeType::File { metadata.len() } else { 0 },
        mtime,
        subtree_id: None,
        content: Vec::new(),
        link_target: None,
    }
}
