use crate::archiver::{Archiver, BackupOptions, BackupSummary};
use crate::backend::{Backend, TimeoutBackend};
use crate::checker::{CheckDepth, CheckReport, Checker};
use crate::chunker::Chunker;
use crate::crypto::{Encryptor, KeyFile, MasterKey};
use crate::forget::{ForgetGroup, ForgetPolicy, ForgetSummary, group_snapshots};
use crate::index::{Index, load_index};
use crate::restorer::{RestoreOptions, RestoreSummary, Restorer};
use crate::snapshot::{Snapshot, SnapshotFilter, SnapshotManager, Tree};
use crate::store::{BlobStore, StoreStats};
use crate::{BlobType, ChunkID, ChunkerParams, Error, KdfParams, REPO_FORMAT_VERSION, RepoConfig, Result};
use bytes::Bytes;
use fastcdc::v2020::{AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_OBJECT: &str = "config";
const CONFIG_AAD: &[u8] = b"snapvault-config";
const KEYS_PREFIX: &str = "keys";

pub const DEFAULT_PACK_SIZE: u64 = 16 * 1024 * 1024;

/// Session options. Chunker, pack size and KDF settings only apply when a
/// repository is created; an opened repository uses its stored config.
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    pub parallelism: usize,
    pub io_timeout: Option<Duration>,
    pub pack_size: u64,
    pub chunker: ChunkerParams,
    pub kdf: KdfParams,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            io_timeout: None,
            pack_size: DEFAULT_PACK_SIZE,
            chunker: ChunkerParams::default(),
            kdf: KdfParams::default(),
        }
    }
}

impl RepositoryOptions {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        let c = &self.chunker;
        if c.min_size == 0 || c.min_size > c.avg_size || c.avg_size > c.max_size {
            return Err(Error::InvalidParams(format!(
                "chunker sizes must satisfy 0 < min <= avg <= max (got {}/{}/{})",
                c.min_size, c.avg_size, c.max_size
            )));
        }
        check_bound("minimum", c.min_size, MINIMUM_MIN, MINIMUM_MAX)?;
        check_bound("average", c.avg_size, AVERAGE_MIN, AVERAGE_MAX)?;
        check_bound("maximum", c.max_size, MAXIMUM_MIN, MAXIMUM_MAX)?;
        if self.pack_size == 0 {
            return Err(Error::InvalidParams("pack size must be positive".to_string()));
        }
        Ok(())
    }
}

fn check_bound(name: &str, value: u32, lo: u32, hi: u32) -> Result<()> {
    if (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(Error::InvalidParams(format!(
            "{} chunk size {} outside {}..={}",
            name, value, lo, hi
        )))
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// An open repository session.
///
/// A repository manages all backup data including snapshots, pack files,
/// indices, and encryption keys. Every operation fails with
/// `Error::RepositoryClosed` once `close` has been called.
///
/// # Repository Structure
///
/// ```text
/// repository/
/// ├── config          # Sealed repository configuration
/// ├── keys/           # Data key sealed under the password key
/// ├── data/           # Pack files holding data and tree blobs
/// ├── index/          # One index object per pack
/// └── snapshots/      # Sealed snapshot metadata
/// ```
///
/// # Examples
///
/// ```no_run
/// use snapvault_core::{MemoryBackend, Repository, RepositoryOptions};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> snapvault_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new());
///     let repo = Repository::init(backend.clone(), "my-password", RepositoryOptions::default()).await?;
///     repo.close().await;
///
///     let repo = Repository::open(backend, "my-password", RepositoryOptions::default()).await?;
///     repo.close().await;
///     Ok(())
/// }
/// ```
pub struct Repository {
    backend: Arc<dyn Backend>,
    config: RepoConfig,
    store: Arc<BlobStore>,
    snapshots: SnapshotManager,
    chunker: Chunker,
    parallelism: usize,
    closed: AtomicBool,
}

impl Repository {
    /// Creates a new repository on the backend.
    ///
    /// Writes a key file holding a fresh random data key sealed under the
    /// password, then the sealed config.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryExists` - a config object is already present
    /// * `Error::InvalidParams` - empty password or inconsistent options
    pub async fn init(backend: Arc<dyn Backend>, password: &str, options: RepositoryOptions) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::InvalidParams("password must not be empty".to_string()));
        }
        options.validate()?;
        let backend = wrap_backend(backend, &options);

        backend.init().await?;
        if backend.exists(CONFIG_OBJECT).await? {
            return Err(Error::RepositoryExists {
                location: backend.location(),
            });
        }

        let data_key = MasterKey::generate();
        let encryptor = Encryptor::new(data_key.as_bytes())?;
        let key_file = {
            let password = password.to_string();
            let kdf = options.kdf.clone();
            tokio::task::spawn_blocking(move || KeyFile::create(&password, &data_key, kdf))
                .await
                .map_err(|e| Error::Other(format!("key derivation task failed: {}", e)))??
        };
        let key_name = format!("{}/{}", KEYS_PREFIX, uuid::Uuid::new_v4().simple());
        backend
            .write(&key_name, Bytes::from(serde_json::to_vec_pretty(&key_file)?))
            .await?;

        let config = RepoConfig::new(options.chunker, options.pack_size);
        let written = match serde_json::to_vec(&config)
            .map_err(Error::from)
            .and_then(|json| encryptor.seal(&json, CONFIG_AAD))
        {
            Ok(sealed) => backend.write(CONFIG_OBJECT, Bytes::from(sealed)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = backend.delete(&key_name).await {
                warn!(object = %key_name, error = %cleanup, "Failed to remove key file after aborted init");
            }
            return Err(e);
        }

        info!(location = %backend.location(), repo = %config.id, "Initialized repository");
        Ok(Self::assemble(backend, config, encryptor, Index::new(), options.parallelism))
    }

    /// Opens an existing repository, unlocking it with the password.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - no config or key file on the backend
    /// * `Error::InvalidPassword` - no key file unlocks with the password
    /// * `Error::InvalidFormatVersion` - unsupported repository version
    pub async fn open(backend: Arc<dyn Backend>, password: &str, options: RepositoryOptions) -> Result<Self> {
        let backend = wrap_backend(backend, &options);

        if !backend.exists(CONFIG_OBJECT).await? {
            return Err(Error::RepositoryNotFound {
                location: backend.location(),
            });
        }

        let encryptor = unlock(backend.as_ref(), password).await?;

        let sealed = backend.read(CONFIG_OBJECT).await?;
        let json = encryptor
            .open(&sealed, CONFIG_AAD)
            .map_err(|_| Error::integrity(CONFIG_OBJECT, "config failed authentication"))?;
        let config: RepoConfig = serde_json::from_slice(&json)
            .map_err(|e| Error::integrity(CONFIG_OBJECT, format!("malformed config: {}", e)))?;
        if config.version != REPO_FORMAT_VERSION {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }

        let index = load_index(backend.as_ref(), &encryptor).await?;
        info!(
            location = %backend.location(),
            repo = %config.id,
            blobs = index.len(),
            packs = index.packs.len(),
            "Opened repository"
        );
        Ok(Self::assemble(backend, config, encryptor, index, options.parallelism))
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        config: RepoConfig,
        encryptor: Encryptor,
        index: Index,
        parallelism: usize,
    ) -> Self {
        let encryptor = Arc::new(encryptor);
        let store = Arc::new(BlobStore::new(
            backend.clone(),
            encryptor.clone(),
            index,
            config.pack_size,
        ));
        Self {
            snapshots: SnapshotManager::new(backend.clone(), encryptor),
            chunker: Chunker::from_params(config.chunker),
            backend,
            config,
            store,
            parallelism: parallelism.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub(crate) fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    pub(crate) fn chunker(&self) -> Chunker {
        self.chunker
    }

    pub(crate) fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::RepositoryClosed);
        }
        Ok(())
    }

    /// Releases the in-memory index and open pack. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.release().await;
        debug!(repo = %self.config.id, "Closed repository");
    }

    /// Backs up `paths` and records a snapshot. No snapshot is written if
    /// any part of the walk fails.
    pub async fn backup<P: AsRef<Path>>(&self, paths: &[P], options: &BackupOptions) -> Result<BackupSummary> {
        self.ensure_open()?;
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        Archiver::new(self, options)?.run(&paths).await
    }

    pub async fn restore(
        &self,
        snapshot_id: &str,
        target: impl AsRef<Path>,
        options: &RestoreOptions,
    ) -> Result<RestoreSummary> {
        self.ensure_open()?;
        let snapshot = self
            .load_snapshot(snapshot_id)
            .await
            .map_err(|e| match e {
                e @ (Error::SnapshotNotFound { .. } | Error::InvalidParams(_)) => e,
                other => Error::restore_failed(format!("snapshot {}", snapshot_id), other),
            })?;
        Restorer::new(self, options)?
            .run(&snapshot, target.as_ref())
            .await
    }

    pub async fn check(&self, depth: CheckDepth) -> Result<CheckReport> {
        self.ensure_open()?;
        Checker::new(self, depth).run().await
    }

    pub async fn list_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        self.ensure_open()?;
        let snapshots = self.snapshots.list().await?;
        Ok(filter.apply(snapshots))
    }

    /// Applies the retention policy to every host and path group and deletes
    /// the snapshot objects it selects. A group whose snapshots would all go
    /// is left untouched. Pack data is not pruned.
    pub async fn forget(&self, policy: &ForgetPolicy, dry_run: bool) -> Result<ForgetSummary> {
        self.ensure_open()?;
        if policy.is_empty() {
            return Err(Error::InvalidParams("forget policy is empty".to_string()));
        }
        info!(?policy, dry_run, "Applying forget policy");

        let mut summary = ForgetSummary {
            dry_run,
            ..Default::default()
        };
        for ((hostname, paths), snapshots) in group_snapshots(self.snapshots.list().await?) {
            let (mut keep, mut remove) = policy.apply(snapshots);
            if keep.is_empty() && !remove.is_empty() {
                warn!(host = %hostname, ?paths, "Refusing to delete the last snapshot of a group");
                keep = std::mem::take(&mut remove);
            }

            for snapshot in &remove {
                if dry_run {
                    summary.removed.push(snapshot.id.clone());
                    continue;
                }
                match self.snapshots.remove(&snapshot.id).await {
                    Ok(()) => {
                        info!(snapshot = %snapshot.short_id(), "Removed snapshot");
                        summary.removed.push(snapshot.id.clone());
                    }
                    Err(e) => {
                        warn!(snapshot = %snapshot.short_id(), error = %e, "Failed to remove snapshot");
                        summary.failed.push(snapshot.id.clone());
                    }
                }
            }
            summary.groups.push(ForgetGroup { hostname, paths, keep, remove });
        }

        info!(removed = summary.removed.len(), failed = summary.failed.len(), dry_run, "Forget complete");
        Ok(summary)
    }

    /// Loads a snapshot by full id or unique prefix.
    pub async fn load_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.ensure_open()?;
        self.snapshots.find(id).await
    }

    pub async fn get_chunk(&self, id: &ChunkID) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.store.get_blob(id).await
    }

    /// Stores a tree blob. It becomes durable with the next pack flush.
    pub async fn save_tree(&self, tree: &Tree) -> Result<ChunkID> {
        self.ensure_open()?;
        let data = tree.to_bytes()?;
        let id = ChunkID::from_data(&data);
        self.store.put_blob(BlobType::Tree, id, &data).await?;
        Ok(id)
    }

    pub async fn load_tree(&self, id: &ChunkID) -> Result<Tree> {
        self.ensure_open()?;
        let data = self.store.get_blob(id).await?;
        Tree::from_bytes(&data, &format!("tree {}", id.short_string()))
    }

    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.store.flush().await
    }
}

fn wrap_backend(backend: Arc<dyn Backend>, options: &RepositoryOptions) -> Arc<dyn Backend> {
    match options.io_timeout {
        Some(timeout) => Arc::new(TimeoutBackend::new(backend, timeout)),
        None => backend,
    }
}

/// Tries every key file; the first one the password opens yields the data key.
async fn unlock(backend: &dyn Backend, password: &str) -> Result<Encryptor> {
    let key_names = backend.list(KEYS_PREFIX).await?;
    if key_names.is_empty() {
        return Err(Error::RepositoryNotFound {
            location: backend.location(),
        });
    }

    for name in key_names {
        let data = backend.read(&name).await?;
        let key_file: KeyFile = match serde_json::from_slice(&data) {
            Ok(kf) => kf,
            Err(e) => {
                warn!(object = %name, error = %e, "Ignoring malformed key file");
                continue;
            }
        };

        let password = password.to_string();
        let attempt = tokio::task::spawn_blocking(move || key_file.unlock(&password))
            .await
            .map_err(|e| Error::Other(format!("key derivation task failed: {}", e)))?;
        match attempt {
            Ok(encryptor) => {
                debug!(object = %name, "Unlocked key file");
                return Ok(encryptor);
            }
            Err(Error::InvalidPassword) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::InvalidPassword)
}
