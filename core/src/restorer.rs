use crate::archiver::build_globset;
use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::store::BlobStore;
use crate::{Error, Result, TreeNode};
use globset::GlobSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Glob filters applied to snapshot paths (`<root name>/...`) and file names.
///
/// An exclude match prunes the entry and everything below it. With includes
/// set, only matching entries are restored; a directory that matches brings
/// its whole subtree, one that doesn't is still searched for matches.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes_restored: u64,
    pub duration: Duration,
}

struct FileJob {
    rel: PathBuf,
    dest: PathBuf,
    node: TreeNode,
}

pub(crate) struct Restorer<'a> {
    repo: &'a Repository,
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl<'a> Restorer<'a> {
    pub(crate) fn new(repo: &'a Repository, options: &RestoreOptions) -> Result<Self> {
        Ok(Self {
            repo,
            includes: build_globset(&options.includes)?,
            excludes: build_globset(&options.excludes)?,
        })
    }

    pub(crate) async fn run(&self, snapshot: &Snapshot, target: &Path) -> Result<RestoreSummary> {
        let started = Instant::now();
        fs::create_dir_all(target)
            .await
            .map_err(|e| Error::restore_failed(target.display().to_string(), e.into()))?;

        let mut summary = RestoreSummary::default();
        let mut files = Vec::new();
        let mut dirs = Vec::new();

        // (tree, directory inside the snapshot, whether an ancestor matched an include)
        let mut pending = vec![(snapshot.tree, PathBuf::new(), false)];
        while let Some((tree_id, dir, included)) = pending.pop() {
            let tree = self
                .repo
                .load_tree(&tree_id)
                .await
                .map_err(|e| Error::restore_failed(format!("tree {}", tree_id.short_string()), e))?;

            for node in tree.nodes {
                check_node_name(&node.name)
                    .map_err(|e| Error::restore_failed(dir.display().to_string(), e))?;
                let rel = dir.join(&node.name);
                if self.is_excluded(&rel) {
                    debug!(path = %rel.display(), "Excluded from restore");
                    continue;
                }
                let selected = included || self.is_included(&rel);
                let dest = target.join(&rel);

                if node.is_dir() {
                    let subtree = node.subtree_id.ok_or_else(|| {
                        Error::restore_failed(
                            rel.display().to_string(),
                            Error::integrity(format!("tree {}", tree_id.short_string()), "directory without subtree"),
                        )
                    })?;
                    if selected {
                        fs::create_dir_all(&dest)
                            .await
                            .map_err(|e| Error::restore_failed(rel.display().to_string(), e.into()))?;
                        summary.dirs += 1;
                        dirs.push((dest, node.mode));
                    }
                    pending.push((subtree, rel, selected));
                } else if !selected {
                    continue;
                } else if node.is_symlink() {
                    restore_symlink(&node, &dest)
                        .await
                        .map_err(|e| Error::restore_failed(rel.display().to_string(), e))?;
                    summary.symlinks += 1;
                } else {
                    files.push(FileJob { rel, dest, node });
                }
            }
        }

        summary.files = files.len() as u64;
        summary.bytes_restored = self.restore_files(files).await?;

        // Deepest first, so a read-only parent never blocks its children.
        dirs.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));
        for (dest, mode) in dirs {
            set_mode(&dest, mode)
                .await
                .map_err(|e| Error::restore_failed(dest.display().to_string(), e))?;
        }

        summary.duration = started.elapsed();
        info!(
            target = %target.display(),
            files = summary.files,
            dirs = summary.dirs,
            bytes = summary.bytes_restored,
            "Restore complete"
        );
        Ok(summary)
    }

    async fn restore_files(&self, files: Vec<FileJob>) -> Result<u64> {
        let semaphore = Arc::new(Semaphore::new(self.repo.parallelism()));
        let mut tasks = JoinSet::new();

        for job in files {
            let semaphore = semaphore.clone();
            let store = self.repo.store().clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => restore_file(&store, &job).await,
                    Err(e) => Err(Error::Other(e.to_string())),
                };
                result.map_err(|e| Error::restore_failed(job.rel.display().to_string(), e))
            });
        }

        let mut bytes = 0;
        while let Some(joined) = tasks.join_next().await {
            bytes += joined
                .map_err(|e| Error::restore_failed("file worker", Error::Other(e.to_string())))??;
        }
        Ok(bytes)
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        self.excludes.as_ref().is_some_and(|set| matches_path(set, rel))
    }

    fn is_included(&self, rel: &Path) -> bool {
        self.includes.as_ref().is_none_or(|set| matches_path(set, rel))
    }
}

fn matches_path(set: &GlobSet, rel: &Path) -> bool {
    set.is_match(rel) || rel.file_name().is_some_and(|name| set.is_match(name))
}

/// Names come from decrypted trees; anything that could escape the target
/// directory is refused.
fn check_node_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('/') && !name.contains('\\') => Ok(()),
        _ => Err(Error::integrity("tree", format!("unsafe entry name '{}'", name))),
    }
}

/// Writes the file's chunks in order. Returns the bytes written.
async fn restore_file(store: &BlobStore, job: &FileJob) -> Result<u64> {
    if let Some(parent) = job.dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    // A previous restore may have left a read-only file or a symlink here.
    if fs::symlink_metadata(&job.dest).await.is_ok_and(|m| !m.is_dir()) {
        fs::remove_file(&job.dest).await?;
    }
    let mut file = fs::File::create(&job.dest).await?;
    let mut written = 0u64;
    for id in &job.node.content {
        let data = store.get_blob(id).await?;
        file.write_all(&data).await?;
        written += data.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if written != job.node.size {
        warn!(path = %job.rel.display(), expected = job.node.size, written, "Restored size differs from recorded size");
    }
    set_mode(&job.dest, job.node.mode).await?;
    debug!(path = %job.rel.display(), bytes = written, "Restored file");
    Ok(written)
}

#[cfg(unix)]
async fn restore_symlink(node: &TreeNode, dest: &Path) -> Result<()> {
    let target = node
        .link_target
        .as_deref()
        .ok_or_else(|| Error::integrity("tree", format!("symlink '{}' has no target", node.name)))?;
    if fs::symlink_metadata(dest).await.is_ok() {
        fs::remove_file(dest).await?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::symlink(target, dest).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restore_symlink(node: &TreeNode, dest: &Path) -> Result<()> {
    warn!(path = %dest.display(), name = %node.name, "Symlinks are not restored on this platform");
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = mode & 0o7777;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
