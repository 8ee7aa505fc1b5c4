//! Flat operation set over the snapvault engine: open or create a repository,
//! back up, restore, list, check, forget, close. Every failure carries a stable
//! numeric code via [`Error::code`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapvault_core::{
    BackupOptions, CheckDepth, Repository, RepositoryOptions, RestoreOptions, SnapshotFilter,
};
use std::fmt;
use std::path::Path;
use tracing::info;

pub use snapvault_backends::{BackendKind, Credentials};
pub use snapvault_core::{Error, ErrorCode, ForgetPolicy, KeepWithin, Result, SnapshotID};

/// One row of a snapshot listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotID,
    pub time: DateTime<Utc>,
    pub hostname: String,
    pub tags: Vec<String>,
}

/// An open repository session. Dropping the handle without `close` is fine;
/// after `close` every operation fails with `ErrorCode::Closed`.
pub struct RepositoryHandle {
    repo: Repository,
}

impl fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("location", &self.repo.location())
            .field("closed", &self.repo.is_closed())
            .finish()
    }
}

/// Opens the repository at `location`, or creates it when `create_new` is set.
/// A `parallelism` of zero picks a default from the host's CPU count.
pub async fn open_or_init(
    location: &str,
    kind: BackendKind,
    password: &str,
    credentials: &Credentials,
    parallelism: usize,
    create_new: bool,
) -> Result<RepositoryHandle> {
    let mut options = RepositoryOptions::default();
    if parallelism > 0 {
        options.parallelism = parallelism;
    }
    open_or_init_with(location, kind, password, credentials, options, create_new).await
}

/// Like [`open_or_init`], with full control over session and creation options.
pub async fn open_or_init_with(
    location: &str,
    kind: BackendKind,
    password: &str,
    credentials: &Credentials,
    options: RepositoryOptions,
    create_new: bool,
) -> Result<RepositoryHandle> {
    if password.is_empty() {
        return Err(Error::InvalidParams("password must not be empty".to_string()));
    }
    let backend = snapvault_backends::connect(kind, location, credentials).await?;
    let repo = if create_new {
        Repository::init(backend, password, options).await?
    } else {
        Repository::open(backend, password, options).await?
    };
    info!(location, %kind, create_new, "Repository session started");
    Ok(RepositoryHandle { repo })
}

impl RepositoryHandle {
    pub async fn backup(&self, paths: &[String], tags: &[String]) -> Result<SnapshotID> {
        let options = BackupOptions::default().with_tags(tags.to_vec());
        let summary = self.repo.backup(paths, &options).await?;
        Ok(summary.snapshot_id)
    }

    pub async fn restore(&self, snapshot_id: &str, target_dir: impl AsRef<Path>) -> Result<()> {
        if snapshot_id.is_empty() {
            return Err(Error::InvalidParams("snapshot id is empty".to_string()));
        }
        self.repo
            .restore(snapshot_id, target_dir, &RestoreOptions::default())
            .await?;
        Ok(())
    }

    /// Lists all snapshots, newest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = self.repo.list_snapshots(&SnapshotFilter::default()).await?;
        snapshots.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(snapshots
            .into_iter()
            .map(|s| SnapshotInfo {
                id: s.id,
                time: s.time,
                hostname: s.hostname,
                tags: s.tags,
            })
            .collect())
    }

    /// Returns the number of inconsistencies found.
    pub async fn check(&self) -> Result<usize> {
        let report = self.repo.check(CheckDepth::Default).await?;
        Ok(report.error_count())
    }

    /// Applies a retention policy and returns the ids of the removed snapshots.
    pub async fn forget(&self, policy: &ForgetPolicy) -> Result<Vec<SnapshotID>> {
        let summary = self.repo.forget(policy, false).await?;
        Ok(summary.removed)
    }

    pub async fn close(&self) -> Result<()> {
        self.repo.close().await;
        Ok(())
    }

    /// The engine session behind the handle, for operations beyond the flat set.
    pub fn repository(&self) -> &Repository {
        &self.repo
    }
}

/// Maps an operation outcome to its stable numeric code (`0` on success).
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => ErrorCode::Ok.as_i32(),
        Err(e) => e.code().as_i32(),
    }
}

pub fn version() -> String {
    format!("snapvault-v{}", env!("CARGO_PKG_VERSION"))
}
