use super::{Session, format_bytes};
use anyhow::{Result, anyhow};
use clap::Args;
use snapvault_core::BackupOptions;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Paths to backup")]
    paths: Vec<PathBuf>,

    #[arg(long, help = "Backup tags")]
    tag: Vec<String>,

    #[arg(long, help = "Exclude patterns (glob, matched on names and relative paths)")]
    exclude: Vec<String>,

    #[arg(long, help = "Parent snapshot ID or prefix")]
    parent: Option<String>,

    #[arg(long, help = "Hostname override")]
    hostname: Option<String>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.paths.is_empty() {
            return Err(anyhow!("At least one path must be specified"));
        }

        let session = Session::from_cli(cli)?;
        let handle = session.open().await?;
        let repo = handle.repository();

        let mut excludes = session.profile.excludes.clone();
        excludes.extend(self.exclude.iter().cloned());

        let mut options = BackupOptions::default()
            .with_tags(self.tag.clone())
            .with_excludes(excludes);
        options.hostname = self.hostname.clone();
        if let Some(parent) = &self.parent {
            options.parent = Some(repo.load_snapshot(parent).await?.id);
        }

        info!("Starting backup of {} paths", self.paths.len());
        let pb = session.spinner("Backing up files...");
        let result = repo.backup(&self.paths, &options).await;
        pb.finish_and_clear();
        let summary = result?;
        handle.close().await?;

        println!("Backup completed: snapshot {}", summary.snapshot_id);
        println!(
            "Files: {}  Dirs: {}  Symlinks: {}",
            summary.files, summary.dirs, summary.symlinks
        );
        println!(
            "Processed {}, added {} in {} new blobs ({:.1}s)",
            format_bytes(summary.bytes_processed),
            format_bytes(summary.bytes_added),
            summary.blobs_added,
            summary.duration.as_secs_f64()
        );
        Ok(())
    }
}
