use super::{Session, format_bytes};
use anyhow::Result;
use clap::Args;
use snapvault_core::RestoreOptions;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Snapshot ID (or unique prefix) to restore from")]
    snapshot_id: String,

    #[arg(help = "Target directory for restore")]
    target: PathBuf,

    #[arg(long, help = "Only restore paths matching these patterns")]
    include: Vec<String>,

    #[arg(long, help = "Skip paths matching these patterns")]
    exclude: Vec<String>,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::from_cli(cli)?;
        let handle = session.open().await?;
        let repo = handle.repository();

        let snapshot = repo.load_snapshot(&self.snapshot_id).await?;
        println!("Restoring snapshot {}", snapshot.summary());
        println!("Target: {}", self.target.display());

        let options = RestoreOptions {
            includes: self.include.clone(),
            excludes: self.exclude.clone(),
        };

        info!(snapshot = %snapshot.short_id(), "Starting restore");
        let pb = session.spinner("Restoring files...");
        let result = repo.restore(&snapshot.id, &self.target, &options).await;
        pb.finish_and_clear();
        let summary = result?;
        handle.close().await?;

        println!(
            "Restored {} files, {} dirs, {} symlinks ({}) in {:.1}s",
            summary.files,
            summary.dirs,
            summary.symlinks,
            format_bytes(summary.bytes_restored),
            summary.duration.as_secs_f64()
        );
        Ok(())
    }
}
