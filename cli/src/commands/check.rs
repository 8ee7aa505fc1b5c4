use super::Session;
use anyhow::{Result, bail};
use clap::Args;
use snapvault_core::CheckDepth;

#[derive(Args)]
pub struct CheckCommand {
    #[arg(long, help = "Also decrypt and verify every blob of every pack")]
    read_data: bool,
}

impl CheckCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::from_cli(cli)?;
        let handle = session.open().await?;

        let depth = if self.read_data {
            CheckDepth::ReadData
        } else {
            CheckDepth::Default
        };

        let pb = session.spinner("Checking repository...");
        let result = handle.repository().check(depth).await;
        pb.finish_and_clear();
        let report = result?;
        handle.close().await?;

        for warning in &report.warnings {
            println!("warning: {}", warning);
        }
        for error in &report.errors {
            println!("error: {}", error);
        }
        println!(
            "Checked {} snapshots, {} trees, {} blobs, {} packs",
            report.snapshots_checked, report.trees_checked, report.blobs_checked, report.packs_checked
        );

        if !report.is_ok() {
            bail!("{} errors found", report.error_count());
        }
        println!("No errors found");
        Ok(())
    }
}
