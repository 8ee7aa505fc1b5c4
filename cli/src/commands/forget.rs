use super::Session;
use anyhow::{Result, bail};
use clap::Args;
use snapvault_core::{ForgetPolicy, KeepWithin};

#[derive(Args)]
pub struct ForgetCommand {
    #[arg(long, help = "Keep last N snapshots")]
    keep_last: Option<u32>,

    #[arg(long, help = "Keep the newest snapshot of each of the last N hours")]
    keep_hourly: Option<u32>,

    #[arg(long, help = "Keep daily snapshots for N days")]
    keep_daily: Option<u32>,

    #[arg(long, help = "Keep weekly snapshots for N weeks")]
    keep_weekly: Option<u32>,

    #[arg(long, help = "Keep monthly snapshots for N months")]
    keep_monthly: Option<u32>,

    #[arg(long, help = "Keep yearly snapshots for N years")]
    keep_yearly: Option<u32>,

    #[arg(long, help = "Keep snapshots newer than this span before the latest one (e.g. 1y6m, 14d, 2d12h)")]
    keep_within: Option<KeepWithin>,

    #[arg(long = "keep-tag", help = "Keep snapshots carrying all of these tags")]
    keep_tags: Vec<String>,

    #[arg(long, help = "Only show what would be removed")]
    dry_run: bool,
}

impl ForgetCommand {
    fn policy(&self) -> ForgetPolicy {
        ForgetPolicy {
            keep_last: self.keep_last.unwrap_or(0),
            keep_hourly: self.keep_hourly.unwrap_or(0),
            keep_daily: self.keep_daily.unwrap_or(0),
            keep_weekly: self.keep_weekly.unwrap_or(0),
            keep_monthly: self.keep_monthly.unwrap_or(0),
            keep_yearly: self.keep_yearly.unwrap_or(0),
            keep_within: self.keep_within,
            keep_tags: self.keep_tags.clone(),
        }
    }

    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::from_cli(cli)?;
        let handle = session.open().await?;

        let summary = handle.repository().forget(&self.policy(), self.dry_run).await?;
        handle.close().await?;

        for group in &summary.groups {
            println!("Host {} paths [{}]", group.hostname, group.paths.join(", "));
            for snapshot in &group.keep {
                println!("  keep    {}", snapshot.summary());
            }
            for snapshot in &group.remove {
                println!("  remove  {}", snapshot.summary());
            }
        }

        if summary.dry_run {
            println!("Would remove {} snapshots", summary.removed.len());
        } else {
            println!("Removed {} snapshots", summary.removed.len());
            println!("Data only they referenced stays in the repository");
        }
        if !summary.failed.is_empty() {
            bail!("{} snapshots could not be removed", summary.failed.len());
        }
        Ok(())
    }
}
