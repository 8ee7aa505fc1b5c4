use super::Session;
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use snapvault_core::{Snapshot, SnapshotFilter};

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(long, help = "Print JSON instead of a table")]
    json: bool,

    #[arg(long = "host", help = "Filter by hostname")]
    hosts: Vec<String>,

    #[arg(long, help = "Filter by tag")]
    tag: Vec<String>,

    #[arg(long, help = "Filter by path")]
    path: Vec<String>,

    #[arg(long, help = "Show latest N snapshots")]
    latest: Option<usize>,
}

#[derive(Serialize)]
struct SnapshotRow<'a> {
    id: &'a str,
    time: DateTime<Utc>,
    hostname: &'a str,
    username: &'a str,
    paths: &'a [String],
    tags: &'a [String],
    tree: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
}

impl<'a> From<&'a Snapshot> for SnapshotRow<'a> {
    fn from(s: &'a Snapshot) -> Self {
        Self {
            id: &s.id,
            time: s.time,
            hostname: &s.hostname,
            username: &s.username,
            paths: &s.paths,
            tags: &s.tags,
            tree: s.tree.to_hex(),
            parent: s.parent.as_deref(),
        }
    }
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::from_cli(cli)?;
        let handle = session.open().await?;

        let filter = SnapshotFilter {
            hosts: self.hosts.clone(),
            tags: self.tag.clone(),
            paths: self.path.clone(),
            limit: self.latest,
            ..Default::default()
        };
        let mut snapshots = handle.repository().list_snapshots(&filter).await?;
        snapshots.sort_by(|a, b| b.time.cmp(&a.time));
        handle.close().await?;

        if self.json {
            let rows: Vec<SnapshotRow> = snapshots.iter().map(SnapshotRow::from).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        if snapshots.is_empty() {
            println!("No snapshots found");
            return Ok(());
        }

        println!(
            "{:<10} {:<20} {:<15} {:<20} {}",
            "ID", "Date", "Host", "Tags", "Paths"
        );
        println!("{:-<90}", "");
        for snapshot in &snapshots {
            println!(
                "{:<10} {:<20} {:<15} {:<20} {}",
                snapshot.short_id(),
                snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                snapshot.hostname,
                snapshot.tags.join(","),
                snapshot.paths.join(",")
            );
        }
        println!("{} snapshots", snapshots.len());
        Ok(())
    }
}
