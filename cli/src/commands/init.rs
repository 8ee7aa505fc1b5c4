use super::{Session, format_bytes};
use anyhow::{Result, anyhow};
use clap::Args;
use snapvault_core::{ChunkerParams, KdfParams};
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Average chunk size in KiB")]
    chunk_size: Option<u32>,

    #[arg(long, help = "Target pack size in MiB")]
    pack_size: Option<u64>,

    #[arg(long, help = "Argon2id memory cost in KiB")]
    kdf_memory: Option<u32>,
}

fn too_large(message: String) -> anyhow::Error {
    anyhow::Error::new(snapvault_core::Error::InvalidParams(message))
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let session = Session::from_cli(cli)?;
        let mut options = session.options();

        if let Some(kib) = self.chunk_size {
            if kib == 0 {
                return Err(anyhow!("--chunk-size must be positive"));
            }
            let bytes = kib
                .checked_mul(1024)
                .ok_or_else(|| too_large(format!("--chunk-size {} KiB is too large", kib)))?;
            options.chunker = ChunkerParams::with_average(bytes);
        }
        if let Some(mib) = self.pack_size {
            options.pack_size = mib
                .checked_mul(1024 * 1024)
                .ok_or_else(|| too_large(format!("--pack-size {} MiB is too large", mib)))?;
        }
        if let Some(memory) = self.kdf_memory {
            let default = KdfParams::default();
            options.kdf = KdfParams::with_cost(memory, default.iterations, default.parallelism);
        }

        info!("Initializing repository at: {}", session.location);
        let pb = session.spinner("Deriving key and writing repository config...");
        let result = session.connect(options, true).await;
        pb.finish_and_clear();
        let handle = result?;

        let config = handle.repository().config().clone();
        handle.close().await?;

        println!("Created repository {} at {}", config.id, session.location);
        println!(
            "Chunks: {} average, packs: {}",
            format_bytes(config.chunker.avg_size as u64),
            format_bytes(config.pack_size)
        );
        println!("Keep the password safe: data in this repository cannot be recovered without it.");
        Ok(())
    }
}
