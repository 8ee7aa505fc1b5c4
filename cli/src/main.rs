mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, check::CheckCommand, forget::ForgetCommand, init::InitCommand,
    restore::RestoreCommand, snapshots::SnapshotsCommand,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "snapvault",
    about = "Deduplicating, encrypted backups",
    long_about = "Snapvault stores content-defined chunks of your files in an encrypted, \
                  deduplicated repository on local disk or S3-compatible storage"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short = 'r', global = true, env = "SNAPVAULT_REPO", help = "Repository location (path or s3://bucket/prefix)")]
    repo: Option<String>,

    #[arg(long, global = true, env = "SNAPVAULT_PASSWORD", hide_env_values = true, help = "Repository password")]
    password: Option<String>,

    #[arg(long, global = true, env = "SNAPVAULT_BACKEND", help = "Backend type (local, s3, memory)")]
    backend: Option<String>,

    #[arg(long, global = true, env = "SNAPVAULT_PARALLELISM", help = "Concurrent file and blob operations")]
    parallelism: Option<usize>,

    #[arg(long, global = true, help = "Profile file (default: <config dir>/snapvault/config.toml)")]
    profile: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new repository")]
    Init(InitCommand),

    #[command(about = "Create a new backup")]
    Backup(BackupCommand),

    #[command(about = "Restore files from a snapshot")]
    Restore(RestoreCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),

    #[command(about = "Check repository integrity")]
    Check(CheckCommand),

    #[command(about = "Remove snapshots according to a retention policy")]
    Forget(ForgetCommand),

    #[command(about = "Print the engine version")]
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    debug!("Starting snapvault");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(cli).await,
        Commands::Backup(ref cmd) => cmd.run(cli).await,
        Commands::Restore(ref cmd) => cmd.run(cli).await,
        Commands::Snapshots(ref cmd) => cmd.run(cli).await,
        Commands::Check(ref cmd) => cmd.run(cli).await,
        Commands::Forget(ref cmd) => cmd.run(cli).await,
        Commands::Version => {
            println!("{}", snapvault_api::version());
            Ok(())
        }
    }
}

/// Engine failures exit with the magnitude of their stable code; anything
/// else (usage, profile, terminal) exits with 1.
fn exit_code(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<snapvault_api::Error>() {
        Some(e) => ExitCode::from(e.code().as_i32().unsigned_abs().min(u8::MAX as u32) as u8),
        None => ExitCode::FAILURE,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "snapvault={level},snapvault_core={level},snapvault_backends={level},snapvault_api={level}"
        ))
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {}", e);
    }
}
