pub mod backup;
pub mod check;
pub mod forget;
pub mod init;
pub mod restore;
pub mod snapshots;

use crate::Cli;
use crate::config::Profile;
use anyhow::{Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use snapvault_api::{BackendKind, Credentials, RepositoryHandle, open_or_init_with};
use snapvault_core::RepositoryOptions;
use std::io::{self, Write};
use std::time::Duration;
use tracing::info;

/// Everything a command needs to reach the repository, merged from flags,
/// environment and the profile file.
pub struct Session {
    pub location: String,
    pub kind: BackendKind,
    pub credentials: Credentials,
    pub parallelism: Option<usize>,
    pub profile: Profile,
    password: Option<String>,
    quiet: bool,
}

impl Session {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let profile = Profile::load(cli.profile.as_deref())?;

        let location = cli
            .repo
            .clone()
            .or_else(|| profile.repository.clone())
            .ok_or_else(|| anyhow!("Repository location required (--repo or SNAPVAULT_REPO)"))?;

        let kind = match cli.backend.as_deref().or(profile.backend.as_deref()) {
            Some(name) => name.parse()?,
            None if location.starts_with("s3:") => BackendKind::S3,
            None => BackendKind::Local,
        };

        Ok(Self {
            location,
            kind,
            credentials: profile.s3.clone(),
            parallelism: cli.parallelism.or(profile.parallelism),
            password: cli.password.clone(),
            quiet: cli.quiet,
            profile,
        })
    }

    /// Flag or environment first, then the profile's password file, then a
    /// terminal prompt.
    pub fn password(&self) -> Result<String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        if let Some(password) = self.profile.read_password_file()? {
            return Ok(password);
        }
        print!("Enter repository password: ");
        io::stdout().flush()?;
        let password = rpassword::read_password()?;
        Ok(password)
    }

    pub fn options(&self) -> RepositoryOptions {
        let mut options = RepositoryOptions::default();
        if let Some(parallelism) = self.parallelism.filter(|&p| p > 0) {
            options.parallelism = parallelism;
        }
        options
    }

    pub async fn open(&self) -> Result<RepositoryHandle> {
        self.connect(self.options(), false).await
    }

    pub async fn connect(&self, options: RepositoryOptions, create_new: bool) -> Result<RepositoryHandle> {
        let password = self.password()?;
        info!(location = %self.location, kind = %self.kind, "Opening repository");
        let handle = open_or_init_with(
            &self.location,
            self.kind,
            &password,
            &self.credentials,
            options,
            create_new,
        )
        .await?;
        Ok(handle)
    }

    pub fn spinner(&self, message: &str) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(message.to_string());
        pb
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
