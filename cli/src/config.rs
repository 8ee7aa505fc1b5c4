use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use snapvault_api::Credentials;
use std::fs;
use std::path::{Path, PathBuf};

/// Optional defaults read from `<config dir>/snapvault/config.toml`.
/// Command-line flags and environment variables take precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub repository: Option<String>,
    pub backend: Option<String>,
    pub parallelism: Option<usize>,
    /// File whose first line is the repository password.
    pub password_file: Option<PathBuf>,
    /// Exclude patterns applied to every backup.
    pub excludes: Vec<String>,
    pub s3: Credentials,
}

impl Profile {
    /// Loads the profile at `path`, or at the default location when `path`
    /// is `None`. A missing default profile is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(anyhow!("Profile not found: {}", path.display()));
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse profile {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "snapvault").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn read_password_file(&self) -> Result<Option<String>> {
        let Some(path) = &self.password_file else {
            return Ok(None);
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read password file {}", path.display()))?;
        Ok(content.lines().next().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_profile() {
        let profile = Profile::parse(
            r#"
            repository = "s3://backups/laptop"
            backend = "s3"
            parallelism = 8
            excludes = ["*.tmp", "target"]

            [s3]
            region = "eu-central-1"
            endpoint = "http://localhost:9000"
            "#,
        )
        .unwrap();

        assert_eq!(profile.repository.as_deref(), Some("s3://backups/laptop"));
        assert_eq!(profile.backend.as_deref(), Some("s3"));
        assert_eq!(profile.parallelism, Some(8));
        assert_eq!(profile.excludes, vec!["*.tmp", "target"]);
        assert_eq!(profile.s3.region.as_deref(), Some("eu-central-1"));
        assert!(profile.s3.access_key.is_none());
    }

    #[test]
    fn test_empty_profile_is_default() {
        assert_eq!(Profile::parse("").unwrap(), Profile::default());
    }

    #[test]
    fn test_explicit_missing_profile_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Profile::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_password_file_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pw");
        fs::write(&path, "correct horse\nignored\n").unwrap();
        let profile = Profile {
            password_file: Some(path),
            ..Default::default()
        };
        assert_eq!(profile.read_password_file().unwrap().as_deref(), Some("correct horse"));
    }
}
