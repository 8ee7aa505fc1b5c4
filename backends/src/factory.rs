use crate::local::LocalBackend;
use crate::retry::{RetryBackend, RetryConfig};
use crate::s3::S3Backend;
use serde::{Deserialize, Serialize};
use snapvault_core::backend::Backend;
use snapvault_core::{Error, MemoryBackend, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    S3,
    Memory,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "file" | "fs" => Ok(BackendKind::Local),
            "s3" | "minio" => Ok(BackendKind::S3),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(Error::InvalidParams(format!("unknown backend kind '{}'", other))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Opaque backend credentials. Unset fields fall back to the backend's own
/// defaults (for S3: the usual AWS environment and profile chain).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Splits `s3://bucket/some/prefix` (scheme optional) into bucket and prefix.
pub fn parse_s3_location(location: &str) -> Result<(String, String)> {
    let rest = location
        .strip_prefix("s3://")
        .or_else(|| location.strip_prefix("s3:"))
        .unwrap_or(location)
        .trim_matches('/');
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(Error::InvalidParams(format!("no bucket in S3 location '{}'", location)));
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

/// Builds the backend for a repository location. Remote backends are
/// wrapped in a retry decorator; local and in-memory ones are not.
pub async fn connect(kind: BackendKind, location: &str, credentials: &Credentials) -> Result<Arc<dyn Backend>> {
    if location.is_empty() && kind != BackendKind::Memory {
        return Err(Error::InvalidParams("repository location is empty".to_string()));
    }
    debug!(%kind, location, "Connecting backend");

    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Local => Arc::new(LocalBackend::new(location)),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::S3 => {
            let (bucket, prefix) = parse_s3_location(location)?;
            let s3 = S3Backend::with_credentials(bucket, prefix, credentials).await?;
            Arc::new(RetryBackend::new(Arc::new(s3), RetryConfig::default()))
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_core::BackendType;

    #[test]
    fn test_parse_kind() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::S3);
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!(matches!("gcs".parse::<BackendKind>(), Err(Error::InvalidParams(_))));
        assert_eq!(BackendKind::S3.to_string(), "s3");
    }

    #[test]
    fn test_parse_s3_location() {
        assert_eq!(
            parse_s3_location("s3://backups/laptop/home").unwrap(),
            ("backups".to_string(), "laptop/home".to_string())
        );
        assert_eq!(
            parse_s3_location("backups").unwrap(),
            ("backups".to_string(), String::new())
        );
        assert!(parse_s3_location("s3://").is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let credentials = Credentials {
            access_key: Some("AKIA".into()),
            secret_key: Some("very-secret".into()),
            ..Default::default()
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("AKIA"));
        assert!(!printed.contains("very-secret"));
    }

    #[tokio::test]
    async fn test_connect_local_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().to_string_lossy().to_string();

        let local = connect(BackendKind::Local, &location, &Credentials::default())
            .await
            .unwrap();
        assert_eq!(local.backend_type(), BackendType::Local);
        assert_eq!(local.location(), location);

        let memory = connect(BackendKind::Memory, "", &Credentials::default())
            .await
            .unwrap();
        assert_eq!(memory.backend_type(), BackendType::Memory);

        assert!(connect(BackendKind::Local, "", &Credentials::default()).await.is_err());
    }
}
