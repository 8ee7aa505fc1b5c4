use crate::factory::Credentials;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use snapvault_core::backend::{Backend, BackendType};
use snapvault_core::{Error, Result};
use tracing::debug;

/// S3-compatible object store. Objects live under `<prefix>/` in the bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        Self::with_credentials(bucket, prefix, &Credentials::default()).await
    }

    /// Builds a client from the ambient AWS configuration, overridden by
    /// whatever the credentials carry. A custom endpoint implies path-style
    /// addressing, as MinIO and most self-hosted stores expect.
    pub async fn with_credentials(bucket: String, prefix: String, credentials: &Credentials) -> Result<Self> {
        if bucket.is_empty() {
            return Err(Error::InvalidParams("S3 bucket name is empty".to_string()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &credentials.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &credentials.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&credentials.access_key, &credentials.secret_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                credentials.session_token.clone(),
                None,
                "snapvault",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(credentials.endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn strip_key<'k>(&self, key: &'k str) -> &'k str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.as_str())
                .and_then(|k| k.strip_prefix('/'))
                .unwrap_or(key)
        }
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn init(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Bucket {} not accessible: {}", self.bucket, e)))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(Error::Backend(format!("Failed to stat {}: {}", path, e))),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", path, e)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Backend(format!("Failed to read body of {}: {}", path, e)))?;
        Ok(data.into_bytes())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .range(format!("bytes={}-{}", offset, offset + length - 1))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", path, e)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Backend(format!("Failed to read body of {}: {}", path, e)))?
            .into_bytes();
        if data.len() as u64 != length {
            return Err(Error::Backend(format!(
                "Short read of {}: wanted {} bytes at {}, got {}",
                path,
                length,
                offset,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", path, e)))?;
        debug!(object = path, bytes = size, "Uploaded object");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(path))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Failed to delete {}: {}", path, e)))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = format!("{}/", self.full_key(prefix));
        let mut results = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .delimiter("/");
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Backend(format!("Failed to list {}: {}", prefix, e)))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    results.push(self.strip_key(key).to_string());
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        results.sort();
        Ok(results)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::S3
    }

    fn location(&self) -> String {
        if self.prefix.is_empty() {
            format!("s3:{}", self.bucket)
        } else {
            format!("s3:{}/{}", self.bucket, self.prefix)
        }
    }
}
