use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Memory,
    S3,
}

/// Object store the repository is persisted into. Names are `/`-separated
/// (`data/<pack>`, `snapshots/<id>`, ...). Implementations must only report
/// success from `write` once the object is durable.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        let data = self.read(path).await?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(Error::Backend(format!(
                "Range {}..{} beyond end of {} ({} bytes)",
                start,
                end,
                path,
                data.len()
            )));
        }
        Ok(data.slice(start..end))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects directly below `prefix`, returned as `prefix/<name>`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend_type(&self) -> BackendType;

    /// Human-readable location used in error messages.
    fn location(&self) -> String {
        format!("{:?}", self.backend_type()).to_lowercase()
    }
}

/// Bounds every call of the wrapped backend. An expired call is reported as a
/// backend error and is never retried here.
pub struct TimeoutBackend {
    inner: Arc<dyn Backend>,
    timeout: Duration,
}

impl TimeoutBackend {
    pub fn new(inner: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, op: &str, path: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Backend(format!(
                "{} {} timed out after {}ms",
                op,
                path,
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl Backend for TimeoutBackend {
    async fn init(&self) -> Result<()> {
        self.bounded("init", "", self.inner.init()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.bounded("exists", path, self.inner.exists(path)).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.bounded("read", path, self.inner.read(path)).await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.bounded("read", path, self.inner.read_range(path, offset, length))
            .await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.bounded("write", path, self.inner.write(path, data)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.bounded("delete", path, self.inner.delete(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.bounded("list", prefix, self.inner.list(prefix)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}

/// Returns the final component of an object name (`snapshots/abc` -> `abc`).
pub fn object_basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }

        async fn read(&self, path: &str) -> Result<Bytes> {
            tokio::time::sleep(self.delay).await;
            self.inner.read(path).await
        }

        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            self.inner.write(path, data).await
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        fn backend_type(&self) -> BackendType {
            BackendType::Memory
        }
    }

    #[tokio::test]
    async fn test_timeout_surfaces_backend_error() {
        let slow = SlowBackend {
            inner: MemoryBackend::new(),
            delay: Duration::from_millis(500),
        };
        slow.write("data/x", Bytes::from_static(b"x")).await.unwrap();

        let backend = TimeoutBackend::new(Arc::new(slow), Duration::from_millis(20));
        let err = backend.read("data/x").await.unwrap_err();

        assert!(matches!(err, Error::Backend(ref msg) if msg.contains("timed out")));
        assert!(backend.exists("data/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_default_read_range() {
        let backend = MemoryBackend::new();
        backend
            .write("data/p", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let slice = backend.read_range("data/p", 2, 3).await.unwrap();
        assert_eq!(&slice[..], b"234");
        assert!(backend.read_range("data/p", 8, 5).await.is_err());
    }

    #[test]
    fn test_object_basename() {
        assert_eq!(object_basename("snapshots/abc"), "abc");
        assert_eq!(object_basename("config"), "config");
    }
}
