use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use snapvault_core::backend::{Backend, BackendType};
use snapvault_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each backoff
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_duration =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);

        let duration_ms = base_duration.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

/// Trait to determine if an error is retryable
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Backend(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("rate limit")
                    || msg.contains("throttl")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("connection reset")
                    || msg.contains("try again")
                    || msg.contains("503")
                    || msg.contains("429")
            }
            // Authentication, validation and integrity failures never heal.
            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. Each attempt re-issues the full request.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) if !error.is_retryable() => {
                debug!(
                    operation = operation_name,
                    error = %error,
                    "Error is not retryable, failing immediately"
                );
                return Err(error);
            }
            Err(error) if attempt + 1 >= max_attempts => {
                warn!(
                    operation = operation_name,
                    max_attempts,
                    error = %error,
                    "Operation failed after all retry attempts"
                );
                return Err(error);
            }
            Err(error) => {
                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %error,
                    "Operation failed, retrying after backoff"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Retries transient failures of the wrapped backend.
pub struct RetryBackend {
    inner: Arc<dyn Backend>,
    config: RetryConfig,
}

impl RetryBackend {
    pub fn new(inner: Arc<dyn Backend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl Backend for RetryBackend {
    async fn init(&self) -> Result<()> {
        retry_with_backoff(&self.config, "init", || self.inner.init()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        retry_with_backoff(&self.config, "exists", || self.inner.exists(path)).await
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read", || self.inner.read(path)).await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes> {
        retry_with_backoff(&self.config, "read_range", || {
            self.inner.read_range(path, offset, length)
        })
        .await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        retry_with_backoff(&self.config, "write", || self.inner.write(path, data.clone())).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        retry_with_backoff(&self.config, "delete", || self.inner.delete(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        retry_with_backoff(&self.config, "list", || self.inner.list(prefix)).await
    }

    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn location(&self) -> String {
        self.inner.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_core::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast_config(5), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(Error::Io(std::io::Error::other("Temporary failure")))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&fast_config(3), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::Backend("read data/x timed out after 5ms".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(&RetryConfig::default(), "test_operation", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(Error::InvalidPassword)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_duration_calculation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(10), Duration::from_secs(10));
    }

    /// Fails the first `failures` writes with a transient error.
    struct FlakyBackend {
        inner: MemoryBackend,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }
        async fn read(&self, path: &str) -> Result<Bytes> {
            self.inner.read(path).await
        }
        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Backend(format!("Failed to write {}: 503 Slow Down", path)));
            }
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
    async fn test_retry_backend_reissues_writes() {
        let flaky = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            failures: AtomicU32::new(2),
        });
        let backend = RetryBackend::new(flaky.clone(), fast_config(5));

        backend.write("data/p", Bytes::from_static(b"pack")).await.unwrap();
        assert_eq!(&backend.read("data/p").await.unwrap()[..], b"pack");
        assert_eq!(flaky.inner.write_count("data"), 1);

        // Missing objects are not transient.
        assert!(backend.read("data/missing").await.is_err());
    }
}
