pub mod factory;
pub mod local;
pub mod retry;
pub mod s3;

pub use factory::{BackendKind, Credentials, connect};
pub use local::LocalBackend;
pub use retry::{RetryBackend, RetryConfig, Retryable, retry_with_backoff};
pub use s3::S3Backend;
pub use snapvault_core::backend::{Backend, BackendType};
