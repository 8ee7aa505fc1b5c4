pub mod archiver;
pub mod backend;
pub mod checker;
pub mod chunker;
pub mod crypto;
pub mod error;
pub mod forget;
pub mod index;
pub mod memory;
pub mod pack;
pub mod repository;
pub mod restorer;
pub mod snapshot;
pub mod store;
pub mod types;

pub use archiver::{BackupOptions, BackupSummary};
pub use backend::{Backend, BackendType, TimeoutBackend};
pub use checker::{CheckDepth, CheckReport};
pub use error::{Error, ErrorCode, Result};
pub use forget::{ForgetGroup, ForgetPolicy, ForgetSummary, KeepWithin};
pub use memory::MemoryBackend;
pub use repository::{Repository, RepositoryOptions};
pub use restorer::{RestoreOptions, RestoreSummary};
pub use snapshot::{Snapshot, SnapshotFilter, Tree};
pub use types::*;
