use thiserror::Error;

/// Stable numeric codes surfaced to callers across the binding boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidParams = -1,
    NotFound = -2,
    InvalidPassword = -3,
    BackupFailed = -4,
    RestoreFailed = -5,
    Integrity = -6,
    Backend = -7,
    Closed = -8,
    Unknown = -99,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => ErrorCode::Ok,
            -1 => ErrorCode::InvalidParams,
            -2 => ErrorCode::NotFound,
            -3 => ErrorCode::InvalidPassword,
            -4 => ErrorCode::BackupFailed,
            -5 => ErrorCode::RestoreFailed,
            -6 => ErrorCode::Integrity,
            -7 => ErrorCode::Backend,
            -8 => ErrorCode::Closed,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Success",
            ErrorCode::InvalidParams => "Invalid parameters",
            ErrorCode::NotFound => "Not found",
            ErrorCode::InvalidPassword => "Invalid password",
            ErrorCode::BackupFailed => "Backup failed",
            ErrorCode::RestoreFailed => "Restore failed",
            ErrorCode::Integrity => "Integrity check failed",
            ErrorCode::Backend => "Storage backend error",
            ErrorCode::Closed => "Repository is closed",
            ErrorCode::Unknown => "Unknown error",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Repository not found at {location}")]
    RepositoryNotFound { location: String },

    #[error("Repository already exists at {location}")]
    RepositoryExists { location: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Integrity error in {object}: {reason}")]
    Integrity { object: String, reason: String },

    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: String },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Chunk not found: {id}")]
    ChunkNotFound { id: String },

    #[error("Backup failed at {context}: {source}")]
    BackupFailed {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Restore failed at {context}: {source}")]
    RestoreFailed {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Repository is closed")]
    RepositoryClosed,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidParams(_) | Error::RepositoryExists { .. } => ErrorCode::InvalidParams,
            Error::RepositoryNotFound { .. }
            | Error::SnapshotNotFound { .. }
            | Error::ChunkNotFound { .. } => ErrorCode::NotFound,
            Error::InvalidPassword => ErrorCode::InvalidPassword,
            Error::BackupFailed { .. } => ErrorCode::BackupFailed,
            Error::RestoreFailed { .. } => ErrorCode::RestoreFailed,
            Error::Integrity { .. } => ErrorCode::Integrity,
            Error::Backend(_) | Error::Io(_) => ErrorCode::Backend,
            Error::RepositoryClosed => ErrorCode::Closed,
            Error::Serialization(_)
            | Error::Encryption(_)
            | Error::InvalidFormatVersion { .. }
            | Error::Other(_) => ErrorCode::Unknown,
        }
    }

    pub(crate) fn integrity(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Integrity {
            object: object.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn backup_failed(context: impl Into<String>, source: Error) -> Self {
        match source {
            err @ Error::BackupFailed { .. } => err,
            other => Error::BackupFailed {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn restore_failed(context: impl Into<String>, source: Error) -> Self {
        match source {
            err @ Error::RestoreFailed { .. } => err,
            other => Error::RestoreFailed {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
