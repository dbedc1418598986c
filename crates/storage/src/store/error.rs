#![forbid(unsafe_code)]

use crate::lock::LockError;

/// Storage failures surfaced to callers.
///
/// Every variant carries a stable `code()` so callers can branch without
/// string-matching display output.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput { message: String },
    DuplicateKey { key: String },
    NotFound { key: String },
    LockTimeout { waited_ms: u64 },
    CyclicDependency { key: String, depends_on: String },
    InvalidName { message: String },
    SequenceExists { name: String },
    SequenceNotFound { name: String },
    SequenceCorrupt { name: String, message: String },
    MigrationFailed { message: String },
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::DuplicateKey { .. } => "DUPLICATE_KEY",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::CyclicDependency { .. } => "CYCLIC_DEPENDENCY",
            Self::InvalidName { .. } => "INVALID_NAME",
            Self::SequenceExists { .. } => "SEQUENCE_EXISTS",
            Self::SequenceNotFound { .. } => "SEQUENCE_NOT_FOUND",
            Self::SequenceCorrupt { .. } => "SEQUENCE_CORRUPT",
            Self::MigrationFailed { .. } => "MIGRATION_FAILED",
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Sql(err) => write!(f, "sqlite error: {err}"),
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::DuplicateKey { key } => write!(f, "job key already exists: {key}"),
            Self::NotFound { key } => write!(f, "job not found: {key}"),
            Self::LockTimeout { waited_ms } => {
                write!(f, "store lock not acquired after {waited_ms}ms")
            }
            Self::CyclicDependency { key, depends_on } => write!(
                f,
                "dependency cycle: {key} -> {depends_on} would close a loop"
            ),
            Self::InvalidName { message } => write!(f, "invalid name: {message}"),
            Self::SequenceExists { name } => {
                write!(f, "sequence already recorded: {name}")
            }
            Self::SequenceNotFound { name } => write!(f, "sequence not found: {name}"),
            Self::SequenceCorrupt { name, message } => {
                write!(f, "sequence {name} is corrupt: {message}")
            }
            Self::MigrationFailed { message } => {
                write!(f, "schema migration failed: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<LockError> for StoreError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Io(err) => Self::Io(err),
            LockError::Timeout { waited_ms } => Self::LockTimeout { waited_ms },
        }
    }
}
