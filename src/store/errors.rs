//! Store error types
//!
//! The taxonomy keeps the caller-facing distinctions sharp: missing
//! files are typed so callers can probe-then-create, constraint
//! violations stay separate from I/O, schema mismatch is fatal at open
//! with an actionable message, and programmer errors (operating
//! outside a batch, double commit) fail immediately.

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the indexing store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not find file in directory {directory}: {name}")]
    FileNotFound { directory: String, name: String },

    #[error("a file named {name} already exists in directory {directory}")]
    FileAlreadyExists { directory: String, name: String },

    #[error(
        "the schema version on disk ({on_disk}) is different than the version supported by \
         this library ({expected}); you need to migrate the disk version to the library \
         version, alternatively, if the data isn't important, you can delete the store \
         directory and it will be re-created (with no data) with the library version"
    )]
    NoUpgradePath {
        on_disk: String,
        expected: &'static str,
    },

    #[error("not operating within a batch")]
    NotInBatch,

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("too many open store instances (limit {limit})")]
    TooManyInstances { limit: usize },

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl StorageError {
    /// True when opening the store must fail outright rather than a
    /// single operation.
    pub fn is_fatal(&self) -> bool {
        match self {
            StorageError::NoUpgradePath { .. } => true,
            StorageError::Engine(e) => e.is_fatal(),
            _ => false,
        }
    }
}
