//! Engine error types
//!
//! Constraint violations (`DuplicateKey`) are kept distinct from plain
//! I/O failures so callers can implement acquire/backoff semantics
//! without matching on error strings. `Corruption` is fatal at open
//! time: the store never comes up against a log it cannot verify.

use std::io;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the physical table engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("duplicate key in {table}.{index}")]
    DuplicateKey {
        table: &'static str,
        index: &'static str,
    },

    #[error("row {row_id} not found in {table}")]
    RowNotFound { table: &'static str, row_id: u64 },

    #[error("column mismatch in {table}: {detail}")]
    ColumnMismatch {
        table: &'static str,
        detail: String,
    },

    #[error("unknown index {index} on {table}")]
    UnknownIndex {
        table: &'static str,
        index: &'static str,
    },
}

impl EngineError {
    /// True for errors that must abort store open rather than a single
    /// operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Corruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_fatal() {
        assert!(EngineError::Corruption("bad frame".into()).is_fatal());
        assert!(!EngineError::DuplicateKey {
            table: "locks",
            index: "by_path"
        }
        .is_fatal());
    }

    #[test]
    fn duplicate_key_display_names_table_and_index() {
        let err = EngineError::DuplicateKey {
            table: "files",
            index: "by_path",
        };
        assert_eq!(err.to_string(), "duplicate key in files.by_path");
    }
}
