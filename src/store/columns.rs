//! Column cache
//!
//! Column positions are resolved from the schema once at store open
//! and cached for the process lifetime, so the hot paths index rows
//! directly instead of looking names up per operation. The cache is
//! shared read-only after initialization.

use crate::engine::{TableDef, DETAILS, FILES, LOCKS, MAPPED_RESULTS, REDUCE_RESULTS};
use crate::store::errors::{StorageError, StorageResult};

/// Resolved position of a column within its table's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnId(pub(crate) usize);

#[derive(Debug, Clone, Copy)]
pub struct DetailsColumns {
    pub id: ColumnId,
    pub schema_version: ColumnId,
}

#[derive(Debug, Clone, Copy)]
pub struct FilesColumns {
    pub directory: ColumnId,
    pub name: ColumnId,
    pub modified: ColumnId,
    pub data: ColumnId,
}

#[derive(Debug, Clone, Copy)]
pub struct LocksColumns {
    pub directory: ColumnId,
    pub name: ColumnId,
}

#[derive(Debug, Clone, Copy)]
pub struct MappedResultsColumns {
    pub view: ColumnId,
    pub reduce_key: ColumnId,
    pub document_key: ColumnId,
    pub data: ColumnId,
    pub etag: ColumnId,
    pub timestamp: ColumnId,
    pub reduce_key_and_view_hashed: ColumnId,
    pub reduce_group_id: ColumnId,
}

#[derive(Debug, Clone, Copy)]
pub struct ReduceResultsColumns {
    pub view: ColumnId,
    pub reduce_key: ColumnId,
    pub data: ColumnId,
    pub etag: ColumnId,
    pub timestamp: ColumnId,
    pub reduce_key_and_view_hashed: ColumnId,
    pub reduce_group_id: ColumnId,
}

/// All resolved column positions, one struct per table.
#[derive(Debug, Clone, Copy)]
pub struct TablesColumnsCache {
    pub details: DetailsColumns,
    pub files: FilesColumns,
    pub locks: LocksColumns,
    pub mapped_results: MappedResultsColumns,
    pub reduce_results: ReduceResultsColumns,
}

impl TablesColumnsCache {
    /// Resolves every column the store touches. A missing column means
    /// the schema definitions and this cache have drifted apart, which
    /// is a fatal startup condition.
    pub fn resolve() -> StorageResult<TablesColumnsCache> {
        Ok(TablesColumnsCache {
            details: DetailsColumns {
                id: resolve(&DETAILS, "id")?,
                schema_version: resolve(&DETAILS, "schema_version")?,
            },
            files: FilesColumns {
                directory: resolve(&FILES, "directory")?,
                name: resolve(&FILES, "name")?,
                modified: resolve(&FILES, "modified")?,
                data: resolve(&FILES, "data")?,
            },
            locks: LocksColumns {
                directory: resolve(&LOCKS, "directory")?,
                name: resolve(&LOCKS, "name")?,
            },
            mapped_results: MappedResultsColumns {
                view: resolve(&MAPPED_RESULTS, "view")?,
                reduce_key: resolve(&MAPPED_RESULTS, "reduce_key")?,
                document_key: resolve(&MAPPED_RESULTS, "document_key")?,
                data: resolve(&MAPPED_RESULTS, "data")?,
                etag: resolve(&MAPPED_RESULTS, "etag")?,
                timestamp: resolve(&MAPPED_RESULTS, "timestamp")?,
                reduce_key_and_view_hashed: resolve(&MAPPED_RESULTS, "reduce_key_and_view_hashed")?,
                reduce_group_id: resolve(&MAPPED_RESULTS, "reduce_group_id")?,
            },
            reduce_results: ReduceResultsColumns {
                view: resolve(&REDUCE_RESULTS, "view")?,
                reduce_key: resolve(&REDUCE_RESULTS, "reduce_key")?,
                data: resolve(&REDUCE_RESULTS, "data")?,
                etag: resolve(&REDUCE_RESULTS, "etag")?,
                timestamp: resolve(&REDUCE_RESULTS, "timestamp")?,
                reduce_key_and_view_hashed: resolve(&REDUCE_RESULTS, "reduce_key_and_view_hashed")?,
                reduce_group_id: resolve(&REDUCE_RESULTS, "reduce_group_id")?,
            },
        })
    }
}

fn resolve(def: &'static TableDef, column: &'static str) -> StorageResult<ColumnId> {
    def.column_index(column)
        .map(ColumnId)
        .ok_or_else(|| {
            StorageError::Engine(crate::engine::EngineError::ColumnMismatch {
                table: def.name,
                detail: format!("column {} is not defined", column),
            })
        })
}
