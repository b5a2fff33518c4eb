//! Transactional store for index files, locks, and map/reduce results
//!
//! The store layer owns the engine handle and exposes everything the
//! indexing subsystem needs: atomic batches over the files/locks
//! tables, batch-scoped seekable streams over file payloads, a
//! directory abstraction for the search-index consumer, and (through
//! the `mapreduce` module) the result tables.

mod accessor;
mod columns;
mod directory;
mod errors;
mod lifecycle;
mod stream;

pub(crate) use accessor::{bytes_column, int_column, text_column};

pub use accessor::StorageAccessor;
pub use columns::{
    ColumnId, DetailsColumns, FilesColumns, LocksColumns, MappedResultsColumns,
    ReduceResultsColumns, TablesColumnsCache,
};
pub use directory::{IndexDirectory, IndexLock};
pub use errors::{StorageError, StorageResult};
pub use lifecycle::{IndexingStore, LOG_FILE_NAME};
pub use stream::{Bookmark, FileStream};
