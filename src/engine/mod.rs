//! Physical storage engine
//!
//! Column-typed tables with ordered secondary indexes, made durable by
//! an append-only, checksummed redo log of committed batches. Recovery
//! is full log replay at open; compaction rewrites the log as one
//! snapshot frame via atomic rename.
//!
//! The engine knows nothing about batches or schema versions; those
//! live in the store layer on top of it.

mod checksum;
mod errors;
mod keys;
mod log;
mod record;
mod schema;
mod table;
mod value;

pub use checksum::{compute_checksum, verify_checksum};
pub use errors::{EngineError, EngineResult};
pub use keys::{encode_component, encode_key, prefix_successor};
pub use log::{replay, snapshot_record, write_snapshot, LogWriter, ReplayOutcome};
pub use record::LogRecord;
pub use schema::{
    ColumnDef, DefaultValue, IndexColumn, IndexDef, TableDef, TableId, DETAILS, FILES, LOCKS,
    MAPPED_RESULTS, REDUCE_RESULTS, SCHEMA_VERSION,
};
pub use table::{Table, TableOp, Tables};
pub use value::{ColumnKind, Row, Value};
