//! Schema migration runner
//!
//! Each update declares the single schema version it applies from and
//! transforms the table state in memory; the store then persists the
//! migrated state and the new version string in one atomic log
//! compaction. A crash mid-migration therefore leaves either the old
//! or the new on-disk state, and because every backfill is
//! deterministic, re-running an update against already-migrated data
//! converges to the same result.
//!
//! A version with no registered update has no upgrade path and fails
//! the open with an actionable error.

mod from_1_0;

use std::sync::Arc;

use crate::engine::{EngineError, Tables, Value, DETAILS, SCHEMA_VERSION};
use crate::observability::{Logger, Severity};
use crate::store::{StorageError, StorageResult};

pub use from_1_0::From10To11;

/// One version-to-version schema transformation.
pub trait SchemaUpdate {
    /// The only schema version this update applies from.
    fn from_schema_version(&self) -> &'static str;

    /// The schema version the store carries after this update.
    fn to_schema_version(&self) -> &'static str;

    /// Transforms the table state. Must be deterministic given the
    /// same input, so a crash-and-retry converges.
    fn update(&self, tables: &mut Tables) -> StorageResult<()>;
}

/// The ordered list of upgrade steps this library can apply.
pub fn updates() -> Vec<Box<dyn SchemaUpdate>> {
    vec![Box::new(From10To11)]
}

/// Chains updates from `on_disk_version` until the state carries
/// [`SCHEMA_VERSION`]. The caller persists the result.
pub(crate) fn run(tables: &mut Tables, on_disk_version: &str) -> StorageResult<()> {
    let mut version = on_disk_version.to_string();
    while version != SCHEMA_VERSION {
        let step = updates()
            .into_iter()
            .find(|u| u.from_schema_version() == version)
            .ok_or_else(|| StorageError::NoUpgradePath {
                on_disk: version.clone(),
                expected: SCHEMA_VERSION,
            })?;
        Logger::log(
            Severity::Info,
            "schema_update_applied",
            &[
                ("from", step.from_schema_version()),
                ("to", step.to_schema_version()),
            ],
        );
        step.update(tables)?;
        set_schema_version(tables, step.to_schema_version())?;
        version = step.to_schema_version().to_string();
    }
    Ok(())
}

fn set_schema_version(tables: &mut Tables, version: &str) -> StorageResult<()> {
    let position = DETAILS.column_index("schema_version").ok_or_else(|| {
        StorageError::Engine(EngineError::ColumnMismatch {
            table: "details",
            detail: "schema_version column is not defined".into(),
        })
    })?;
    let (row_id, row) = tables
        .details
        .iter()
        .map(|(id, row)| (id, Arc::clone(row)))
        .next()
        .ok_or_else(|| {
            StorageError::Engine(EngineError::Corruption(
                "the details row vanished during migration".into(),
            ))
        })?;
    let mut row = (*row).clone();
    row[position] = Value::Text(version.to_string());
    tables.details.update(row_id, Arc::new(row))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_version_has_no_upgrade_path() {
        let mut tables = Tables::new().unwrap();
        tables
            .details
            .insert(vec![
                Value::Bytes(vec![0u8; 16]),
                Value::Text("0.3".to_string()),
            ])
            .unwrap();
        let err = run(&mut tables, "0.3").unwrap_err();
        assert!(matches!(err, StorageError::NoUpgradePath { .. }));
    }

    #[test]
    fn current_version_is_a_no_op() {
        let mut tables = Tables::new().unwrap();
        run(&mut tables, SCHEMA_VERSION).unwrap();
    }

    #[test]
    fn update_chain_covers_every_historic_version() {
        // every update's target version must either be current or be
        // another update's source, or stores get stranded mid-chain
        for step in updates() {
            let target = step.to_schema_version();
            let reachable = target == SCHEMA_VERSION
                || updates()
                    .iter()
                    .any(|next| next.from_schema_version() == target);
            assert!(reachable, "no path onward from version {}", target);
        }
    }
}
