//! Schema 1.0 → 1.1: reduce group ids
//!
//! Schema 1.0 had no `reduce_group_id` column; its rows decode short
//! and are padded with the declared default of -1 on load. This update
//! backfills the real bucket for every mapped and reduce result row
//! from its reduce key. Recomputing is deterministic, so running the
//! update against rows that already carry a group id is harmless.

use std::sync::Arc;

use crate::engine::{EngineError, Row, TableId, Tables, Value};
use crate::mapreduce::compute_reduce_group_id;
use crate::migrations::SchemaUpdate;
use crate::store::{StorageError, StorageResult};

pub struct From10To11;

impl SchemaUpdate for From10To11 {
    fn from_schema_version(&self) -> &'static str {
        "1.0"
    }

    fn to_schema_version(&self) -> &'static str {
        "1.1"
    }

    fn update(&self, tables: &mut Tables) -> StorageResult<()> {
        for table_id in [TableId::MappedResults, TableId::ReduceResults] {
            backfill_group_ids(tables, table_id)?;
        }
        Ok(())
    }
}

fn backfill_group_ids(tables: &mut Tables, table_id: TableId) -> StorageResult<()> {
    let def = table_id.def();
    let reduce_key_position = column(def, "reduce_key")?;
    let group_position = column(def, "reduce_group_id")?;

    let rows: Vec<(u64, Arc<Row>)> = tables
        .table(table_id)
        .iter()
        .map(|(row_id, row)| (row_id, Arc::clone(row)))
        .collect();

    for (row_id, row) in rows {
        let reduce_key = row
            .get(reduce_key_position)
            .and_then(|v| v.as_text())
            .ok_or_else(|| {
                StorageError::Engine(EngineError::ColumnMismatch {
                    table: def.name,
                    detail: "reduce_key column is unreadable".into(),
                })
            })?;
        let group_id = compute_reduce_group_id(reduce_key);
        let mut updated = (*row).clone();
        updated[group_position] = Value::Int(group_id as i64);
        tables.table_mut(table_id).update(row_id, Arc::new(updated))?;
    }
    Ok(())
}

fn column(def: &'static crate::engine::TableDef, name: &'static str) -> StorageResult<usize> {
    def.column_index(name).ok_or_else(|| {
        StorageError::Engine(EngineError::ColumnMismatch {
            table: def.name,
            detail: format!("column {} is not defined", name),
        })
    })
}
