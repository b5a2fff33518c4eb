//! In-memory tables with ordered secondary indexes
//!
//! Rows live in a `BTreeMap` keyed by an engine-assigned row id (the
//! primary ordering) and are shared behind `Arc`, so cloning a whole
//! `Tables` value for a batch snapshot copies structure, not payloads.
//! Each secondary ordering is a sorted set of (encoded key, row id)
//! pairs; unique orderings reject duplicate keys at insert/update
//! time.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use super::errors::{EngineError, EngineResult};
use super::keys;
use super::schema::{TableDef, TableId};
use super::value::{Row, Value};

/// One table: rows plus the sorted sets backing its orderings.
#[derive(Debug, Clone)]
pub struct Table {
    def: &'static TableDef,
    rows: BTreeMap<u64, Arc<Row>>,
    indexes: Vec<BTreeSet<(Vec<u8>, u64)>>,
    /// Per index: resolved (column position, descending) components.
    index_columns: Vec<Vec<(usize, bool)>>,
    next_row_id: u64,
}

impl Table {
    pub fn new(def: &'static TableDef) -> EngineResult<Table> {
        let mut index_columns = Vec::with_capacity(def.indexes.len());
        for index in def.indexes {
            let mut components = Vec::with_capacity(index.columns.len());
            for component in index.columns {
                let position = def.column_index(component.column).ok_or_else(|| {
                    EngineError::ColumnMismatch {
                        table: def.name,
                        detail: format!(
                            "index {} references unknown column {}",
                            index.name, component.column
                        ),
                    }
                })?;
                components.push((position, component.descending));
            }
            index_columns.push(components);
        }
        Ok(Table {
            def,
            rows: BTreeMap::new(),
            indexes: vec![BTreeSet::new(); def.indexes.len()],
            index_columns,
            next_row_id: 1,
        })
    }

    pub fn def(&self) -> &'static TableDef {
        self.def
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row_id: u64) -> Option<&Arc<Row>> {
        self.rows.get(&row_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Arc<Row>)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn max_row_id(&self) -> u64 {
        self.rows.keys().next_back().copied().unwrap_or(0)
    }

    /// Inserts a row under a fresh row id.
    pub fn insert(&mut self, row: Row) -> EngineResult<u64> {
        let row_id = self.next_row_id;
        self.insert_with_id(row_id, Arc::new(row))?;
        Ok(row_id)
    }

    /// Inserts a row under an explicit id (log replay and batch
    /// application, which must reproduce the ids the batch assigned).
    /// Rows written before a trailing column existed are padded with
    /// that column's declared default.
    pub fn insert_with_id(&mut self, row_id: u64, row: Arc<Row>) -> EngineResult<()> {
        let row = self.normalize(row)?;
        if self.rows.contains_key(&row_id) {
            return Err(EngineError::Corruption(format!(
                "duplicate row id {} in {}",
                row_id, self.def.name
            )));
        }
        let keys = self.index_keys(&row);
        for (pos, key) in keys.iter().enumerate() {
            if self.def.indexes[pos].unique && self.key_in_use(pos, key, None) {
                return Err(EngineError::DuplicateKey {
                    table: self.def.name,
                    index: self.def.indexes[pos].name,
                });
            }
        }
        for (pos, key) in keys.into_iter().enumerate() {
            self.indexes[pos].insert((key, row_id));
        }
        self.rows.insert(row_id, row);
        self.next_row_id = self.next_row_id.max(row_id + 1);
        Ok(())
    }

    /// Replaces a row in place, reindexing it. Returns the old row.
    pub fn update(&mut self, row_id: u64, row: Arc<Row>) -> EngineResult<Arc<Row>> {
        let row = self.normalize(row)?;
        let old = self
            .rows
            .get(&row_id)
            .cloned()
            .ok_or(EngineError::RowNotFound {
                table: self.def.name,
                row_id,
            })?;
        let new_keys = self.index_keys(&row);
        for (pos, key) in new_keys.iter().enumerate() {
            if self.def.indexes[pos].unique && self.key_in_use(pos, key, Some(row_id)) {
                return Err(EngineError::DuplicateKey {
                    table: self.def.name,
                    index: self.def.indexes[pos].name,
                });
            }
        }
        let old_keys = self.index_keys(&old);
        for (pos, key) in old_keys.into_iter().enumerate() {
            self.indexes[pos].remove(&(key, row_id));
        }
        for (pos, key) in new_keys.into_iter().enumerate() {
            self.indexes[pos].insert((key, row_id));
        }
        self.rows.insert(row_id, row);
        Ok(old)
    }

    /// Removes a row. Returns the old row.
    pub fn delete(&mut self, row_id: u64) -> EngineResult<Arc<Row>> {
        let old = self.rows.remove(&row_id).ok_or(EngineError::RowNotFound {
            table: self.def.name,
            row_id,
        })?;
        let old_keys = self.index_keys(&old);
        for (pos, key) in old_keys.into_iter().enumerate() {
            self.indexes[pos].remove(&(key, row_id));
        }
        Ok(old)
    }

    /// Row ids whose index key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, index: &'static str, prefix: &[u8]) -> EngineResult<Vec<u64>> {
        let pos = self.index_pos(index)?;
        let set = &self.indexes[pos];
        let lower = Bound::Included((prefix.to_vec(), 0u64));
        let ids = match keys::prefix_successor(prefix) {
            Some(upper) => set
                .range((lower, Bound::Excluded((upper, 0u64))))
                .map(|(_, id)| *id)
                .collect(),
            None => set
                .range((lower, Bound::Unbounded))
                .map(|(_, id)| *id)
                .collect(),
        };
        Ok(ids)
    }

    /// Row ids within `prefix` whose key is at or below `upper`, walked
    /// from `upper` toward the start of the ordering.
    pub fn scan_rev_upto(
        &self,
        index: &'static str,
        prefix: &[u8],
        upper: &[u8],
    ) -> EngineResult<Vec<u64>> {
        let pos = self.index_pos(index)?;
        let set = &self.indexes[pos];
        let lower = (prefix.to_vec(), 0u64);
        let upper = (upper.to_vec(), u64::MAX);
        Ok(set.range(lower..=upper).rev().map(|(_, id)| *id).collect())
    }

    fn index_pos(&self, name: &'static str) -> EngineResult<usize> {
        self.def
            .indexes
            .iter()
            .position(|i| i.name == name)
            .ok_or(EngineError::UnknownIndex {
                table: self.def.name,
                index: name,
            })
    }

    fn key_in_use(&self, pos: usize, key: &[u8], exclude: Option<u64>) -> bool {
        self.indexes[pos]
            .range((key.to_vec(), 0u64)..=(key.to_vec(), u64::MAX))
            .any(|(_, id)| Some(*id) != exclude)
    }

    fn index_keys(&self, row: &Row) -> Vec<Vec<u8>> {
        self.index_columns
            .iter()
            .map(|components| {
                let parts: Vec<(&Value, bool)> = components
                    .iter()
                    .map(|(position, descending)| (&row[*position], *descending))
                    .collect();
                keys::encode_key(&parts)
            })
            .collect()
    }

    /// Pads trailing columns that declare a default, then validates
    /// arity and column kinds.
    fn normalize(&self, row: Arc<Row>) -> EngineResult<Arc<Row>> {
        let columns = self.def.columns;
        let row = if row.len() < columns.len() {
            let mut padded = (*row).clone();
            for column in &columns[row.len()..] {
                match column.default {
                    Some(default) => padded.push(default.to_value()),
                    None => {
                        return Err(EngineError::ColumnMismatch {
                            table: self.def.name,
                            detail: format!("row is missing column {}", column.name),
                        })
                    }
                }
            }
            Arc::new(padded)
        } else {
            row
        };
        if row.len() != columns.len() {
            return Err(EngineError::ColumnMismatch {
                table: self.def.name,
                detail: format!("row has {} columns, expected {}", row.len(), columns.len()),
            });
        }
        for (value, column) in row.iter().zip(columns) {
            if value.kind() != column.kind {
                return Err(EngineError::ColumnMismatch {
                    table: self.def.name,
                    detail: format!("column {} holds the wrong value kind", column.name),
                });
            }
        }
        Ok(row)
    }
}

/// One mutation, as recorded in a batch's redo list and in the log.
#[derive(Debug, Clone)]
pub enum TableOp {
    Insert {
        table: TableId,
        row_id: u64,
        row: Arc<Row>,
    },
    Update {
        table: TableId,
        row_id: u64,
        row: Arc<Row>,
    },
    Delete {
        table: TableId,
        row_id: u64,
    },
}

impl TableOp {
    pub fn table(&self) -> TableId {
        match self {
            TableOp::Insert { table, .. }
            | TableOp::Update { table, .. }
            | TableOp::Delete { table, .. } => *table,
        }
    }
}

/// The full table state of one store.
#[derive(Debug, Clone)]
pub struct Tables {
    pub details: Table,
    pub files: Table,
    pub locks: Table,
    pub mapped_results: Table,
    pub reduce_results: Table,
}

impl Tables {
    pub fn new() -> EngineResult<Tables> {
        Ok(Tables {
            details: Table::new(TableId::Details.def())?,
            files: Table::new(TableId::Files.def())?,
            locks: Table::new(TableId::Locks.def())?,
            mapped_results: Table::new(TableId::MappedResults.def())?,
            reduce_results: Table::new(TableId::ReduceResults.def())?,
        })
    }

    pub fn table(&self, id: TableId) -> &Table {
        match id {
            TableId::Details => &self.details,
            TableId::Files => &self.files,
            TableId::Locks => &self.locks,
            TableId::MappedResults => &self.mapped_results,
            TableId::ReduceResults => &self.reduce_results,
        }
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        match id {
            TableId::Details => &mut self.details,
            TableId::Files => &mut self.files,
            TableId::Locks => &mut self.locks,
            TableId::MappedResults => &mut self.mapped_results,
            TableId::ReduceResults => &mut self.reduce_results,
        }
    }

    /// Applies one op and returns its inverse, so a caller that fails
    /// partway through a batch can restore the previous state.
    pub fn apply(&mut self, op: &TableOp) -> EngineResult<TableOp> {
        match op {
            TableOp::Insert { table, row_id, row } => {
                self.table_mut(*table).insert_with_id(*row_id, row.clone())?;
                Ok(TableOp::Delete {
                    table: *table,
                    row_id: *row_id,
                })
            }
            TableOp::Update { table, row_id, row } => {
                let old = self.table_mut(*table).update(*row_id, row.clone())?;
                Ok(TableOp::Update {
                    table: *table,
                    row_id: *row_id,
                    row: old,
                })
            }
            TableOp::Delete { table, row_id } => {
                let old = self.table_mut(*table).delete(*row_id)?;
                Ok(TableOp::Insert {
                    table: *table,
                    row_id: *row_id,
                    row: old,
                })
            }
        }
    }

    /// Highest row id across all tables.
    pub fn max_row_id(&self) -> u64 {
        TableId::ALL
            .iter()
            .map(|id| self.table(*id).max_row_id())
            .max()
            .unwrap_or(0)
    }
}
