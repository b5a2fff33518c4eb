//! Transaction/batch accessor
//!
//! One accessor is one logical transaction. At open it snapshots the
//! shared tables (cheap: rows are shared behind `Arc`) and from then
//! on reads see the snapshot plus the batch's own writes, while every
//! mutation is also recorded in a redo list. Commit appends the redo
//! list to the log as a single durable record and applies it to the
//! shared tables under one critical section; dropping the accessor
//! uncommitted discards everything.
//!
//! Named locks are the one place a batch touches shared state before
//! commit: acquisition takes a process-shared reservation, so of two
//! overlapping batches racing for the same lock exactly one sees
//! `true`. Reservations are folded into the committed row at commit
//! and released on rollback.
//!
//! The accessor is confined to the thread that opened it; interior
//! state lives in a `RefCell` and the type is deliberately not `Sync`.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::engine::{
    encode_key, EngineError, LogRecord, Row, TableId, TableOp, Tables, Value,
};
use crate::observability::{Logger, Severity};
use crate::store::columns::{ColumnId, TablesColumnsCache};
use crate::store::errors::{StorageError, StorageResult};
use crate::store::lifecycle::StoreInner;
use crate::store::stream::Bookmark;

pub(crate) struct BatchState {
    pub(crate) snapshot: Tables,
    pub(crate) ops: Vec<TableOp>,
    /// Lowercased (directory, name) keys this batch reserved.
    reserved_locks: Vec<(String, String)>,
}

/// CRUD over files and locks (and, via the map/reduce module, the
/// result tables) scoped to one open transaction.
pub struct StorageAccessor {
    store: Arc<StoreInner>,
    state: RefCell<BatchState>,
    committed: Cell<bool>,
}

impl StorageAccessor {
    pub(crate) fn open(store: Arc<StoreInner>) -> StorageResult<StorageAccessor> {
        let snapshot = store.shared()?.tables.clone();
        Ok(StorageAccessor {
            store,
            state: RefCell::new(BatchState {
                snapshot,
                ops: Vec::new(),
                reserved_locks: Vec::new(),
            }),
            committed: Cell::new(false),
        })
    }

    pub(crate) fn columns(&self) -> &TablesColumnsCache {
        &self.store.columns
    }

    pub(crate) fn alloc_etag(&self) -> u64 {
        self.store.alloc_etag()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.committed.get() {
            return Err(StorageError::InvalidOperation(
                "the batch has already been committed",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // row-level plumbing shared with the streaming and map/reduce paths
    // ------------------------------------------------------------------

    pub(crate) fn insert_row(&self, table: TableId, row: Row) -> StorageResult<u64> {
        self.ensure_open()?;
        let row_id = self.store.alloc_row_id();
        let row = Arc::new(row);
        let mut state = self.state.borrow_mut();
        state
            .snapshot
            .table_mut(table)
            .insert_with_id(row_id, Arc::clone(&row))?;
        state.ops.push(TableOp::Insert { table, row_id, row });
        Ok(row_id)
    }

    pub(crate) fn update_row(&self, table: TableId, row_id: u64, row: Row) -> StorageResult<()> {
        self.ensure_open()?;
        let row = Arc::new(row);
        let mut state = self.state.borrow_mut();
        state
            .snapshot
            .table_mut(table)
            .update(row_id, Arc::clone(&row))?;
        state.ops.push(TableOp::Update { table, row_id, row });
        Ok(())
    }

    pub(crate) fn delete_row(&self, table: TableId, row_id: u64) -> StorageResult<()> {
        self.ensure_open()?;
        let mut state = self.state.borrow_mut();
        state.snapshot.table_mut(table).delete(row_id)?;
        state.ops.push(TableOp::Delete { table, row_id });
        Ok(())
    }

    pub(crate) fn get_row(&self, table: TableId, row_id: u64) -> Option<Arc<Row>> {
        self.state.borrow().snapshot.table(table).get(row_id).cloned()
    }

    pub(crate) fn scan(
        &self,
        table: TableId,
        index: &'static str,
        prefix: &[u8],
    ) -> StorageResult<Vec<u64>> {
        Ok(self
            .state
            .borrow()
            .snapshot
            .table(table)
            .scan_prefix(index, prefix)?)
    }

    pub(crate) fn scan_rev_upto(
        &self,
        table: TableId,
        index: &'static str,
        prefix: &[u8],
        upper: &[u8],
    ) -> StorageResult<Vec<u64>> {
        Ok(self
            .state
            .borrow()
            .snapshot
            .table(table)
            .scan_rev_upto(index, prefix, upper)?)
    }

    // ------------------------------------------------------------------
    // file operations
    // ------------------------------------------------------------------

    /// Names of all files in `directory`, ordered by name.
    pub fn list_files_in_directory(&self, directory: &str) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let name_col = self.columns().files.name;
        let state = self.state.borrow();
        let ids = state
            .snapshot
            .files
            .scan_prefix("by_path", &directory_prefix(directory))?;
        let mut names = Vec::with_capacity(ids.len());
        for row_id in ids {
            let row = state
                .snapshot
                .files
                .get(row_id)
                .ok_or(EngineError::RowNotFound {
                    table: "files",
                    row_id,
                })?;
            names.push(text_column(row, name_col, "files")?.to_string());
        }
        Ok(names)
    }

    pub fn file_exists_in_directory(&self, directory: &str, name: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self.try_move_to_file(directory, name)?.is_some())
    }

    /// The file's version counter: starts at 1, increments on every
    /// touch, rename, or write. An opaque monotonic value, not a
    /// wall-clock time.
    pub fn version_of_file_in_directory(&self, directory: &str, name: &str) -> StorageResult<i64> {
        self.ensure_open()?;
        let row_id = self.move_to_file(directory, name)?;
        let modified = self.columns().files.modified;
        let state = self.state.borrow();
        let row = state
            .snapshot
            .files
            .get(row_id)
            .ok_or(EngineError::RowNotFound {
                table: "files",
                row_id,
            })?;
        int_column(row, modified, "files")
    }

    pub fn length_of_file_in_directory(&self, directory: &str, name: &str) -> StorageResult<u64> {
        self.ensure_open()?;
        let row_id = self.move_to_file(directory, name)?;
        let data = self.columns().files.data;
        let state = self.state.borrow();
        let row = state
            .snapshot
            .files
            .get(row_id)
            .ok_or(EngineError::RowNotFound {
                table: "files",
                row_id,
            })?;
        Ok(bytes_column(row, data, "files")?.len() as u64)
    }

    /// Bumps the version counter without changing the payload.
    pub fn touch_file_in_directory(&self, directory: &str, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        let row_id = self.move_to_file(directory, name)?;
        let modified = self.columns().files.modified;
        let mut row = self.file_row(row_id)?;
        let version = int_column(&row, modified, "files")?;
        row[modified.0] = Value::Int(version + 1);
        self.update_row(TableId::Files, row_id, row)
    }

    /// Deleting a file that does not exist is a no-op.
    pub fn delete_file_in_directory(&self, directory: &str, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        if let Some(row_id) = self.try_move_to_file(directory, name)? {
            self.delete_row(TableId::Files, row_id)?;
        }
        Ok(())
    }

    /// Carries the payload forward under the new name with the version
    /// bumped, then deletes the old row. Both sides become visible
    /// atomically at commit; a reader in another batch never observes
    /// the file under both names.
    pub fn rename_file_in_directory(
        &self,
        directory: &str,
        src: &str,
        dest: &str,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        let row_id = self.move_to_file(directory, src)?;
        if self.try_move_to_file(directory, dest)?.is_some() {
            return Err(StorageError::FileAlreadyExists {
                directory: directory.to_string(),
                name: dest.to_string(),
            });
        }
        let columns = self.columns().files;
        let row = self.file_row(row_id)?;
        let version = int_column(&row, columns.modified, "files")?;
        let data = bytes_column(&row, columns.data, "files")?.to_vec();
        self.insert_row(
            TableId::Files,
            vec![
                Value::Text(directory.to_string()),
                Value::Text(dest.to_string()),
                Value::Int(version + 1),
                Value::Bytes(data),
            ],
        )?;
        self.delete_row(TableId::Files, row_id)
    }

    /// Locates the file row a stream will be anchored to, creating an
    /// empty file first when `create_if_missing` is set. Absence
    /// without creation is a typed failure. Streams are opened through
    /// [`crate::store::FileStream::open`].
    pub(crate) fn resolve_file_row(
        &self,
        directory: &str,
        name: &str,
        create_if_missing: bool,
    ) -> StorageResult<Bookmark> {
        self.ensure_open()?;
        let row_id = match self.try_move_to_file(directory, name)? {
            Some(row_id) => row_id,
            None if create_if_missing => self.insert_row(
                TableId::Files,
                vec![
                    Value::Text(directory.to_string()),
                    Value::Text(name.to_string()),
                    Value::Int(1),
                    Value::Bytes(Vec::new()),
                ],
            )?,
            None => {
                return Err(StorageError::FileNotFound {
                    directory: directory.to_string(),
                    name: name.to_string(),
                })
            }
        };
        Ok(Bookmark::new(row_id))
    }

    fn file_row(&self, row_id: u64) -> StorageResult<Row> {
        let state = self.state.borrow();
        let row = state
            .snapshot
            .files
            .get(row_id)
            .ok_or(EngineError::RowNotFound {
                table: "files",
                row_id,
            })?;
        Ok((**row).clone())
    }

    fn try_move_to_file(&self, directory: &str, name: &str) -> StorageResult<Option<u64>> {
        let state = self.state.borrow();
        let ids = state
            .snapshot
            .files
            .scan_prefix("by_path", &path_key(directory, name))?;
        Ok(ids.first().copied())
    }

    fn move_to_file(&self, directory: &str, name: &str) -> StorageResult<u64> {
        self.try_move_to_file(directory, name)?
            .ok_or_else(|| StorageError::FileNotFound {
                directory: directory.to_string(),
                name: name.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // lock operations
    // ------------------------------------------------------------------

    /// Attempts to acquire the named lock. `false` means it is already
    /// held, which is the expected contention outcome, not an error.
    pub fn try_create_lock(&self, directory: &str, name: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        if self.lock_row_id(directory, name)?.is_some() {
            return Ok(false);
        }
        let key = reservation_key(directory, name);
        {
            let mut shared = self.store.shared()?;
            if shared.lock_reservations.contains(&key) {
                return Ok(false);
            }
            // a committed row still counts unless this batch deleted it
            let committed = shared
                .tables
                .locks
                .scan_prefix("by_path", &path_key(directory, name))?;
            if committed
                .iter()
                .any(|row_id| !self.deleted_in_batch(TableId::Locks, *row_id))
            {
                return Ok(false);
            }
            shared.lock_reservations.insert(key.clone());
        }
        let inserted = self.insert_row(
            TableId::Locks,
            vec![
                Value::Text(directory.to_string()),
                Value::Text(name.to_string()),
            ],
        );
        match inserted {
            Ok(_) => {
                self.state.borrow_mut().reserved_locks.push(key);
                Ok(true)
            }
            Err(e) => {
                if let Ok(mut shared) = self.store.shared() {
                    shared.lock_reservations.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Releases the named lock; releasing a lock that is not held is a
    /// no-op.
    pub fn release_lock(&self, directory: &str, name: &str) -> StorageResult<()> {
        self.ensure_open()?;
        if let Some(row_id) = self.lock_row_id(directory, name)? {
            self.delete_row(TableId::Locks, row_id)?;
        }
        let key = reservation_key(directory, name);
        let held_here = {
            let mut state = self.state.borrow_mut();
            match state.reserved_locks.iter().position(|k| *k == key) {
                Some(pos) => {
                    state.reserved_locks.remove(pos);
                    true
                }
                None => false,
            }
        };
        if held_here {
            self.store.shared()?.lock_reservations.remove(&key);
        }
        Ok(())
    }

    pub fn is_locked(&self, directory: &str, name: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        if self.lock_row_id(directory, name)?.is_some() {
            return Ok(true);
        }
        let shared = self.store.shared()?;
        if shared
            .lock_reservations
            .contains(&reservation_key(directory, name))
        {
            return Ok(true);
        }
        let committed = shared
            .tables
            .locks
            .scan_prefix("by_path", &path_key(directory, name))?;
        Ok(committed
            .iter()
            .any(|row_id| !self.deleted_in_batch(TableId::Locks, *row_id)))
    }

    /// True when this batch's redo list deletes the given row, so a
    /// still-committed row in the shared tables no longer counts for
    /// this batch.
    fn deleted_in_batch(&self, table: TableId, row_id: u64) -> bool {
        self.state.borrow().ops.iter().any(|op| {
            matches!(op, TableOp::Delete { table: t, row_id: r } if *t == table && *r == row_id)
        })
    }

    fn lock_row_id(&self, directory: &str, name: &str) -> StorageResult<Option<u64>> {
        let state = self.state.borrow();
        let ids = state
            .snapshot
            .locks
            .scan_prefix("by_path", &path_key(directory, name))?;
        Ok(ids.first().copied())
    }

    // ------------------------------------------------------------------
    // transaction boundary
    // ------------------------------------------------------------------

    /// Finalizes the batch: the redo list becomes one durable log
    /// record and is applied to the shared tables. At most once, and
    /// only on the success path; dropping the accessor instead rolls
    /// back.
    pub fn commit(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let (ops, reserved) = {
            let mut state = self.state.borrow_mut();
            (
                std::mem::take(&mut state.ops),
                std::mem::take(&mut state.reserved_locks),
            )
        };

        let mut shared = self.store.shared()?;
        if !ops.is_empty() {
            let mut undo = Vec::with_capacity(ops.len());
            for op in &ops {
                match shared.tables.apply(op) {
                    Ok(inverse) => undo.push(inverse),
                    Err(e) => {
                        rollback_applied(&mut shared.tables, &undo);
                        release_reservations(&mut shared, &reserved);
                        return Err(e.into());
                    }
                }
            }
            let record = LogRecord::new(ops);
            if let Err(e) = shared.log.append(&record) {
                rollback_applied(&mut shared.tables, &undo);
                release_reservations(&mut shared, &reserved);
                return Err(e.into());
            }
        }
        // the reserved locks are committed rows now
        release_reservations(&mut shared, &reserved);
        self.committed.set(true);
        Ok(())
    }
}

impl Drop for StorageAccessor {
    fn drop(&mut self) {
        if self.committed.get() {
            return;
        }
        // rollback: the snapshot and redo list just evaporate, only
        // shared reservations need undoing
        let reserved = std::mem::take(&mut self.state.borrow_mut().reserved_locks);
        if reserved.is_empty() {
            return;
        }
        if let Ok(mut shared) = self.store.shared() {
            release_reservations(&mut shared, &reserved);
        }
    }
}

fn release_reservations(
    shared: &mut crate::store::lifecycle::SharedState,
    reserved: &[(String, String)],
) {
    for key in reserved {
        shared.lock_reservations.remove(key);
    }
}

fn rollback_applied(tables: &mut Tables, undo: &[TableOp]) {
    for inverse in undo.iter().rev() {
        if let Err(e) = tables.apply(inverse) {
            Logger::log(
                Severity::Error,
                "commit_rollback_failed",
                &[("error", &e.to_string())],
            );
        }
    }
}

fn reservation_key(directory: &str, name: &str) -> (String, String) {
    (directory.to_lowercase(), name.to_lowercase())
}

fn path_key(directory: &str, name: &str) -> Vec<u8> {
    encode_key(&[
        (&Value::Text(directory.to_string()), false),
        (&Value::Text(name.to_string()), false),
    ])
}

fn directory_prefix(directory: &str) -> Vec<u8> {
    encode_key(&[(&Value::Text(directory.to_string()), false)])
}

pub(crate) fn text_column<'a>(
    row: &'a Row,
    column: ColumnId,
    table: &'static str,
) -> StorageResult<&'a str> {
    row.get(column.0)
        .and_then(|v| v.as_text())
        .ok_or_else(|| column_error(table))
}

pub(crate) fn int_column(row: &Row, column: ColumnId, table: &'static str) -> StorageResult<i64> {
    row.get(column.0)
        .and_then(|v| v.as_int())
        .ok_or_else(|| column_error(table))
}

pub(crate) fn bytes_column<'a>(
    row: &'a Row,
    column: ColumnId,
    table: &'static str,
) -> StorageResult<&'a [u8]> {
    row.get(column.0)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| column_error(table))
}

fn column_error(table: &'static str) -> StorageError {
    StorageError::Engine(EngineError::ColumnMismatch {
        table,
        detail: "row column holds the wrong value kind".into(),
    })
}
