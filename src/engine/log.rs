//! Append-only redo log
//!
//! Durability is one file: every committed batch is appended as a
//! checksummed frame and (by default) fsynced before the commit
//! returns. Opening a store replays the log from the start; a torn
//! final frame is truncated away, anything else that fails
//! verification aborts the open. Compaction rewrites the entire table
//! state as a single snapshot frame into a sibling file and atomically
//! renames it over the log.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use super::errors::EngineResult;
use super::record::LogRecord;
use super::schema::TableId;
use super::table::{TableOp, Tables};

/// Appends committed batches to the log file.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
    fsync: bool,
}

impl LogWriter {
    /// Opens the log for appending. The file must already exist (store
    /// creation writes the initial snapshot first).
    pub fn open(path: &Path, fsync: bool) -> EngineResult<LogWriter> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(LogWriter { file, fsync })
    }

    /// Appends one record and makes it durable.
    pub fn append(&mut self, record: &LogRecord) -> EngineResult<()> {
        let frame = record.encode();
        self.file.write_all(&frame)?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// The result of replaying a log file.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub tables: Tables,
    /// Bytes dropped from a torn final frame, 0 on a clean log.
    pub truncated_bytes: u64,
}

/// Rebuilds table state from the log at `path`, truncating a torn
/// final frame in place so the next append starts on a clean boundary.
pub fn replay(path: &Path) -> EngineResult<ReplayOutcome> {
    let data = fs::read(path)?;
    let mut tables = Tables::new()?;
    let mut pos = 0;

    while pos < data.len() {
        match LogRecord::decode_frame(&data[pos..])? {
            Some((record, consumed)) => {
                for op in &record.ops {
                    tables.apply(op)?;
                }
                pos += consumed;
            }
            None => break,
        }
    }

    let truncated_bytes = (data.len() - pos) as u64;
    if truncated_bytes > 0 {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(pos as u64)?;
        file.sync_data()?;
    }

    Ok(ReplayOutcome {
        tables,
        truncated_bytes,
    })
}

/// Builds the single record that reproduces `tables` from empty.
pub fn snapshot_record(tables: &Tables) -> LogRecord {
    let mut ops = Vec::new();
    for id in TableId::ALL {
        for (row_id, row) in tables.table(id).iter() {
            ops.push(TableOp::Insert {
                table: id,
                row_id,
                row: Arc::clone(row),
            });
        }
    }
    LogRecord::new(ops)
}

/// Writes the full state of `tables` as one snapshot frame, replacing
/// the log at `path` atomically.
pub fn write_snapshot(path: &Path, tables: &Tables) -> EngineResult<()> {
    let record = snapshot_record(tables);
    let frame = record.encode();

    let mut tmp_path = path.as_os_str().to_os_string();
    tmp_path.push(".compact");
    let tmp_path = std::path::PathBuf::from(tmp_path);

    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(&frame)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::value::Value;
    use tempfile::TempDir;

    fn lock_insert(row_id: u64, directory: &str, name: &str) -> TableOp {
        TableOp::Insert {
            table: TableId::Locks,
            row_id,
            row: Arc::new(vec![Value::Text(directory.into()), Value::Text(name.into())]),
        }
    }

    #[test]
    fn replay_rebuilds_appended_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.quill");
        let tables = Tables::new().unwrap();
        write_snapshot(&path, &tables).unwrap();

        let mut writer = LogWriter::open(&path, true).unwrap();
        writer
            .append(&LogRecord::new(vec![lock_insert(1, "idx", "write.lock")]))
            .unwrap();
        writer
            .append(&LogRecord::new(vec![
                lock_insert(2, "idx", "commit.lock"),
                TableOp::Delete {
                    table: TableId::Locks,
                    row_id: 1,
                },
            ]))
            .unwrap();

        let outcome = replay(&path).unwrap();
        assert_eq!(outcome.truncated_bytes, 0);
        assert_eq!(outcome.tables.locks.len(), 1);
        let row = outcome.tables.locks.get(2).unwrap();
        assert_eq!(row[1].as_text(), Some("commit.lock"));
    }

    #[test]
    fn torn_tail_is_truncated_and_prior_state_survives() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.quill");
        write_snapshot(&path, &Tables::new().unwrap()).unwrap();

        let mut writer = LogWriter::open(&path, true).unwrap();
        writer
            .append(&LogRecord::new(vec![lock_insert(1, "idx", "write.lock")]))
            .unwrap();
        drop(writer);

        // simulate a crash mid-append: half a frame at the tail
        let frame = LogRecord::new(vec![lock_insert(2, "idx", "torn.lock")]).encode();
        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&frame[..frame.len() / 2]);
        fs::write(&path, &data).unwrap();

        let outcome = replay(&path).unwrap();
        assert!(outcome.truncated_bytes > 0);
        assert_eq!(outcome.tables.locks.len(), 1);

        // a second replay sees a clean log
        let outcome = replay(&path).unwrap();
        assert_eq!(outcome.truncated_bytes, 0);
        assert_eq!(outcome.tables.locks.len(), 1);
    }

    #[test]
    fn corrupt_interior_frame_fails_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.quill");
        write_snapshot(&path, &Tables::new().unwrap()).unwrap();

        let mut writer = LogWriter::open(&path, true).unwrap();
        writer
            .append(&LogRecord::new(vec![lock_insert(1, "idx", "write.lock")]))
            .unwrap();
        writer
            .append(&LogRecord::new(vec![lock_insert(2, "idx", "other.lock")]))
            .unwrap();
        drop(writer);

        let mut data = fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let err = replay(&path).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn snapshot_roundtrip_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.quill");

        let mut tables = Tables::new().unwrap();
        tables
            .locks
            .insert(vec![Value::Text("idx".into()), Value::Text("write.lock".into())])
            .unwrap();
        tables
            .files
            .insert(vec![
                Value::Text("idx".into()),
                Value::Text("segments_1".into()),
                Value::Int(4),
                Value::Bytes(b"bytes".to_vec()),
            ])
            .unwrap();

        write_snapshot(&path, &tables).unwrap();
        let outcome = replay(&path).unwrap();
        assert_eq!(outcome.tables.locks.len(), 1);
        assert_eq!(outcome.tables.files.len(), 1);
    }
}
