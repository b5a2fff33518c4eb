//! Streaming adapter over the files blob column
//!
//! A `FileStream` never holds a live cursor into the table. It keeps
//! an opaque bookmark (row locator) plus a cached logical position,
//! and re-navigates to the row before every operation, because cursor
//! positions are not guaranteed to survive across other table activity
//! in the same transaction. Write-class operations replace the whole
//! row through the engine's update path, so a reader never observes a
//! partially written payload.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::engine::{TableId, Value};
use crate::store::accessor::StorageAccessor;
use crate::store::columns::ColumnId;

/// Opaque locator for a files row, usable to re-navigate without a
/// fresh key seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bookmark(u64);

impl Bookmark {
    pub(crate) fn new(row_id: u64) -> Bookmark {
        Bookmark(row_id)
    }
}

/// Seekable byte stream over one file's payload, scoped to the batch
/// that opened it.
pub struct FileStream {
    accessor: Rc<StorageAccessor>,
    bookmark: Bookmark,
    write: bool,
    data_column: ColumnId,
    /// Cached logical offset, reapplied on every access.
    position: u64,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("bookmark", &self.bookmark)
            .field("write", &self.write)
            .field("data_column", &self.data_column)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl FileStream {
    /// Opens a stream over the file's payload within `accessor`'s
    /// batch. With `create_if_missing` an absent file is created
    /// empty; without it absence is a typed failure. Writing requires
    /// `write`.
    pub fn open(
        accessor: &Rc<StorageAccessor>,
        directory: &str,
        name: &str,
        create_if_missing: bool,
        write: bool,
    ) -> crate::store::StorageResult<FileStream> {
        let bookmark = accessor.resolve_file_row(directory, name, create_if_missing)?;
        Ok(FileStream {
            accessor: Rc::clone(accessor),
            bookmark,
            write,
            data_column: accessor.columns().files.data,
            position: 0,
        })
    }

    /// Current payload length in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.resolve()?.len() as u64)
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Truncates or zero-extends the payload.
    pub fn set_len(&mut self, new_len: u64) -> io::Result<()> {
        self.ensure_writable()?;
        let mut data = self.resolve()?;
        data.resize(new_len as usize, 0);
        self.save(data)?;
        self.position = self.position.min(new_len);
        Ok(())
    }

    /// Re-navigates to the row and returns a copy of its payload.
    fn resolve(&self) -> io::Result<Vec<u8>> {
        let row = self
            .accessor
            .get_row(TableId::Files, self.bookmark.0)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "file row no longer exists")
            })?;
        row.get(self.data_column.0)
            .and_then(|v| v.as_bytes())
            .map(|b| b.to_vec())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "file data column is unreadable")
            })
    }

    /// Writes the payload back as a whole-row update.
    fn save(&self, data: Vec<u8>) -> io::Result<()> {
        let row = self
            .accessor
            .get_row(TableId::Files, self.bookmark.0)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "file row no longer exists")
            })?;
        let mut row = (*row).clone();
        let modified = self.accessor.columns().files.modified;
        if let Some(version) = row.get(modified.0).and_then(|v| v.as_int()) {
            row[modified.0] = Value::Int(version + 1);
        }
        row[self.data_column.0] = Value::Bytes(data);
        self.accessor
            .update_row(TableId::Files, self.bookmark.0, row)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.write {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cannot write to this stream",
            ))
        }
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.resolve()?;
        let start = (self.position as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_writable()?;
        let mut data = self.resolve()?;
        let start = self.position as usize;
        if data.len() < start {
            // a seek past the end zero-fills on the first write
            data.resize(start, 0);
        }
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.save(data)?;
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_writable()?;
        // writes are applied row-at-a-time as they happen; flushing
        // only re-validates that the row is still reachable
        self.resolve()?;
        Ok(())
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => self.len()? as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::lifecycle::IndexingStore;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> IndexingStore {
        IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .batch(|accessor| {
                let mut out = FileStream::open(accessor, "idx", "seg", true, true)?;
                out.write_all(b"hello stream").map_err(io_to_storage)?;

                let mut input = FileStream::open(accessor, "idx", "seg", false, false)?;
                let mut buf = Vec::new();
                input.read_to_end(&mut buf).map_err(io_to_storage)?;
                assert_eq!(buf, b"hello stream");
                Ok(())
            })
            .unwrap();
        store.dispose();
    }

    #[test]
    fn read_only_stream_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .batch(|accessor| {
                FileStream::open(accessor, "idx", "seg", true, true)?;
                let mut input = FileStream::open(accessor, "idx", "seg", false, false)?;
                let err = input.write(b"nope").unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
                assert_eq!(err.to_string(), "cannot write to this stream");
                Ok(())
            })
            .unwrap();
        store.dispose();
    }

    #[test]
    fn seek_and_overwrite_in_place() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .batch(|accessor| {
                let mut stream = FileStream::open(accessor, "idx", "seg", true, true)?;
                stream.write_all(b"0123456789").map_err(io_to_storage)?;
                stream.seek(SeekFrom::Start(4)).map_err(io_to_storage)?;
                stream.write_all(b"XY").map_err(io_to_storage)?;

                let mut input = FileStream::open(accessor, "idx", "seg", false, false)?;
                let mut buf = Vec::new();
                input.read_to_end(&mut buf).map_err(io_to_storage)?;
                assert_eq!(buf, b"0123XY6789");
                Ok(())
            })
            .unwrap();
        store.dispose();
    }

    #[test]
    fn writes_past_the_end_zero_fill() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .batch(|accessor| {
                let mut stream = FileStream::open(accessor, "idx", "seg", true, true)?;
                stream.seek(SeekFrom::Start(3)).map_err(io_to_storage)?;
                stream.write_all(b"ab").map_err(io_to_storage)?;
                assert_eq!(stream.len().map_err(io_to_storage)?, 5);

                let mut input = FileStream::open(accessor, "idx", "seg", false, false)?;
                let mut buf = Vec::new();
                input.read_to_end(&mut buf).map_err(io_to_storage)?;
                assert_eq!(buf, [0, 0, 0, b'a', b'b']);
                Ok(())
            })
            .unwrap();
        store.dispose();
    }

    #[test]
    fn stream_survives_other_table_activity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store
            .batch(|accessor| {
                let mut stream = FileStream::open(accessor, "idx", "seg", true, true)?;
                stream.write_all(b"first").map_err(io_to_storage)?;

                // move the table's natural cursor elsewhere
                FileStream::open(accessor, "idx", "other", true, true)?;
                accessor.delete_file_in_directory("idx", "other")?;

                stream.write_all(b" second").map_err(io_to_storage)?;
                let mut input = FileStream::open(accessor, "idx", "seg", false, false)?;
                let mut buf = Vec::new();
                input.read_to_end(&mut buf).map_err(io_to_storage)?;
                assert_eq!(buf, b"first second");
                Ok(())
            })
            .unwrap();
        store.dispose();
    }

    fn io_to_storage(e: io::Error) -> crate::store::StorageError {
        crate::store::StorageError::Engine(crate::engine::EngineError::Io(e))
    }
}
