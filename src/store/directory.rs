//! Directory abstraction over the files and locks tables
//!
//! This is the integration surface for the search-index consumer: a
//! named logical directory with file listing, existence, length,
//! version, touch/delete/rename, batch-scoped input/output streams,
//! and advisory locks. Metadata operations each run in their own
//! batch (joining the caller's batch when one is open on this
//! thread); streams and locks require an open batch because they hold
//! accessor state.

use std::rc::Rc;
use std::sync::Arc;

use crate::store::accessor::StorageAccessor;
use crate::store::errors::StorageResult;
use crate::store::lifecycle::{run_batch, StoreInner};
use crate::store::stream::FileStream;

/// A view of one logical directory inside an indexing store.
pub struct IndexDirectory {
    store: Arc<StoreInner>,
    directory: String,
}

impl IndexDirectory {
    pub(crate) fn new(store: Arc<StoreInner>, directory: &str) -> IndexDirectory {
        IndexDirectory {
            store,
            directory: directory.to_string(),
        }
    }

    /// The directory name this view is scoped to.
    pub fn name(&self) -> &str {
        &self.directory
    }

    /// Names of all files in this directory, ordered by name.
    pub fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        run_batch(&self.store, |accessor| {
            names = accessor.list_files_in_directory(&self.directory)?;
            Ok(())
        })?;
        Ok(names)
    }

    pub fn file_exists(&self, name: &str) -> StorageResult<bool> {
        let mut exists = false;
        run_batch(&self.store, |accessor| {
            exists = accessor.file_exists_in_directory(&self.directory, name)?;
            Ok(())
        })?;
        Ok(exists)
    }

    /// The file's version counter: opaque, monotonically increasing,
    /// not a wall-clock time.
    pub fn file_modified(&self, name: &str) -> StorageResult<i64> {
        let mut version = 0;
        run_batch(&self.store, |accessor| {
            version = accessor.version_of_file_in_directory(&self.directory, name)?;
            Ok(())
        })?;
        Ok(version)
    }

    pub fn file_length(&self, name: &str) -> StorageResult<u64> {
        let mut length = 0;
        run_batch(&self.store, |accessor| {
            length = accessor.length_of_file_in_directory(&self.directory, name)?;
            Ok(())
        })?;
        Ok(length)
    }

    pub fn touch_file(&self, name: &str) -> StorageResult<()> {
        run_batch(&self.store, |accessor| {
            accessor.touch_file_in_directory(&self.directory, name)
        })
    }

    pub fn delete_file(&self, name: &str) -> StorageResult<()> {
        run_batch(&self.store, |accessor| {
            accessor.delete_file_in_directory(&self.directory, name)
        })
    }

    pub fn rename_file(&self, src: &str, dest: &str) -> StorageResult<()> {
        run_batch(&self.store, |accessor| {
            accessor.rename_file_in_directory(&self.directory, src, dest)
        })
    }

    /// Opens a writable stream over `name`, creating the file when it
    /// does not exist. Requires an open batch on this thread.
    pub fn create_output(&self, name: &str) -> StorageResult<FileStream> {
        let batch = self.store.current_batch()?;
        FileStream::open(&batch, &self.directory, name, true, true)
    }

    /// Opens a read-only stream over an existing file. Requires an
    /// open batch on this thread.
    pub fn open_input(&self, name: &str) -> StorageResult<FileStream> {
        let batch = self.store.current_batch()?;
        FileStream::open(&batch, &self.directory, name, false, false)
    }

    /// An advisory lock handle scoped to the batch open on this
    /// thread.
    pub fn make_lock(&self, name: &str) -> StorageResult<IndexLock> {
        let batch = self.store.current_batch()?;
        Ok(IndexLock {
            batch,
            directory: self.directory.clone(),
            name: name.to_string(),
        })
    }
}

/// Advisory named lock: acquisition is a single atomic insert attempt,
/// non-blocking; waiting is the caller's business.
pub struct IndexLock {
    batch: Rc<StorageAccessor>,
    directory: String,
    name: String,
}

impl IndexLock {
    /// Attempts to acquire; `false` means the lock is already held.
    pub fn obtain(&self) -> StorageResult<bool> {
        self.batch.try_create_lock(&self.directory, &self.name)
    }

    /// Releases the lock; a no-op when it is not held.
    pub fn release(&self) -> StorageResult<()> {
        self.batch.release_lock(&self.directory, &self.name)
    }

    pub fn is_locked(&self) -> StorageResult<bool> {
        self.batch.is_locked(&self.directory, &self.name)
    }
}
