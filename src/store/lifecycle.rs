//! Store lifecycle and batch dispatch
//!
//! The store owns the physical engine handle: it creates or attaches
//! the log at open, verifies (or migrates) the schema version from the
//! details row, resolves the column cache, and then dispatches every
//! runtime operation through per-batch accessors.
//!
//! Batch association is thread-local and keyed by store instance, so
//! nested `batch` calls on the same thread join the already-open
//! accessor instead of opening a nested transaction, and independent
//! stores nest without interfering. Disposal takes the process-wide
//! guard exclusively: it waits for in-flight batches, compacts the
//! log, and thereafter `batch` calls are silently ignored.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::engine::{
    replay, write_snapshot, EngineError, LogWriter, Tables, Value, SCHEMA_VERSION,
};
use crate::migrations;
use crate::observability::{Logger, Severity};
use crate::store::accessor::StorageAccessor;
use crate::store::columns::TablesColumnsCache;
use crate::store::directory::IndexDirectory;
use crate::store::errors::{StorageError, StorageResult};

/// Name of the log file inside the store directory.
pub const LOG_FILE_NAME: &str = "indexes.quill";

static OPEN_INSTANCES: AtomicUsize = AtomicUsize::new(0);
static NEXT_STORE_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Open accessors on this thread, keyed by store instance.
    static CURRENT_BATCHES: RefCell<Vec<(u64, Rc<StorageAccessor>)>> =
        const { RefCell::new(Vec::new()) };
}

/// Mutable state shared by every batch of one store.
pub(crate) struct SharedState {
    pub(crate) tables: Tables,
    pub(crate) log: LogWriter,
    /// Lowercased (directory, name) pairs held by in-flight batches.
    /// A reservation is what makes concurrent lock acquisition
    /// single-winner before either batch commits.
    pub(crate) lock_reservations: HashSet<(String, String)>,
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) columns: TablesColumnsCache,
    pub(crate) instance_id: Uuid,
    /// Process-unique key for the thread-local batch registry.
    pub(crate) store_key: u64,
    pub(crate) shared: Mutex<SharedState>,
    /// Held shared by running batches, exclusively by disposal.
    disposal: RwLock<bool>,
    next_row_id: AtomicU64,
    next_etag: AtomicU64,
}

impl StoreInner {
    pub(crate) fn shared(&self) -> StorageResult<MutexGuard<'_, SharedState>> {
        self.shared.lock().map_err(|_| {
            StorageError::Engine(EngineError::Corruption(
                "shared state lock poisoned by a failed batch".into(),
            ))
        })
    }

    pub(crate) fn alloc_row_id(&self) -> u64 {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn alloc_etag(&self) -> u64 {
        self.next_etag.fetch_add(1, Ordering::SeqCst)
    }

    fn log_path(&self) -> PathBuf {
        self.config.path.join(LOG_FILE_NAME)
    }

    pub(crate) fn current_batch(&self) -> StorageResult<Rc<StorageAccessor>> {
        current_batch_for(self.store_key).ok_or(StorageError::NotInBatch)
    }

    pub(crate) fn dispose(&self) {
        let mut disposed = self.disposal.write().unwrap_or_else(|e| e.into_inner());
        if *disposed {
            return;
        }
        *disposed = true;

        match self.shared.lock() {
            Ok(shared) => {
                if let Err(e) = write_snapshot(&self.log_path(), &shared.tables) {
                    Logger::log(
                        Severity::Error,
                        "store_compaction_failed",
                        &[("error", &e.to_string())],
                    );
                }
            }
            Err(_) => Logger::log(
                Severity::Error,
                "store_compaction_skipped",
                &[("reason", "shared state lock poisoned")],
            ),
        }
        OPEN_INSTANCES.fetch_sub(1, Ordering::SeqCst);
        Logger::log(
            Severity::Info,
            "store_disposed",
            &[("path", &self.config.path.display().to_string())],
        );
    }

    fn is_disposed(&self) -> bool {
        *self.disposal.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs `action` against the store's batch machinery: joins the batch
/// already open on this thread, or opens a fresh accessor, commits on
/// `Ok`, and rolls back (accessor drop without commit) on `Err`.
/// Silently ignored once the store is disposed.
pub(crate) fn run_batch(
    store: &Arc<StoreInner>,
    action: impl FnOnce(&Rc<StorageAccessor>) -> StorageResult<()>,
) -> StorageResult<()> {
    if let Some(accessor) = current_batch_for(store.store_key) {
        // already inside a batch on this thread: join it, the outer
        // frame owns commit/rollback
        return action(&accessor);
    }

    let disposed = store.disposal.read().unwrap_or_else(|e| e.into_inner());
    if *disposed {
        // shutdown may race with late callers; ignoring is the
        // contract here, current_batch still fails explicitly
        Logger::log(Severity::Trace, "batch_after_dispose_ignored", &[]);
        return Ok(());
    }

    let accessor = Rc::new(StorageAccessor::open(Arc::clone(store))?);
    let _registration = BatchRegistration::register(store.store_key, Rc::clone(&accessor));
    match action(&accessor) {
        Ok(()) => accessor.commit(),
        Err(e) => Err(e), // dropping the accessor uncommitted rolls back
    }
}

fn current_batch_for(store_key: u64) -> Option<Rc<StorageAccessor>> {
    CURRENT_BATCHES.with(|batches| {
        batches
            .borrow()
            .iter()
            .find(|(key, _)| *key == store_key)
            .map(|(_, accessor)| Rc::clone(accessor))
    })
}

/// Clears the thread-local batch registration on every exit path,
/// including unwinds out of the batch action.
struct BatchRegistration {
    store_key: u64,
}

impl BatchRegistration {
    fn register(store_key: u64, accessor: Rc<StorageAccessor>) -> BatchRegistration {
        CURRENT_BATCHES.with(|batches| batches.borrow_mut().push((store_key, accessor)));
        BatchRegistration { store_key }
    }
}

impl Drop for BatchRegistration {
    fn drop(&mut self) {
        CURRENT_BATCHES.with(|batches| {
            batches.borrow_mut().retain(|(key, _)| *key != self.store_key);
        });
    }
}

/// The transactional store for index files, locks, and map/reduce
/// results.
pub struct IndexingStore {
    inner: Arc<StoreInner>,
    created_new: bool,
}

impl std::fmt::Debug for IndexingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingStore")
            .field("created_new", &self.created_new)
            .finish_non_exhaustive()
    }
}

impl IndexingStore {
    /// Opens the store at `config.path`, creating it with the current
    /// schema when absent. An older on-disk schema version is migrated
    /// before the store comes up; a version with no migration path is
    /// a fatal, actionable error.
    pub fn initialize(config: StoreConfig) -> StorageResult<IndexingStore> {
        config.validate()?;
        let limit = config.max_instances;
        let open = OPEN_INSTANCES.fetch_add(1, Ordering::SeqCst) + 1;
        if open > limit {
            OPEN_INSTANCES.fetch_sub(1, Ordering::SeqCst);
            return Err(StorageError::TooManyInstances { limit });
        }
        match Self::open(config) {
            Ok(store) => Ok(store),
            Err(e) => {
                OPEN_INSTANCES.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn open(config: StoreConfig) -> StorageResult<IndexingStore> {
        let columns = TablesColumnsCache::resolve()?;
        fs::create_dir_all(&config.path).map_err(EngineError::from)?;
        let log_path = config.path.join(LOG_FILE_NAME);
        let created_new = !log_path.exists();

        let tables = if created_new {
            let mut tables = Tables::new()?;
            let instance_id = Uuid::new_v4();
            tables.details.insert(vec![
                Value::Bytes(instance_id.as_bytes().to_vec()),
                Value::Text(SCHEMA_VERSION.to_string()),
            ])?;
            write_snapshot(&log_path, &tables)?;
            Logger::log(
                Severity::Info,
                "store_created",
                &[("path", &log_path.display().to_string())],
            );
            tables
        } else {
            let outcome = replay(&log_path)?;
            if outcome.truncated_bytes > 0 {
                Logger::log(
                    Severity::Warn,
                    "torn_log_tail_truncated",
                    &[
                        ("bytes", &outcome.truncated_bytes.to_string()),
                        ("path", &log_path.display().to_string()),
                    ],
                );
            }
            let mut tables = outcome.tables;
            let version = read_schema_version(&tables, &columns)?;
            if version != SCHEMA_VERSION {
                migrations::run(&mut tables, &version)?;
                write_snapshot(&log_path, &tables)?;
                Logger::log(
                    Severity::Info,
                    "schema_migrated",
                    &[("from", version.as_str()), ("to", SCHEMA_VERSION)],
                );
            }
            tables
        };

        let instance_id = read_instance_id(&tables, &columns)?;
        let next_row_id = tables.max_row_id() + 1;
        let next_etag = max_etag(&tables, &columns)? + 1;
        let log = LogWriter::open(&log_path, config.durable_fsync)?;

        Logger::log(
            Severity::Info,
            "store_opened",
            &[
                ("instance_id", &instance_id.to_string()),
                ("path", &config.path.display().to_string()),
            ],
        );

        Ok(IndexingStore {
            created_new,
            inner: Arc::new(StoreInner {
                config,
                columns,
                instance_id,
                store_key: NEXT_STORE_KEY.fetch_add(1, Ordering::SeqCst),
                shared: Mutex::new(SharedState {
                    tables,
                    log,
                    lock_reservations: HashSet::new(),
                }),
                disposal: RwLock::new(false),
                next_row_id: AtomicU64::new(next_row_id),
                next_etag: AtomicU64::new(next_etag),
            }),
        })
    }

    /// True when this open created a fresh store.
    pub fn created_new(&self) -> bool {
        self.created_new
    }

    /// The unique id written to the details row at creation.
    pub fn id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Runs `action` inside a batch: a fresh accessor when the calling
    /// thread has none open for this store, the already-open one
    /// otherwise. Commits when `action` returns `Ok`, rolls back and
    /// propagates its error otherwise. Silently ignored after
    /// disposal.
    pub fn batch(
        &self,
        action: impl FnOnce(&Rc<StorageAccessor>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        run_batch(&self.inner, action)
    }

    /// The accessor of the batch open on the calling thread.
    pub fn current_batch(&self) -> StorageResult<Rc<StorageAccessor>> {
        self.inner.current_batch()
    }

    /// A view of one logical directory inside this store.
    pub fn directory(&self, name: &str) -> IndexDirectory {
        IndexDirectory::new(Arc::clone(&self.inner), name)
    }

    /// Shuts the store down: waits for in-flight batches, compacts the
    /// log, and ignores any later `batch` calls. Safe to call more
    /// than once.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for IndexingStore {
    fn drop(&mut self) {
        if !self.inner.is_disposed() {
            // deterministic cleanup still happens; the warning exists
            // to surface call sites that skipped dispose()
            Logger::log(
                Severity::Warn,
                "store_dropped_without_dispose",
                &[("path", &self.inner.config.path.display().to_string())],
            );
            self.inner.dispose();
        }
    }
}

fn details_row(tables: &Tables) -> StorageResult<&std::sync::Arc<crate::engine::Row>> {
    tables
        .details
        .iter()
        .map(|(_, row)| row)
        .next()
        .ok_or_else(|| details_corruption("the details row is missing"))
}

fn read_schema_version(tables: &Tables, columns: &TablesColumnsCache) -> StorageResult<String> {
    let row = details_row(tables)?;
    let version = row
        .get(columns.details.schema_version.0)
        .and_then(|v| v.as_text())
        .ok_or_else(|| details_corruption("the schema_version column is unreadable"))?;
    Ok(version.to_string())
}

fn read_instance_id(tables: &Tables, columns: &TablesColumnsCache) -> StorageResult<Uuid> {
    let row = details_row(tables)?;
    let bytes = row
        .get(columns.details.id.0)
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| details_corruption("the id column is unreadable"))?;
    Uuid::from_slice(bytes).map_err(|_| details_corruption("the id column is not a 16-byte id"))
}

fn details_corruption(detail: &str) -> StorageError {
    StorageError::Engine(EngineError::Corruption(format!(
        "could not read store details from disk ({}); it is likely that there is a version \
         difference between the library and the store on disk; you need to migrate the disk \
         version to the library version, alternatively, if the data isn't important, you can \
         delete the store directory and it will be re-created (with no data) with the library \
         version",
        detail
    )))
}

fn max_etag(tables: &Tables, columns: &TablesColumnsCache) -> StorageResult<u64> {
    let mut max = 0i64;
    for (_, row) in tables.mapped_results.iter() {
        if let Some(etag) = row.get(columns.mapped_results.etag.0).and_then(|v| v.as_int()) {
            max = max.max(etag);
        }
    }
    for (_, row) in tables.reduce_results.iter() {
        if let Some(etag) = row.get(columns.reduce_results.etag.0).and_then(|v| v.as_int()) {
            max = max.max(etag);
        }
    }
    Ok(max as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_creates_then_attaches() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());

        let store = IndexingStore::initialize(config.clone()).unwrap();
        assert!(store.created_new());
        let first_id = store.id();
        store.dispose();
        drop(store);

        let store = IndexingStore::initialize(config).unwrap();
        assert!(!store.created_new());
        assert_eq!(store.id(), first_id);
        store.dispose();
    }

    #[test]
    fn current_batch_outside_a_batch_fails() {
        let dir = TempDir::new().unwrap();
        let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
        assert!(matches!(
            store.current_batch(),
            Err(StorageError::NotInBatch)
        ));
        store.dispose();
    }

    #[test]
    fn nested_batch_joins_the_outer_accessor() {
        let dir = TempDir::new().unwrap();
        let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
        store
            .batch(|outer| {
                let outer = Rc::clone(outer);
                store.batch(|inner| {
                    assert!(Rc::ptr_eq(&outer, inner));
                    Ok(())
                })
            })
            .unwrap();
        store.dispose();
    }

    #[test]
    fn batch_after_dispose_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
        store.dispose();
        let result = store.batch(|_| panic!("must not run"));
        assert!(result.is_ok());
    }

    #[test]
    fn instance_limit_is_enforced() {
        // the open-instance counter is process-wide and other tests
        // hold stores open concurrently, so pin one open store and
        // assert that a limit of 1 rejects a second
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let store = IndexingStore::initialize(StoreConfig::new(dir_a.path())).unwrap();

        let mut config_b = StoreConfig::new(dir_b.path());
        config_b.max_instances = 1;
        let err = IndexingStore::initialize(config_b).unwrap_err();
        assert!(matches!(err, StorageError::TooManyInstances { limit: 1 }));
        store.dispose();
    }
}
