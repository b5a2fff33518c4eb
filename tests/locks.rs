//! Named-lock contract tests
//!
//! Acquisition is a single atomic insert attempt: contention is a
//! `false` return rather than an error, release is idempotent, and of
//! two batches racing on different threads exactly one wins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

use quillstore::config::StoreConfig;
use quillstore::store::IndexingStore;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> IndexingStore {
    IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap()
}

#[test]
fn acquire_release_reacquire_cycle() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .batch(|accessor| {
            assert!(accessor.try_create_lock("idx1", "write.lock")?);
            assert!(accessor.is_locked("idx1", "write.lock")?);
            Ok(())
        })
        .unwrap();

    store
        .batch(|accessor| {
            // held by the previous committed batch
            assert!(!accessor.try_create_lock("idx1", "write.lock")?);
            accessor.release_lock("idx1", "write.lock")?;
            assert!(accessor.try_create_lock("idx1", "write.lock")?);
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn release_of_unheld_lock_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store
        .batch(|accessor| {
            accessor.release_lock("idx1", "never.lock")?;
            accessor.release_lock("idx1", "never.lock")?;
            assert!(!accessor.is_locked("idx1", "never.lock")?);
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn concurrent_acquire_has_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let barrier = Barrier::new(2);
    let wins = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                store
                    .batch(|accessor| {
                        barrier.wait();
                        if accessor.try_create_lock("idx1", "write.lock")? {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(())
                    })
                    .unwrap();
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    store
        .batch(|accessor| {
            assert!(accessor.is_locked("idx1", "write.lock")?);
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn rolled_back_acquisition_frees_the_lock() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let result = store.batch(|accessor| {
        assert!(accessor.try_create_lock("idx1", "write.lock")?);
        Err(quillstore::store::StorageError::InvalidOperation(
            "force a rollback",
        ))
    });
    assert!(result.is_err());

    store
        .batch(|accessor| {
            assert!(!accessor.is_locked("idx1", "write.lock")?);
            assert!(accessor.try_create_lock("idx1", "write.lock")?);
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn locks_collate_case_insensitively() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store
        .batch(|accessor| {
            assert!(accessor.try_create_lock("idx1", "Write.Lock")?);
            assert!(!accessor.try_create_lock("IDX1", "write.lock")?);
            assert!(accessor.is_locked("idx1", "WRITE.LOCK")?);
            Ok(())
        })
        .unwrap();
    store.dispose();
}
