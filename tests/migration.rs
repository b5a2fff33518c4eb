//! Schema migration tests
//!
//! Fabricates an on-disk store at schema 1.0 (rows without reduce
//! group ids), then opens it and verifies the backfill, the version
//! bump, idempotence under crash-and-retry, and the no-upgrade-path
//! failure for unknown versions.

use std::fs;

use quillstore::config::StoreConfig;
use quillstore::engine::{write_snapshot, Tables, Value};
use quillstore::mapreduce::{compute_reduce_group_id, view_and_reduce_key_hash};
use quillstore::store::{IndexingStore, StorageError, LOG_FILE_NAME};
use tempfile::TempDir;

/// Lays a schema-1.0 log file on disk: details at the old version plus
/// mapped/reduce rows in the old, group-id-free shape.
fn write_legacy_store(dir: &TempDir, version: &str) {
    let mut tables = Tables::new().unwrap();
    tables
        .details
        .insert(vec![
            Value::Bytes(vec![3u8; 16]),
            Value::Text(version.to_string()),
        ])
        .unwrap();
    for (document, reduce_key, etag) in [
        ("docs/1", "Category/Books", 1),
        ("docs/2", "Category/Games", 2),
        ("docs/3", "category/books", 3),
    ] {
        tables
            .mapped_results
            .insert(vec![
                Value::Text("idx1".to_string()),
                Value::Text(reduce_key.to_string()),
                Value::Text(document.to_string()),
                Value::Bytes(b"{\"n\":1}".to_vec()),
                Value::Int(etag),
                Value::Int(0),
                Value::Bytes(view_and_reduce_key_hash("idx1", reduce_key).to_vec()),
            ])
            .unwrap();
    }
    tables
        .reduce_results
        .insert(vec![
            Value::Text("idx1".to_string()),
            Value::Text("Category/Books".to_string()),
            Value::Bytes(b"{\"total\":2}".to_vec()),
            Value::Int(4),
            Value::Int(0),
            Value::Bytes(view_and_reduce_key_hash("idx1", "Category/Books").to_vec()),
        ])
        .unwrap();
    fs::create_dir_all(dir.path()).unwrap();
    write_snapshot(&dir.path().join(LOG_FILE_NAME), &tables).unwrap();
}

#[test]
fn opening_a_legacy_store_backfills_group_ids() {
    let dir = TempDir::new().unwrap();
    write_legacy_store(&dir, "1.0");

    let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
    assert!(!store.created_new());

    store
        .batch(|accessor| {
            let infos: Vec<_> = accessor
                .get_mapped_results_reduce_keys_after("idx1", 0, false)?
                .collect();
            assert_eq!(infos.len(), 3);
            for info in &infos {
                assert_eq!(
                    info.reduce_group_id,
                    compute_reduce_group_id(&info.reduce_key),
                    "row for {} still carries a stale group id",
                    info.reduce_key
                );
                assert_ne!(info.reduce_group_id, -1);
            }
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn migrated_rows_are_reachable_through_the_group_aware_index() {
    let dir = TempDir::new().unwrap();
    write_legacy_store(&dir, "1.0");

    let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
    store
        .batch(|accessor| {
            // the hash index includes the group id; a lookup computed
            // the 1.1 way must find the migrated rows
            let reduce_key = "Category/Books";
            let request = quillstore::mapreduce::GetMapReduceResults::new(
                "idx1",
                quillstore::mapreduce::ReduceKeyAndGroupId::new(
                    reduce_key,
                    compute_reduce_group_id(reduce_key),
                ),
                view_and_reduce_key_hash("idx1", reduce_key),
            );
            // docs/1 and docs/3 share the key up to case
            assert_eq!(accessor.get_mapped_results(&[request.clone()])?.count(), 2);
            assert_eq!(accessor.get_reduce_results(&[request])?.count(), 1);
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn migration_persists_and_reruns_are_equivalent() {
    let dir = TempDir::new().unwrap();
    write_legacy_store(&dir, "1.0");

    // first open migrates and persists
    let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
    store.dispose();
    drop(store);
    let after_first = fs::read(dir.path().join(LOG_FILE_NAME)).unwrap();

    // a second open finds the new version and changes nothing
    let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
    store
        .batch(|accessor| {
            let infos: Vec<_> = accessor
                .get_mapped_results_reduce_keys_after("idx1", 0, false)?
                .collect();
            assert_eq!(infos.len(), 3);
            Ok(())
        })
        .unwrap();
    store.dispose();
    drop(store);
    let after_second = fs::read(dir.path().join(LOG_FILE_NAME)).unwrap();
    assert_eq!(after_first, after_second);
}

#[test]
fn crash_before_the_migrated_state_lands_reruns_cleanly() {
    let dir = TempDir::new().unwrap();
    write_legacy_store(&dir, "1.0");
    let legacy_bytes = fs::read(dir.path().join(LOG_FILE_NAME)).unwrap();

    // run the migration once
    let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
    store.dispose();
    drop(store);

    // simulate a crash that left the old state: the atomic rename never
    // happened, so the store is still at 1.0 and migrates again
    fs::write(dir.path().join(LOG_FILE_NAME), &legacy_bytes).unwrap();
    let store = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap();
    store
        .batch(|accessor| {
            let infos: Vec<_> = accessor
                .get_mapped_results_reduce_keys_after("idx1", 0, false)?
                .collect();
            assert_eq!(infos.len(), 3);
            for info in &infos {
                assert_eq!(info.reduce_group_id, compute_reduce_group_id(&info.reduce_key));
            }
            Ok(())
        })
        .unwrap();
    store.dispose();
}

#[test]
fn unknown_schema_version_fails_with_an_actionable_error() {
    let dir = TempDir::new().unwrap();
    write_legacy_store(&dir, "0.4");

    let err = IndexingStore::initialize(StoreConfig::new(dir.path())).unwrap_err();
    match &err {
        StorageError::NoUpgradePath { on_disk, expected } => {
            assert_eq!(on_disk, "0.4");
            assert_eq!(*expected, quillstore::engine::SCHEMA_VERSION);
        }
        other => panic!("expected NoUpgradePath, got {}", other),
    }
    assert!(err.to_string().contains("migrate"));
}
