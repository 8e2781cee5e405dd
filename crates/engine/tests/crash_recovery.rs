//! Crash simulation: reopen the storage directory and verify the
//! transaction log rolls partial versions back.

mod common;

use common::*;
use std::sync::Arc;
use tempfile::tempdir;
use tessera_core::{coords_from, StorageAddress, StorageConfig};
use tessera_engine::testing::MemCatalog;
use tessera_engine::{ArrayLock, LockMode, QueryContext};

const UAID: u64 = 200;

fn write_lock(array_id: u64, version: u64, rollback_to: u64) -> ArrayLock {
    ArrayLock {
        array_uaid: UAID,
        array_id,
        version_id: version,
        rollback_to,
        mode: LockMode::Write,
    }
}

#[test]
fn crashed_version_write_is_rolled_back_on_restart() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);

    // Two committed versions, then a version-3 write that reaches the
    // log and the data store but never commits in the catalog.
    {
        let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
        let query = QueryContext::new(1);
        write_values(&engine, &array_version(UAID, 11, 1), &[0, 0], &[1], &query);
        write_values(&engine, &array_version(UAID, 12, 2), &[0, 0], &[2], &query);
        write_values(&engine, &array_version(UAID, 13, 3), &[0, 0], &[3], &query);
        write_values(&engine, &array_version(UAID, 13, 3), &[10, 0], &[4], &query);
        // Crash: the engine is dropped without closing; the catalog never
        // records version 3, but its write lock survives.
    }
    catalog.add_coord_lock(write_lock(13, 3, 2));

    let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
    let query = QueryContext::new(2);

    // Version 3 is gone; version 2 is the visible state.
    let v3 = array_version(UAID, 13, 3);
    assert_eq!(find(&engine, &v3, &[0, 0], &query), Some(12));
    assert_eq!(find(&engine, &v3, &[10, 0], &query), None);
    let addr = StorageAddress::new(12, 0, coords_from(&[0, 0]));
    assert_eq!(read_values(&engine, &v3, &addr, &query), vec![2]);

    // The recovery replay consumed and deleted the coordinator locks.
    assert!(catalog.coord_locks().is_empty());

    engine.close().unwrap();
}

#[test]
fn rollback_of_first_version_unlinks_the_data_store() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    {
        let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
        let query = QueryContext::new(1);
        write_values(&engine, &array_version(UAID, 11, 1), &[0, 0], &[1], &query);
    }
    // The crash happened while creating the array itself.
    catalog.remove_array(UAID);
    catalog.add_coord_lock(ArrayLock {
        array_uaid: UAID,
        array_id: 11,
        version_id: 1,
        rollback_to: 0,
        mode: LockMode::Create,
    });

    let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
    let query = QueryContext::new(2);

    let ds_path = dir.path().join("datastores").join(format!("{UAID}.data"));
    assert!(!ds_path.exists(), "first-version rollback removes the store");
    assert_eq!(find(&engine, &array_version(UAID, 11, 1), &[0, 0], &query), None);

    engine.close().unwrap();
}

#[test]
fn committed_state_survives_clean_restart() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    {
        let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
        let query = QueryContext::new(1);
        write_values(&engine, &array_version(UAID, 11, 1), &[0, 0], &[5, 6], &query);
        write_values(&engine, &array_version(UAID, 12, 2), &[10, 0], &[7], &query);
        engine.flush(None).unwrap();
        engine.close().unwrap();
    }

    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(2);
    let v2 = array_version(UAID, 12, 2);

    assert_eq!(find(&engine, &v2, &[0, 0], &query), Some(11));
    assert_eq!(find(&engine, &v2, &[10, 0], &query), Some(12));
    let addr = StorageAddress::new(11, 0, coords_from(&[0, 0]));
    assert_eq!(read_values(&engine, &v2, &addr, &query), vec![5, 6]);
    let addr = StorageAddress::new(12, 0, coords_from(&[10, 0]));
    assert_eq!(read_values(&engine, &v2, &addr, &query), vec![7]);

    engine.close().unwrap();
}

#[test]
fn tombstones_survive_restart() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    {
        let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
        let query = QueryContext::new(1);
        write_values(&engine, &array_version(UAID, 11, 1), &[0, 0], &[1], &query);
        engine
            .remove_chunk_version(&array_version(UAID, 12, 2), &coords_from(&[0, 0]), &query)
            .unwrap();
        engine.flush(None).unwrap();
        engine.close().unwrap();
    }

    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(2);
    assert_eq!(find(&engine, &array_version(UAID, 11, 1), &[0, 0], &query), Some(11));
    assert_eq!(find(&engine, &array_version(UAID, 12, 2), &[0, 0], &query), None);
    engine.close().unwrap();
}

#[test]
fn chunks_of_arrays_unknown_to_the_catalog_are_reclaimed() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    {
        let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
        let query = QueryContext::new(1);
        write_values(&engine, &array_version(UAID, 11, 1), &[0, 0], &[1], &query);
        engine.flush(None).unwrap();
        engine.close().unwrap();
    }
    // The catalog forgot the array (e.g. a remove committed elsewhere),
    // but no lock survived.
    catalog.remove_array(UAID);

    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(2);

    let ds_path = dir.path().join("datastores").join(format!("{UAID}.data"));
    assert!(!ds_path.exists(), "orphan data store removed at startup");
    assert_eq!(find(&engine, &array_version(UAID, 11, 1), &[0, 0], &query), None);

    engine.close().unwrap();
}

#[test]
fn old_versions_are_garbage_collected_during_map_rebuild() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    {
        let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
        let query = QueryContext::new(1);
        write_values(&engine, &array_version(UAID, 11, 1), &[0, 0], &[1], &query);
        write_values(&engine, &array_version(UAID, 12, 2), &[0, 0], &[2], &query);
        engine.flush(None).unwrap();
        engine.close().unwrap();
    }
    // All versions before 2 were dropped while we were down.
    catalog.set_oldest_version(UAID, 12);

    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(2);
    let v2 = array_version(UAID, 12, 2);

    assert_eq!(find(&engine, &v2, &[0, 0], &query), Some(12));
    let addr = StorageAddress::new(12, 0, coords_from(&[0, 0]));
    assert_eq!(read_values(&engine, &v2, &addr, &query), vec![2]);
    // The version-1 chunk is unreachable from any version.
    assert_eq!(find(&engine, &array_version(UAID, 11, 1), &[0, 0], &query), None);

    engine.close().unwrap();
}
