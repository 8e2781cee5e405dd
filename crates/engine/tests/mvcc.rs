//! Multi-version read, tombstone and version-removal semantics.

mod common;

use common::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::tempdir;
use tessera_core::{coords_from, StorageAddress, StorageConfig, StorageError};
use tessera_engine::testing::MemCatalog;
use tessera_engine::QueryContext;

const UAID: u64 = 100;

#[test]
fn reads_resolve_to_newest_version_at_or_below() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let v2 = array_version(UAID, 12, 2);

    write_values(&engine, &v1, &[0, 0], &[1, 2, 3], &query);
    write_values(&engine, &v2, &[10, 10], &[7, 8], &query);

    // At version 1 only (0,0) exists.
    assert_eq!(find(&engine, &v1, &[0, 0], &query), Some(11));
    assert_eq!(find(&engine, &v1, &[10, 10], &query), None);

    // At version 2, (0,0) still resolves to the version-1 chunk.
    assert_eq!(find(&engine, &v2, &[0, 0], &query), Some(11));
    assert_eq!(find(&engine, &v2, &[10, 10], &query), Some(12));

    // Data round-trips through the cache and the data store.
    let addr = StorageAddress::new(11, 0, coords_from(&[0, 0]));
    assert_eq!(read_values(&engine, &v1, &addr, &query), vec![1, 2, 3]);
    let addr = StorageAddress::new(12, 0, coords_from(&[10, 10]));
    assert_eq!(read_values(&engine, &v2, &addr, &query), vec![7, 8]);

    engine.close().unwrap();
}

#[test]
fn overwriting_store_then_remove_versions_keeps_only_new_state() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let v2 = array_version(UAID, 12, 2);

    write_values(&engine, &v1, &[0, 0], &[1], &query);
    write_values(&engine, &v2, &[10, 10], &[2], &query);

    // The overwriting store tombstones coordinates it did not rewrite.
    let live: BTreeSet<_> = [coords_from(&[10, 10])].into_iter().collect();
    engine.remove_dead_chunks(&v2, &live, &query).unwrap();
    assert_eq!(find(&engine, &v2, &[0, 0], &query), None);
    assert_eq!(find(&engine, &v1, &[0, 0], &query), Some(11));

    // Dropping everything before version 2 reclaims (0,0)@11; only
    // (10,10)@12 stays reachable.
    catalog.set_oldest_version(UAID, 12);
    engine.remove_versions(1, UAID, 12).unwrap();
    assert_eq!(find(&engine, &v2, &[0, 0], &query), None);
    assert_eq!(find(&engine, &v2, &[10, 10], &query), Some(12));
    assert_eq!(positions(&engine, &v2, &query), vec![coords_from(&[10, 10])]);

    engine.close().unwrap();
}

#[test]
fn chunk_live_at_oldest_version_survives_remove_versions() {
    // Without a tombstone, the newest chunk at or below the cut is the
    // live chunk of its coordinate and must survive.
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog.clone(), 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let v2 = array_version(UAID, 12, 2);
    let v3 = array_version(UAID, 13, 3);
    write_values(&engine, &v1, &[0, 0], &[1], &query);
    write_values(&engine, &v2, &[0, 0], &[2], &query);
    write_values(&engine, &v3, &[0, 0], &[3], &query);

    catalog.set_oldest_version(UAID, 12);
    engine.remove_versions(1, UAID, 12).unwrap();

    // Version 1's chunk died; version 2's serves the oldest retained
    // version; version 3's is untouched.
    assert_eq!(find(&engine, &v1, &[0, 0], &query), None);
    assert_eq!(find(&engine, &v2, &[0, 0], &query), Some(12));
    assert_eq!(find(&engine, &v3, &[0, 0], &query), Some(13));

    engine.close().unwrap();
}

#[test]
fn remove_all_versions_unlinks_the_data_store() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    write_values(&engine, &v1, &[0, 0], &[1], &query);

    let ds_path = dir.path().join("datastores").join(format!("{UAID}.data"));
    assert!(ds_path.exists());

    engine.remove_versions(1, UAID, 0).unwrap();
    assert!(!ds_path.exists());
    assert_eq!(find(&engine, &v1, &[0, 0], &query), None);

    engine.close().unwrap();
}

#[test]
fn tombstone_hides_older_versions_from_readers() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let v2 = array_version(UAID, 12, 2);
    write_values(&engine, &v1, &[0, 0], &[1], &query);

    engine
        .remove_chunk_version(&v2, &coords_from(&[0, 0]), &query)
        .unwrap();

    // Old readers still see the chunk; new readers do not.
    assert_eq!(find(&engine, &v1, &[0, 0], &query), Some(11));
    assert_eq!(find(&engine, &v2, &[0, 0], &query), None);

    // Scans at version 2 skip the tombstoned coordinate.
    assert!(positions(&engine, &v2, &query).is_empty());
    assert_eq!(positions(&engine, &v1, &query), vec![coords_from(&[0, 0])]);

    engine.close().unwrap();
}

#[test]
fn scan_skips_tombstones_and_walks_in_coordinate_order() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let v2 = array_version(UAID, 12, 2);
    for coords in [[0, 0], [0, 10], [10, 0]] {
        write_values(&engine, &v1, &coords, &[9], &query);
    }
    engine
        .remove_chunk_version(&v2, &coords_from(&[0, 10]), &query)
        .unwrap();

    assert_eq!(
        positions(&engine, &v2, &query),
        vec![coords_from(&[0, 0]), coords_from(&[10, 0])]
    );
    assert_eq!(
        positions(&engine, &v1, &query),
        vec![
            coords_from(&[0, 0]),
            coords_from(&[0, 10]),
            coords_from(&[10, 0])
        ]
    );

    engine.close().unwrap();
}

#[test]
fn duplicate_create_is_rejected() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    write_values(&engine, &v1, &[0, 0], &[1], &query);

    let addr = StorageAddress::new(11, 0, coords_from(&[0, 0]));
    let err = engine.create_chunk(&v1, addr, 0, &query).unwrap_err();
    assert!(matches!(err, StorageError::ChunkAlreadyExists(_)));

    engine.close().unwrap();
}

#[test]
fn cancelled_query_is_rejected_at_entry_points() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    write_values(&engine, &v1, &[0, 0], &[1], &query);

    query.cancel();
    let mut addr = StorageAddress::new(11, 0, coords_from(&[0, 0]));
    assert!(matches!(
        engine.find_chunk(&v1, &query, &mut addr),
        Err(StorageError::QueryCancelled(1))
    ));

    engine.close().unwrap();
}

#[test]
fn pin_unpin_must_balance() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    write_values(&engine, &v1, &[0, 0], &[1], &query);

    let addr = StorageAddress::new(11, 0, coords_from(&[0, 0]));
    let chunk = engine.read_chunk(&v1, &addr, &query).unwrap();

    // Closing with a pinned chunk is a protocol violation.
    assert!(matches!(
        engine.close(),
        Err(StorageError::PinUnpinDisbalance)
    ));

    engine.unpin_chunk(&chunk).unwrap();
    assert!(matches!(
        engine.unpin_chunk(&chunk),
        Err(StorageError::PinUnpinDisbalance)
    ));
    engine.close().unwrap();
}

#[test]
fn eviction_keeps_cache_within_budget_and_data_reloadable() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    // Budget fits roughly two encoded chunks.
    let config = StorageConfig::new().with_cache_size(1100);
    let engine = open_engine(dir.path(), catalog, 0, config);
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let values: Vec<i64> = (0..40).collect();
    for i in 0..8i64 {
        write_values(&engine, &v1, &[i * 10, 0], &values, &query);
    }
    assert!(
        engine.used_mem_size() <= 1100,
        "unpinned chunks must be evicted down to the budget"
    );

    // Evicted chunks reload from the data store intact.
    for i in 0..8i64 {
        let addr = StorageAddress::new(11, 0, coords_from(&[i * 10, 0]));
        assert_eq!(read_values(&engine, &v1, &addr, &query), values);
    }

    engine.close().unwrap();
}

#[test]
fn missing_chunk_read_fails_cleanly() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(MemCatalog::new(1));
    catalog.add_array(UAID, 11);
    let engine = open_engine(dir.path(), catalog, 0, StorageConfig::new());
    let query = QueryContext::new(1);

    let v1 = array_version(UAID, 11, 1);
    let addr = StorageAddress::new(11, 0, coords_from(&[50, 50]));
    assert!(matches!(
        engine.read_chunk(&v1, &addr, &query),
        Err(StorageError::ChunkNotFound)
    ));
    engine.close().unwrap();
}
