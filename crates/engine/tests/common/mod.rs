//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use tessera_core::{coords_from, Coordinates, StorageAddress, StorageConfig};
use tessera_engine::testing::MemCatalog;
use tessera_engine::{ArrayDesc, DimensionDesc, QueryContext, StorageEngine};
use tessera_rle::{Payload, PayloadBuilder, Value};

/// Open an engine rooted at `dir` for instance `instance` of a cluster
/// described by `catalog`.
pub fn open_engine(
    dir: &Path,
    catalog: Arc<MemCatalog>,
    instance: u64,
    config: StorageConfig,
) -> Arc<StorageEngine> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
    let config = config.with_storage_path(dir.join("storage.cfg"));
    let engine = StorageEngine::open(config, catalog).expect("open storage");
    engine.set_instance_id(instance).expect("set instance id");
    Arc::new(engine)
}

/// A one-attribute array descriptor over a 2-d grid of 10x10 chunks.
pub fn array_version(uaid: u64, arr_id: u64, version: u64) -> ArrayDesc {
    ArrayDesc::new(
        uaid,
        arr_id,
        version,
        1,
        None,
        vec![DimensionDesc::new(0, 10), DimensionDesc::new(0, 10)],
    )
}

/// Encode `values` and write them as the chunk at `coords`.
pub fn write_values(
    engine: &StorageEngine,
    desc: &ArrayDesc,
    coords: &[i64],
    values: &[i64],
    query: &QueryContext,
) {
    let mut builder = PayloadBuilder::fixed(8);
    for &v in values {
        builder.append(&Value::int64(v));
    }
    let payload = builder.finish();
    let addr = StorageAddress::new(desc.id(), 0, coords_from(coords));
    let chunk = engine
        .create_chunk(desc, addr, 0, query)
        .expect("create chunk");
    engine.stage_chunk_payload(&chunk, payload.pack());
    engine.write_chunk(desc, &chunk, query).expect("write chunk");
}

/// Read the chunk at `addr` and decode its values.
pub fn read_values(
    engine: &StorageEngine,
    desc: &ArrayDesc,
    addr: &StorageAddress,
    query: &QueryContext,
) -> Vec<i64> {
    let chunk = engine.read_chunk(desc, addr, query).expect("read chunk");
    let data = chunk.data().expect("loaded chunk has data");
    let payload = Payload::unpack(&data).expect("decode payload");
    let values = payload
        .values()
        .expect("materialize values")
        .into_iter()
        .map(|v| {
            let bytes = v.data().expect("non-null test data");
            i64::from_le_bytes(bytes.try_into().expect("8-byte values"))
        })
        .collect();
    engine.unpin_chunk(&chunk).expect("unpin");
    values
}

/// Resolve `(attribute 0, coords)` at the version of `desc`.
pub fn find(
    engine: &StorageEngine,
    desc: &ArrayDesc,
    coords: &[i64],
    query: &QueryContext,
) -> Option<u64> {
    let mut addr = StorageAddress::new(desc.id(), 0, coords_from(coords));
    match engine.find_chunk(desc, query, &mut addr).expect("find chunk") {
        true => Some(addr.arr_id),
        false => None,
    }
}

/// All chunk coordinates visible at `desc`'s version.
pub fn positions(
    engine: &StorageEngine,
    desc: &ArrayDesc,
    query: &QueryContext,
) -> Vec<Coordinates> {
    engine
        .chunk_positions(desc, query)
        .expect("chunk positions")
        .into_iter()
        .collect()
}
