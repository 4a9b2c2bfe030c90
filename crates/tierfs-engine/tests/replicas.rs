//! Replicated metadata and data: damaged replicas are detected, reported
//! as nonfatal and rewritten from a good copy.

mod common;

use common::{all_records, init_tracing, pattern, pos, Fixture};
use tierfs_engine::{
    Bpos, BtreeId, DeviceHealth, EngineConfig, EngineError, Extent, FaultClass, FormatOptions,
    Mutation, Record, Value,
};

fn replicated() -> FormatOptions {
    FormatOptions {
        metadata_replicas: 2,
        data_replicas: 2,
        ..Default::default()
    }
}

fn extent_at(engine: &tierfs_engine::Engine, inode: u64, end: u64) -> Extent {
    match engine.lookup(BtreeId::Extents, Bpos::new(inode, end)).unwrap() {
        Some(Value::Extent(e)) => e,
        other => panic!("no extent at {inode}:{end}: {other:?}"),
    }
}

fn damage(engine: &tierfs_engine::Engine, extent: &Extent, replica: usize) {
    let p = extent.ptrs[replica];
    let dev = &engine.devices()[p.dev as usize];
    let offset = p.device_offset(engine.superblock().bucket_size);
    let mut bytes = dev.read(offset, extent.stored_len as usize).unwrap();
    for b in bytes.iter_mut().take(16) {
        *b ^= 0x5a;
    }
    dev.write(offset, &bytes).unwrap();
}

#[test]
fn test_extents_and_nodes_land_on_distinct_devices() {
    let fx = Fixture::new(2, &replicated());
    let engine = fx.mount(&EngineConfig::default());
    engine.write_data(1, 0, &pattern(1, 8_000)).unwrap();

    let e = extent_at(&engine, 1, 8_000);
    assert_eq!(e.ptrs.len(), 2);
    assert_ne!(e.ptrs[0].dev, e.ptrs[1].dev);
    for node in engine.btree_nodes(BtreeId::Extents).unwrap() {
        assert_eq!(node.replicas.len(), 2);
        assert_ne!(node.replicas[0].dev, node.replicas[1].dev);
    }
}

#[test]
fn test_one_bad_replica_is_repaired() {
    init_tracing();
    let fx = Fixture::new(2, &replicated());
    let engine = fx.mount(&EngineConfig::default());
    let data = pattern(5, 12_000);
    engine.write_data(3, 0, &data).unwrap();
    let e = extent_at(&engine, 3, 12_000);

    // reads prefer the lower device index within a tier
    let first = if e.ptrs[0].dev < e.ptrs[1].dev { 0 } else { 1 };
    damage(&engine, &e, first);

    assert_eq!(engine.read_data(3, 0, data.len()).unwrap(), data);
    assert_eq!(engine.faults().count(FaultClass::NonfatalIo), 1);
    assert_eq!(engine.stats().replica_repairs, 1);
    assert!(!engine.is_read_only());

    // the repaired replica verifies now, so no new fault
    assert_eq!(engine.read_data(3, 0, data.len()).unwrap(), data);
    assert_eq!(engine.faults().count(FaultClass::NonfatalIo), 1);
    assert_eq!(engine.stats().replica_repairs, 1);
}

#[test]
fn test_all_replicas_bad_is_inconsistent() {
    let fx = Fixture::new(2, &replicated());
    let engine = fx.mount(&EngineConfig::default());
    engine.write_data(4, 0, &pattern(9, 6_000)).unwrap();
    let e = extent_at(&engine, 4, 6_000);
    damage(&engine, &e, 0);
    damage(&engine, &e, 1);

    assert!(matches!(
        engine.read_data(4, 0, 6_000),
        Err(EngineError::Inconsistent { .. })
    ));
    assert_eq!(engine.faults().count(FaultClass::NonfatalIo), 2);
    assert_eq!(engine.faults().count(FaultClass::Inconsistency), 1);
    // the default error action stops writes
    assert!(engine.is_read_only());
    assert!(engine.faults().has_errors());
}

#[test]
fn test_degraded_mount_reads_surviving_replicas() {
    let fx = Fixture::new(2, &replicated());
    let data = pattern(11, 30_000);
    {
        let engine = fx.mount(&EngineConfig::default());
        engine.write_data(2, 0, &data).unwrap();
        let batch = (0..50u64)
            .map(|k| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![k as u8; 32]))))
            .collect();
        engine.mutate(BtreeId::Xattrs, batch).unwrap();
        engine.unmount().unwrap();
    }

    fx.mems[1].set_fail_reads(true);
    assert!(matches!(
        tierfs_engine::Engine::mount(&fx.devs, &EngineConfig::default(), &tierfs_engine::NoKeyProvider),
        Err(EngineError::DeviceError { device: 1, .. })
    ));

    let config = EngineConfig {
        degraded: true,
        ..Default::default()
    };
    let engine = fx.mount(&config);
    assert_eq!(engine.devices()[1].health(), DeviceHealth::Failed);
    assert_eq!(engine.read_data(2, 0, data.len()).unwrap(), data);
    assert_eq!(all_records(&engine, BtreeId::Xattrs).len(), 50);
}

#[test]
fn test_damaged_node_replica_is_rewritten() {
    let fx = Fixture::new(2, &replicated());
    let batch: Vec<Mutation> = (0..40u64)
        .map(|k| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![1; 40]))))
        .collect();
    {
        let engine = fx.mount(&EngineConfig::default());
        engine.mutate(BtreeId::Xattrs, batch).unwrap();
        engine.unmount().unwrap();
    }

    // damage the first replica of the xattrs root on disk
    let engine = fx.mount(&EngineConfig::default());
    let root = engine.btree_nodes(BtreeId::Xattrs).unwrap().remove(0);
    let p = *root.replicas.iter().min_by_key(|p| p.dev).unwrap();
    engine.unmount().unwrap();
    fx.mems[p.dev as usize].corrupt(p.device_offset(64 * 1024) + 40, 8);

    let engine = fx.mount(&EngineConfig::default());
    assert_eq!(all_records(&engine, BtreeId::Xattrs).len(), 40);
    assert!(engine.faults().count(FaultClass::NonfatalIo) >= 1);
    assert!(!engine.is_read_only());
}
