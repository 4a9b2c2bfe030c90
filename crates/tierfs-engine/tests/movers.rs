//! Garbage collection and tiering passes.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use common::{pattern, Fixture};
use tierfs_engine::{
    fsck, Bpos, BtreeId, CompressionAlgorithm, DeclinePrompt, Engine, EngineConfig, EngineError,
    FixPolicy, FormatOptions, MoveState, Mutation, NoKeyProvider, Tier, Value,
};

fn uncompressed() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data.compression = CompressionAlgorithm::None;
    config
}

fn first_dev(engine: &Engine, inode: u64, end: u64) -> u32 {
    match engine.lookup(BtreeId::Extents, Bpos::new(inode, end)).unwrap() {
        Some(Value::Extent(e)) => e.ptrs[0].dev,
        other => panic!("no extent at {inode}:{end}: {other:?}"),
    }
}

#[test]
fn test_gc_empties_sparse_buckets() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let config = uncompressed();
    let engine = fx.mount(&config);
    for i in 0..16u64 {
        engine.write_data(i + 1, 0, &pattern(i, 16_384)).unwrap();
    }
    let doomed: Vec<Mutation> = (0..16u64)
        .filter(|i| i % 4 != 0)
        .map(|i| Mutation::Delete(Bpos::new(i + 1, 16_384)))
        .collect();
    engine.mutate(BtreeId::Extents, doomed).unwrap();
    engine.checkpoint().unwrap();
    assert_eq!(engine.gc_state(), MoveState::Idle);

    let before = engine.stats().allocator.buckets_freed;
    let report = engine.run_gc(&AtomicBool::new(false)).unwrap();
    assert!(report.buckets_scanned >= 1);
    assert!(report.extents_moved >= 1);
    assert!(report.buckets_freed >= 1);
    assert_eq!(report.failed, 0);
    assert_eq!(engine.gc_state(), MoveState::Done);
    assert!(engine.stats().allocator.buckets_freed >= before + report.buckets_freed as u64);

    for i in (0..16u64).filter(|i| i % 4 == 0) {
        assert_eq!(engine.read_data(i + 1, 0, 16_384).unwrap(), pattern(i, 16_384));
    }
    engine.unmount().unwrap();

    let report = fsck(
        &fx.devs,
        &config,
        &NoKeyProvider,
        FixPolicy::No,
        Arc::new(DeclinePrompt),
    );
    assert!(report.is_clean(), "{:?}", report.findings);
}

#[test]
fn test_gc_cancelled_before_moving() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&uncompressed());
    for i in 0..8u64 {
        engine.write_data(i + 1, 0, &pattern(i, 16_384)).unwrap();
    }
    let doomed: Vec<Mutation> = (0..8u64)
        .filter(|i| i % 4 != 0)
        .map(|i| Mutation::Delete(Bpos::new(i + 1, 16_384)))
        .collect();
    engine.mutate(BtreeId::Extents, doomed).unwrap();
    engine.checkpoint().unwrap();

    assert!(matches!(
        engine.run_gc(&AtomicBool::new(true)),
        Err(EngineError::Cancelled)
    ));
    assert_eq!(engine.gc_state(), MoveState::Idle);
    // a later pass still finds the work
    let report = engine.run_gc(&AtomicBool::new(false)).unwrap();
    assert!(report.buckets_freed >= 1);
    assert_eq!(engine.read_data(1, 0, 16_384).unwrap(), pattern(0, 16_384));
}

#[test]
fn test_gc_refused_on_read_only_mount() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig {
        read_only: true,
        ..Default::default()
    });
    assert!(matches!(
        engine.run_gc(&AtomicBool::new(false)),
        Err(EngineError::ReadOnly)
    ));
    assert!(matches!(
        engine.run_tiering(&AtomicBool::new(false)),
        Err(EngineError::ReadOnly)
    ));
}

#[test]
fn test_tiering_demotes_idle_and_promotes_hot_extents() {
    let fx = Fixture::new(
        2,
        &FormatOptions {
            tiers: vec![Tier::Fast, Tier::Capacity],
            ..Default::default()
        },
    );
    let mut config = uncompressed();
    config.tiering.demote_after_secs = 0;
    let engine = fx.mount(&config);
    let data = pattern(5, 12_000);
    engine.write_data(1, 0, &data).unwrap();
    assert_eq!(first_dev(&engine, 1, 12_000), 0);

    let cancel = AtomicBool::new(false);
    let report = engine.run_tiering(&cancel).unwrap();
    assert_eq!(report.demoted, 1);
    assert_eq!(report.promoted, 0);
    assert_eq!(first_dev(&engine, 1, 12_000), 1);
    assert_eq!(engine.tiering_state(), MoveState::Done);

    for _ in 0..3 {
        assert_eq!(engine.read_data(1, 0, data.len()).unwrap(), data);
    }
    let report = engine.run_tiering(&cancel).unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(first_dev(&engine, 1, 12_000), 0);
    assert_eq!(engine.read_data(1, 0, data.len()).unwrap(), data);

    engine.unmount().unwrap();
    let engine = fx.mount(&config);
    assert_eq!(first_dev(&engine, 1, 12_000), 0);
    assert_eq!(engine.read_data(1, 0, data.len()).unwrap(), data);
}

#[test]
fn test_tiering_leaves_cold_capacity_extents() {
    let fx = Fixture::new(
        2,
        &FormatOptions {
            tiers: vec![Tier::Fast, Tier::Capacity],
            ..Default::default()
        },
    );
    let mut config = uncompressed();
    config.data.foreground_tier = Tier::Capacity;
    let engine = fx.mount(&config);
    engine.write_data(2, 0, &pattern(2, 5_000)).unwrap();
    assert_eq!(first_dev(&engine, 2, 5_000), 1);

    // one read is below the promotion threshold
    engine.read_data(2, 0, 5_000).unwrap();
    let report = engine.run_tiering(&AtomicBool::new(false)).unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.promoted + report.demoted, 0);
    assert_eq!(first_dev(&engine, 2, 5_000), 1);
}
