//! Offline check: exit codes and repairs.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{all_records, pattern, pos, Fixture};
use tierfs_engine::{
    fsck, BlockDevice, BtreeId, DeclinePrompt, EngineConfig, FixPolicy, FixPrompt, FormatOptions,
    FsckExit, Mutation, NoKeyProvider, Record, Subsystem, Value,
};

struct YesPrompt {
    asked: AtomicUsize,
}

impl FixPrompt for YesPrompt {
    fn ask(&self, _question: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn populated(ndevs: usize) -> Fixture {
    let fx = Fixture::new(ndevs, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    engine.write_data(1, 0, &pattern(3, 40_000)).unwrap();
    let batch = (0..100u64)
        .map(|k| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![2; 30]))))
        .collect();
    engine.mutate(BtreeId::Xattrs, batch).unwrap();
    engine.unmount().unwrap();
    fx
}

fn run(fx: &Fixture, policy: FixPolicy) -> tierfs_engine::FsckReport {
    fsck(
        &fx.devs,
        &EngineConfig::default(),
        &NoKeyProvider,
        policy,
        Arc::new(DeclinePrompt),
    )
}

#[test]
fn test_clean_filesystem() {
    let fx = populated(1);
    let report = run(&fx, FixPolicy::No);
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.exit, FsckExit::Ok);
    assert_eq!(report.exit.code(), 0);
}

#[test]
fn test_damaged_superblock_copy() {
    let fx = populated(2);
    // body bytes of device 1's copy
    fx.mems[1].corrupt(40, 8);

    let report = run(&fx, FixPolicy::No);
    assert_eq!(report.exit, FsckExit::ErrorsNotFixed);
    assert_eq!(report.exit.code(), 1);
    assert_eq!(report.unfixed, 1);
    assert_eq!(report.findings[0].subsystem, Subsystem::Superblock);

    let prompt = Arc::new(YesPrompt {
        asked: AtomicUsize::new(0),
    });
    let report = fsck(
        &fx.devs,
        &EngineConfig::default(),
        &NoKeyProvider,
        FixPolicy::Ask,
        prompt.clone(),
    );
    assert_eq!(report.exit, FsckExit::Ok);
    assert_eq!(report.fixed, 1);
    assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);

    let report = run(&fx, FixPolicy::No);
    assert!(report.is_clean(), "{:?}", report.findings);

    let engine = fx.mount(&EngineConfig::default());
    assert!(engine.superblock().fsck_fixed);
    assert!(!engine.superblock().errors);
    assert_eq!(all_records(&engine, BtreeId::Xattrs).len(), 100);
}

#[test]
fn test_declined_fix_is_reported() {
    let fx = populated(2);
    fx.mems[1].corrupt(40, 8);
    let report = run(&fx, FixPolicy::Ask);
    assert_eq!(report.exit, FsckExit::ErrorsNotFixed);
    assert_eq!(report.unfixed, 1);
    assert!(!report.findings[0].fixed);
    assert!(report.findings[0].can_fix);
}

#[test]
fn test_stale_superblock_copy_fixed_with_yes() {
    let fx = populated(2);
    let old = fx.mems[1].snapshot();
    {
        let engine = fx.mount(&EngineConfig::default());
        engine.checkpoint().unwrap();
        engine.unmount().unwrap();
    }
    // put back device 1's older superblock
    fx.mems[1].write_block(0, &old[..16 * 1024]).unwrap();

    let report = run(&fx, FixPolicy::Yes);
    assert_eq!(report.exit, FsckExit::Ok);
    assert_eq!(report.fixed, 1);
    assert!(report.findings[0].message.contains("stale"));
    assert!(run(&fx, FixPolicy::No).is_clean());
}

#[test]
fn test_unknown_version() {
    let fx = populated(1);
    fx.mems[0].write_block(4, &99u32.to_le_bytes()).unwrap();
    let report = run(&fx, FixPolicy::Yes);
    assert_eq!(report.exit, FsckExit::UnknownVersion);
    assert_eq!(report.exit.code(), 4);
}

#[test]
fn test_missing_device_is_impossible() {
    let fx = populated(2);
    let one = Fixture::from_mems(vec![fx.mems[0].clone()]);
    let report = run(&one, FixPolicy::Yes);
    assert_eq!(report.exit, FsckExit::RepairImpossible);
    assert_eq!(report.exit.code(), 3);
}

#[test]
fn test_damaged_extent_replica_reported_and_rewritten() {
    let fx = Fixture::new(
        2,
        &FormatOptions {
            data_replicas: 2,
            ..Default::default()
        },
    );
    let data = pattern(8, 10_000);
    let (p, len) = {
        let engine = fx.mount(&EngineConfig::default());
        engine.write_data(6, 0, &data).unwrap();
        let Some(Value::Extent(e)) = engine
            .lookup(BtreeId::Extents, tierfs_engine::Bpos::new(6, 10_000))
            .unwrap()
        else {
            panic!("extent missing");
        };
        engine.unmount().unwrap();
        (e.ptrs[1], e.stored_len)
    };
    fx.mems[p.dev as usize].corrupt(p.device_offset(64 * 1024), len as usize);

    let report = run(&fx, FixPolicy::No);
    assert_eq!(report.exit, FsckExit::ErrorsNotFixed);
    assert_eq!(report.findings[0].subsystem, Subsystem::Extent);

    let report = run(&fx, FixPolicy::Yes);
    assert_eq!(report.exit, FsckExit::Ok, "{:?}", report.findings);
    assert_eq!(report.fixed, 1);
    assert!(run(&fx, FixPolicy::No).is_clean());

    let engine = fx.mount(&EngineConfig::default());
    assert_eq!(engine.read_data(6, 0, data.len()).unwrap(), data);
}

#[test]
fn test_mount_with_report_only_keeps_errors_flag() {
    let fx = populated(2);
    fx.mems[1].corrupt(40, 8);
    let config = EngineConfig {
        fsck_on_mount: false,
        ..Default::default()
    };
    let engine = fx.mount(&config);
    // reported, not fixed: a writable mount still works but remembers
    assert!(engine.faults().has_errors());
    engine.unmount().unwrap();
    assert!(fx.mount(&EngineConfig::default()).superblock().errors);
}
