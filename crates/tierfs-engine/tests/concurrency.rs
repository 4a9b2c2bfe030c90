//! Concurrent writers and readers on one mount.

mod common;

use std::sync::Arc;
use std::thread;

use common::{all_records, pattern, Fixture};
use tierfs_engine::{
    Bpos, BtreeId, EngineConfig, FormatOptions, LockOrderTracker, Mutation, Record, Value,
};

#[test]
fn test_parallel_commits_and_reads() {
    let fx = Fixture::new(2, &FormatOptions::default());
    let engine = Arc::new(fx.mount(&EngineConfig::default()));

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                for batch in 0..25u64 {
                    let muts = (0..4u64)
                        .map(|k| {
                            let key = Bpos::new(t * 1_000 + batch * 4 + k, t);
                            Mutation::Insert(Record::new(key, Value::Blob(vec![t as u8; 24])))
                        })
                        .collect();
                    engine.mutate(BtreeId::Xattrs, muts).unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let records = all_records(&engine, BtreeId::Xattrs);
                    // snapshots are always sorted and duplicate free
                    assert!(records.windows(2).all(|w| w[0].pos < w[1].pos));
                }
            })
        })
        .collect();

    let data_writers: Vec<_> = (0..2u64)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                let data = pattern(t + 70, 9_000);
                for round in 0..5u64 {
                    engine.write_data(500 + t, round * 9_000, &data).unwrap();
                }
                for round in 0..5u64 {
                    assert_eq!(engine.read_data(500 + t, round * 9_000, 9_000).unwrap(), data);
                }
            })
        })
        .collect();

    for h in writers.into_iter().chain(readers).chain(data_writers) {
        h.join().unwrap();
    }

    assert_eq!(LockOrderTracker::violations(), 0);
    let records = all_records(&engine, BtreeId::Xattrs);
    assert_eq!(records.len(), 400);
    for t in 0..4u64 {
        for k in 0..100u64 {
            assert_eq!(
                engine.lookup(BtreeId::Xattrs, Bpos::new(t * 1_000 + k, t)).unwrap(),
                Some(Value::Blob(vec![t as u8; 24]))
            );
        }
    }
    engine.unmount().unwrap();

    let engine = fx.mount(&EngineConfig::default());
    assert_eq!(all_records(&engine, BtreeId::Xattrs).len(), 400);
}

#[test]
fn test_checkpoints_interleaved_with_commits() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = Arc::new(fx.mount(&EngineConfig::default()));

    let writer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for k in 0..200u64 {
                engine
                    .mutate(
                        BtreeId::Xattrs,
                        vec![Mutation::Insert(Record::new(
                            Bpos::new(k + 1, 0),
                            Value::Blob(k.to_le_bytes().to_vec()),
                        ))],
                    )
                    .unwrap();
            }
        })
    };
    let checkpointer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                engine.checkpoint().unwrap();
                thread::yield_now();
            }
        })
    };
    writer.join().unwrap();
    checkpointer.join().unwrap();

    let crashed = fx.crash_copy();
    let engine = crashed.mount(&EngineConfig::default());
    assert_eq!(all_records(&engine, BtreeId::Xattrs).len(), 200);
}
