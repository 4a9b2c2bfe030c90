//! End-to-end btree operations on a mounted engine.

mod common;

use common::{all_records, init_tracing, pos, Fixture};
use tierfs_engine::{
    Bpos, BtreeId, DirentValue, EngineConfig, EngineError, FormatOptions, InodeValue, Mutation,
    Record, Value,
};

fn dirent(dir: u64, hash: u64, name: &str, target: u64) -> Record {
    Record::new(
        Bpos::new(dir, hash),
        Value::Dirent(DirentValue {
            target,
            kind: 1,
            name: name.to_string(),
        }),
    )
}

fn inode(ino: u64, size: u64) -> Record {
    Record::new(
        pos(ino),
        Value::Inode(InodeValue {
            mode: 0o100644,
            size,
            nlink: 1,
            ..Default::default()
        }),
    )
}

#[test]
fn test_insert_lookup_delete() {
    init_tracing();
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());

    engine
        .mutate(BtreeId::Inodes, vec![Mutation::Insert(inode(10, 4096))])
        .unwrap();
    let Some(Value::Inode(i)) = engine.lookup(BtreeId::Inodes, pos(10)).unwrap() else {
        panic!("inode missing");
    };
    assert_eq!(i.size, 4096);
    assert_eq!(engine.lookup(BtreeId::Inodes, pos(11)).unwrap(), None);

    engine
        .mutate(BtreeId::Inodes, vec![Mutation::Delete(pos(10))])
        .unwrap();
    assert_eq!(engine.lookup(BtreeId::Inodes, pos(10)).unwrap(), None);
    assert!(all_records(&engine, BtreeId::Inodes).is_empty());
}

#[test]
fn test_batch_is_atomic_and_ordered() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());

    let batch = vec![
        Mutation::Insert(dirent(1, 30, "c", 4)),
        Mutation::Insert(dirent(1, 10, "a", 2)),
        Mutation::Insert(dirent(1, 20, "b", 3)),
    ];
    let res = engine.mutate(BtreeId::Dirents, batch).unwrap();
    assert!(res.nodes_written >= 1);

    let names: Vec<String> = all_records(&engine, BtreeId::Dirents)
        .into_iter()
        .map(|r| match r.value {
            Value::Dirent(d) => d.name,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn test_deleted_key_absent_from_range() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    let batch = [(1u64, b'a'), (2, b'b'), (3, b'c')]
        .into_iter()
        .map(|(k, v)| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![v]))))
        .collect();
    engine.mutate(BtreeId::Xattrs, batch).unwrap();
    engine
        .mutate(BtreeId::Xattrs, vec![Mutation::Delete(pos(2))])
        .unwrap();

    let got: Vec<(u64, Value)> = engine
        .iter(BtreeId::Xattrs, pos(0)..pos(10))
        .map(|r| r.unwrap())
        .map(|r| (r.pos.inode, r.value))
        .collect();
    assert_eq!(
        got,
        vec![(1, Value::Blob(b"a".to_vec())), (3, Value::Blob(b"c".to_vec()))]
    );
}

#[test]
fn test_first_split_adds_exactly_one_level() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    assert_eq!(engine.btree_height(BtreeId::Xattrs), 1);

    for chunk in (0..1000u64).collect::<Vec<_>>().chunks(100) {
        let batch = chunk
            .iter()
            .map(|&k| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![k as u8; 4]))))
            .collect();
        engine.mutate(BtreeId::Xattrs, batch).unwrap();
    }
    assert_eq!(engine.btree_height(BtreeId::Xattrs), 2);
    let nodes = engine.btree_nodes(BtreeId::Xattrs).unwrap();
    assert!(nodes.iter().filter(|n| n.level == 0).count() >= 2);
    assert!(nodes.iter().all(|n| n.encoded_len <= 4096));
    assert_eq!(all_records(&engine, BtreeId::Xattrs).len(), 1000);
}

#[test]
fn test_invalid_record_rejected_without_change() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());

    let bad = Mutation::Insert(dirent(1, 1, "a/b", 2));
    let good = Mutation::Insert(dirent(1, 2, "ok", 3));
    let err = engine.mutate(BtreeId::Dirents, vec![good, bad]).unwrap_err();
    assert!(matches!(err, EngineError::InvalidRecord { .. }));
    assert!(all_records(&engine, BtreeId::Dirents).is_empty());

    // an inode in the dirents btree is just as wrong
    let err = engine
        .mutate(BtreeId::Dirents, vec![Mutation::Insert(inode(5, 0))])
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRecord { .. }));
}

#[test]
fn test_compare_and_swap() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    let p = pos(7);
    let v1 = Value::Blob(b"one".to_vec());
    let v2 = Value::Blob(b"two".to_vec());

    // absent -> v1
    engine
        .mutate(
            BtreeId::Xattrs,
            vec![Mutation::CompareAndSwap {
                pos: p,
                expected: None,
                new: Some(v1.clone()),
            }],
        )
        .unwrap();

    // wrong expectation changes nothing
    let err = engine
        .mutate(
            BtreeId::Xattrs,
            vec![Mutation::CompareAndSwap {
                pos: p,
                expected: Some(v2.clone()),
                new: None,
            }],
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { .. }));
    assert_eq!(engine.lookup(BtreeId::Xattrs, p).unwrap(), Some(v1.clone()));

    engine
        .mutate(
            BtreeId::Xattrs,
            vec![Mutation::CompareAndSwap {
                pos: p,
                expected: Some(v1),
                new: Some(v2.clone()),
            }],
        )
        .unwrap();
    assert_eq!(engine.lookup(BtreeId::Xattrs, p).unwrap(), Some(v2));
}

#[test]
fn test_splits_grow_tree_and_merges_shrink_it() {
    init_tracing();
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    assert_eq!(engine.btree_height(BtreeId::Xattrs), 1);

    for chunk in (0..600u64).collect::<Vec<_>>().chunks(20) {
        let batch = chunk
            .iter()
            .map(|&k| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![k as u8; 100]))))
            .collect();
        engine.mutate(BtreeId::Xattrs, batch).unwrap();
    }
    assert!(engine.btree_height(BtreeId::Xattrs) >= 2);
    let nodes = engine.btree_nodes(BtreeId::Xattrs).unwrap();
    let leaves: Vec<_> = nodes.iter().filter(|n| n.level == 0).collect();
    assert!(leaves.len() > 1);
    // leaves tile the key space in order
    assert_eq!(leaves.first().unwrap().min_key, Bpos::MIN);
    assert_eq!(leaves.last().unwrap().max_key, Bpos::MAX);
    for pair in leaves.windows(2) {
        assert_eq!(pair[0].max_key.successor(), Some(pair[1].min_key));
    }
    assert_eq!(leaves.iter().map(|n| n.records).sum::<usize>(), 600);
    for n in &nodes {
        assert!(n.encoded_len <= 4096);
    }

    for chunk in (0..600u64).collect::<Vec<_>>().chunks(50) {
        let batch = chunk.iter().map(|&k| Mutation::Delete(pos(k))).collect();
        engine.mutate(BtreeId::Xattrs, batch).unwrap();
    }
    assert!(all_records(&engine, BtreeId::Xattrs).is_empty());
    let leaves_after = engine
        .btree_nodes(BtreeId::Xattrs)
        .unwrap()
        .into_iter()
        .filter(|n| n.level == 0)
        .count();
    assert!(leaves_after < leaves.len());
}

#[test]
fn test_iterator_range_seek_and_prev() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    let batch = (1..=200u64)
        .map(|k| Mutation::Insert(Record::new(pos(k * 2), Value::Blob(vec![1; 64]))))
        .collect();
    engine.mutate(BtreeId::Xattrs, batch).unwrap();

    let inodes: Vec<u64> = engine
        .iter(BtreeId::Xattrs, pos(11)..pos(21))
        .map(|r| r.unwrap().pos.inode)
        .collect();
    assert_eq!(inodes, vec![12, 14, 16, 18, 20]);

    let mut it = engine.iter(BtreeId::Xattrs, ..);
    it.seek(pos(301));
    assert_eq!(it.peek().unwrap().unwrap().pos, pos(302));
    assert_eq!(it.next().unwrap().unwrap().pos, pos(302));
    assert_eq!(it.prev().unwrap().unwrap().pos, pos(302));
    assert_eq!(it.prev().unwrap().unwrap().pos, pos(300));

    assert_eq!(
        engine.lookup_ge(BtreeId::Xattrs, pos(399)).unwrap().unwrap().pos,
        pos(400)
    );
    assert!(engine.lookup_ge(BtreeId::Xattrs, pos(401)).unwrap().is_none());
}

#[test]
fn test_iterator_update_in_place() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let engine = fx.mount(&EngineConfig::default());
    let batch = (0..10u64)
        .map(|k| Mutation::Insert(Record::new(pos(k), Value::Blob(vec![0]))))
        .collect();
    engine.mutate(BtreeId::Xattrs, batch).unwrap();

    let mut it = engine.iter(BtreeId::Xattrs, ..);
    while let Some(rec) = it.next() {
        let rec = rec.unwrap();
        if rec.pos.inode % 2 == 0 {
            it.update(vec![Mutation::Delete(rec.pos)]).unwrap();
        }
    }
    let left: Vec<u64> = all_records(&engine, BtreeId::Xattrs)
        .iter()
        .map(|r| r.pos.inode)
        .collect();
    assert_eq!(left, vec![1, 3, 5, 7, 9]);
}

#[test]
fn test_contents_survive_remount() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let config = EngineConfig::default();
    {
        let engine = fx.mount(&config);
        let batch = (0..300u64).map(|k| Mutation::Insert(inode(k + 1, k))).collect();
        engine.mutate(BtreeId::Inodes, batch).unwrap();
        engine.unmount().unwrap();
        assert!(matches!(
            engine.mutate(BtreeId::Inodes, vec![Mutation::Delete(pos(1))]),
            Err(EngineError::ReadOnly)
        ));
    }
    let engine = fx.mount(&config);
    let sb = engine.superblock();
    assert_eq!(sb.mount_count, 2);
    assert!(!sb.clean);
    let records = all_records(&engine, BtreeId::Inodes);
    assert_eq!(records.len(), 300);
    assert_eq!(engine.stats().journal_entries_replayed, 0);
    engine.unmount().unwrap();
}

#[test]
fn test_read_only_mount_refuses_writes() {
    let fx = Fixture::new(1, &FormatOptions::default());
    let config = EngineConfig {
        read_only: true,
        ..Default::default()
    };
    let engine = fx.mount(&config);
    assert!(engine.is_read_only());
    assert!(matches!(
        engine.mutate(BtreeId::Inodes, vec![Mutation::Insert(inode(1, 0))]),
        Err(EngineError::ReadOnly)
    ));
    assert!(matches!(engine.checkpoint(), Err(EngineError::ReadOnly)));
    assert!(matches!(
        engine.write_data(1, 0, b"x"),
        Err(EngineError::ReadOnly)
    ));
}
