//! Copy-on-write commit path.
//!
//! A commit intent-locks the root, walks down to every node its keys
//! touch, and builds replacement content for those nodes and all their
//! ancestors. Oversized nodes are split, undersized ones merged with a
//! neighbour. Space for every new node is allocated before the journal
//! entry is appended; the nodes are written after it is durable. The
//! replaced nodes are then write-locked top-down, the root slot is swapped
//! and the old nodes are marked dead. Their buckets are released at the
//! next checkpoint.
//!
//! Writers to the same btree are serialized by the root's intent lock;
//! readers proceed concurrently until the final write-lock window.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bset::{Bset, SortedNode};
use crate::btree::NodeExpect;
use crate::bucket::DataType;
use crate::device::Tier;
use crate::engine::{Engine, PendingFree};
use crate::error::{EngineError, EngineResult};
use crate::extent::Extent;
use crate::fault::Subsystem;
use crate::journal::{Journal, JournalEntry, JournalReservation};
use crate::key::{self, BtreeId, Bpos, Record, Value};
use crate::node::{encoded_len_for, encoded_len_single, BtreeNode, BucketPtr, NodePtr};
use crate::node_cache::{CachedNode, ChildRange, NodeLockGuard};

/// One change in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or overwrite a record.
    Insert(Record),
    /// Delete the record at a position.
    Delete(Bpos),
    /// Replace the value at `pos` only if it currently equals `expected`
    /// (`None` meaning absent). `new: None` deletes.
    CompareAndSwap {
        /// Position.
        pos: Bpos,
        /// Required current value.
        expected: Option<Value>,
        /// Value to install.
        new: Option<Value>,
    },
}

/// Forces the node at `level` covering `pos` to be rewritten even if no
/// key in it changes. Used to move nodes out of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteTarget {
    /// Level of the node.
    pub level: u8,
    /// A key the node covers.
    pub pos: Bpos,
}

/// Commit options.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Fail with `LockContended` instead of waiting for the root lock.
    pub nonblocking: bool,
    /// Node to rewrite along with the batch.
    pub rewrite: Option<RewriteTarget>,
}

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    /// Journal sequence of the commit.
    pub seq: u64,
    /// Nodes written.
    pub nodes_written: usize,
}

#[derive(Debug, Clone)]
enum OpKind {
    Put(Value),
    Remove,
    Cas {
        expected: Option<Value>,
        new: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct KeyOp {
    pos: Bpos,
    kind: OpKind,
}

impl KeyOp {
    fn record(&self) -> Record {
        match &self.kind {
            OpKind::Put(v) | OpKind::Cas { new: Some(v), .. } => Record::new(self.pos, v.clone()),
            OpKind::Remove | OpKind::Cas { new: None, .. } => Record::tombstone(self.pos),
        }
    }
}

fn check_value(btree: BtreeId, pos: Bpos, value: &Value) -> EngineResult<()> {
    key::validate(btree, 0, &Record::new(pos, value.clone()))
        .map_err(|reason| EngineError::InvalidRecord { pos, reason })
}

/// Validates a batch and reduces it to one operation per key, in key order.
/// Later operations on a key replace earlier ones.
fn resolve(btree: BtreeId, mutations: Vec<Mutation>) -> EngineResult<Vec<KeyOp>> {
    let mut ops = Vec::with_capacity(mutations.len());
    for m in mutations {
        let op = match m {
            Mutation::Insert(Record {
                pos,
                value: Value::Deleted,
            })
            | Mutation::Delete(pos) => KeyOp {
                pos,
                kind: OpKind::Remove,
            },
            Mutation::Insert(rec) => {
                check_value(btree, rec.pos, &rec.value)?;
                KeyOp {
                    pos: rec.pos,
                    kind: OpKind::Put(rec.value),
                }
            }
            Mutation::CompareAndSwap { pos, expected, new } => {
                if let Some(v) = &new {
                    check_value(btree, pos, v)?;
                }
                KeyOp {
                    pos,
                    kind: OpKind::Cas { expected, new },
                }
            }
        };
        ops.push(op);
    }
    ops.sort_by_key(|op| op.pos);
    let mut out: Vec<KeyOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match out.last_mut() {
            Some(last) if last.pos == op.pos => *last = op,
            _ => out.push(op),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
enum Piece {
    /// Child left as it is.
    Existing { child: ChildRange },
    /// Index into the commit's pending nodes.
    Pending(usize),
}

#[derive(Debug, Clone)]
enum Content {
    Leaf(SortedNode),
    Interior(Vec<Piece>),
}

#[derive(Debug)]
struct PendingNode {
    level: u8,
    min_key: Bpos,
    max_key: Bpos,
    content: Content,
    size: usize,
}

struct Commit<'e> {
    engine: &'e Engine,
    btree: BtreeId,
    replay: bool,
    rewrite: Option<RewriteTarget>,
    guards: Vec<NodeLockGuard>,
    old_extents: Vec<Extent>,
    pending: Vec<PendingNode>,
    node_size: usize,
    merge_below: usize,
}

impl<'e> Commit<'e> {
    fn new(engine: &'e Engine, btree: BtreeId, rewrite: Option<RewriteTarget>, replay: bool) -> Self {
        let node_size = engine.geometry.node_size as usize;
        Self {
            engine,
            btree,
            replay,
            rewrite,
            guards: Vec::new(),
            old_extents: Vec::new(),
            pending: Vec::new(),
            node_size,
            merge_below: node_size * engine.config.btree.merge_threshold_percent as usize / 100,
        }
    }

    fn piece_min(&self, p: &Piece) -> Bpos {
        match p {
            Piece::Existing { child } => child.min_key,
            Piece::Pending(i) => self.pending[*i].min_key,
        }
    }

    fn piece_max(&self, p: &Piece) -> Bpos {
        match p {
            Piece::Existing { child } => child.max_key,
            Piece::Pending(i) => self.pending[*i].max_key,
        }
    }

    /// Encoded size of the parent record pointing at `p`.
    fn piece_record_len(&self, p: &Piece) -> usize {
        let ptr = match p {
            Piece::Existing { child } => child.ptr.clone(),
            Piece::Pending(_) => NodePtr {
                replicas: vec![
                    BucketPtr {
                        dev: 0,
                        bucket: 0,
                        offset: 0,
                        gen: 0,
                    };
                    usize::from(self.engine.geometry.metadata_replicas)
                ],
                seq: 0,
                len: self.engine.geometry.node_size,
            },
        };
        Record::new(self.piece_max(p), Value::BtreePtr(ptr)).encoded_len()
    }

    fn is_underfull(&self, p: &Piece) -> bool {
        match p {
            Piece::Pending(i) => self.pending[*i].size < self.merge_below,
            Piece::Existing { .. } => false,
        }
    }

    /// Whether the forced rewrite goes through `child` at `level`.
    fn rewrite_hits(&self, level: u8, child: &ChildRange) -> bool {
        self.rewrite.is_some_and(|t| {
            level >= t.level && child.min_key <= t.pos && t.pos <= child.max_key
        })
    }

    fn lock_child(&self, level: u8, child: &ChildRange) -> EngineResult<NodeLockGuard> {
        let expect = NodeExpect {
            btree: self.btree,
            level,
            min_key: child.min_key,
            max_key: child.max_key,
        };
        let node = self
            .engine
            .read_node(&child.ptr, &expect)
            .map_err(|e| self.engine.runtime_read_error(e))?;
        let guard = NodeLockGuard::intent(node);
        if guard.is_dead() {
            self.engine.faults.bug(
                Subsystem::Btree,
                format!("node {} replaced under an intent-locked parent", guard.key()),
            );
        }
        Ok(guard)
    }

    /// Takes over an existing node: it will be retired by this commit and
    /// its content becomes editable.
    fn absorb(&mut self, guard: NodeLockGuard) -> Content {
        let node = guard.node().clone();
        self.guards.push(guard);
        if node.node.is_leaf() {
            Content::Leaf(node.node.data.clone())
        } else {
            Content::Interior(
                node.children()
                    .into_iter()
                    .map(|child| Piece::Existing { child })
                    .collect(),
            )
        }
    }

    fn content_of(&self, p: &Piece) -> Content {
        match p {
            Piece::Pending(i) => self.pending[*i].content.clone(),
            Piece::Existing { .. } => self.engine.faults.bug(
                Subsystem::Btree,
                "content of an unlocked existing node requested",
            ),
        }
    }

    fn update_node(&mut self, guard: NodeLockGuard, ops: &[KeyOp]) -> EngineResult<Vec<Piece>> {
        let node = guard.node().clone();
        self.guards.push(guard);
        let (level, min, max) = (node.node.level, node.node.min_key, node.node.max_key);

        if node.node.is_leaf() {
            let mut batch = Vec::with_capacity(ops.len());
            for op in ops {
                let current = node.node.data.lookup(op.pos);
                if let OpKind::Cas { expected, .. } = &op.kind {
                    if current.map(|r| &r.value) != expected.as_ref() {
                        return Err(EngineError::Conflict { pos: op.pos });
                    }
                }
                let rec = op.record();
                if !self.replay {
                    if let Some(Record {
                        value: Value::Extent(old),
                        ..
                    }) = current
                    {
                        // replicas carried over into the new value stay live
                        let kept: &[BucketPtr] = match &rec.value {
                            Value::Extent(e) => &e.ptrs,
                            _ => &[],
                        };
                        let dropped: Vec<BucketPtr> = old
                            .ptrs
                            .iter()
                            .filter(|p| !kept.contains(p))
                            .copied()
                            .collect();
                        if !dropped.is_empty() {
                            self.old_extents.push(Extent {
                                ptrs: dropped,
                                ..old.clone()
                            });
                        }
                    }
                }
                batch.push(rec);
            }
            let data = node.node.data.with_batch(Bset::from_sorted(batch));
            return self.finish(0, min, max, Content::Leaf(data));
        }

        let child_level = level - 1;
        let children = node.children();
        let mut out: Vec<Piece> = Vec::with_capacity(children.len() + 1);
        let mut rest = ops;
        let mut i = 0;
        while i < children.len() {
            let child = &children[i];
            let n = rest.partition_point(|op| op.pos <= child.max_key);
            let (child_ops, tail) = rest.split_at(n);
            rest = tail;
            i += 1;
            if child_ops.is_empty() && !self.rewrite_hits(child_level, child) {
                out.push(Piece::Existing {
                    child: child.clone(),
                });
                continue;
            }

            let guard = self.lock_child(child_level, child)?;
            let first_new = out.len();
            let pieces = self.update_node(guard, child_ops)?;
            out.extend(pieces);
            if out.len() == first_new + 1 && self.is_underfull(&out[first_new]) {
                let next = children.get(i).filter(|next| {
                    !rest.first().is_some_and(|op| op.pos <= next.max_key)
                        && !self.rewrite_hits(child_level, next)
                });
                if self.merge_underfull(&mut out, child_level, next)? {
                    i += 1;
                }
            }
        }
        self.finish(level, min, max, Content::Interior(out))
    }

    /// Merges the last piece of `out` with a neighbour. `next` is the
    /// following child if nothing else in this commit touches it. Returns
    /// whether `next` was consumed.
    fn merge_underfull(
        &mut self,
        out: &mut Vec<Piece>,
        level: u8,
        next: Option<&ChildRange>,
    ) -> EngineResult<bool> {
        let cur = out.len() - 1;

        if cur > 0 && matches!(out[cur - 1], Piece::Pending(_)) {
            let right = out.remove(cur);
            let left = out.remove(cur - 1);
            let (lc, rc) = (self.content_of(&left), self.content_of(&right));
            let (min, max) = (self.piece_min(&left), self.piece_max(&right));
            let merged = self.merge(level, min, max, lc, rc)?;
            out.extend(merged);
            return Ok(false);
        }

        if let Some(next) = next {
            // ordered after every lock held so far
            let guard = self.lock_child(level, next)?;
            let left = out.remove(cur);
            let lc = self.content_of(&left);
            let rc = self.absorb(guard);
            let merged = self.merge(level, self.piece_min(&left), next.max_key, lc, rc)?;
            out.extend(merged);
            return Ok(true);
        }

        if cur > 0 {
            if let Piece::Existing { child } = out[cur - 1].clone() {
                let expect = NodeExpect {
                    btree: self.btree,
                    level,
                    min_key: child.min_key,
                    max_key: child.max_key,
                };
                let node = self
                    .engine
                    .read_node(&child.ptr, &expect)
                    .map_err(|e| self.engine.runtime_read_error(e))?;
                // behind us in lock order, so only without waiting
                if let Some(guard) = NodeLockGuard::try_intent(node) {
                    if !guard.is_dead() {
                        let right = out.remove(cur);
                        out.remove(cur - 1);
                        let lc = self.absorb(guard);
                        let rc = self.content_of(&right);
                        let merged = self.merge(level, child.min_key, self.piece_max(&right), lc, rc)?;
                        out.extend(merged);
                    }
                }
            }
        }
        Ok(false)
    }

    fn merge(
        &mut self,
        level: u8,
        min: Bpos,
        max: Bpos,
        left: Content,
        right: Content,
    ) -> EngineResult<Vec<Piece>> {
        let content = match (left, right) {
            (Content::Leaf(l), Content::Leaf(r)) => {
                let mut records = l.live_records();
                records.extend(r.live_records());
                Content::Leaf(SortedNode::from_records(records))
            }
            (Content::Interior(mut l), Content::Interior(r)) => {
                l.extend(r);
                Content::Interior(l)
            }
            _ => self
                .engine
                .faults
                .bug(Subsystem::Btree, format!("merging nodes of different kinds at level {level}")),
        };
        debug!(btree = %self.btree, level, %min, %max, "merging underfull node");
        self.finish(level, min, max, content)
    }

    fn push(&mut self, level: u8, min_key: Bpos, max_key: Bpos, content: Content, size: usize) -> Piece {
        self.pending.push(PendingNode {
            level,
            min_key,
            max_key,
            content,
            size,
        });
        Piece::Pending(self.pending.len() - 1)
    }

    /// Splits item sizes into consecutive groups that each fit a node.
    /// Returns the number of items per group.
    fn split_groups(&self, sizes: &[usize]) -> Vec<usize> {
        let usable = self.node_size - encoded_len_single(0);
        let total: usize = sizes.iter().sum::<usize>().max(1);
        let mut k = total.div_ceil(usable).max(2);
        loop {
            let mut counts = vec![0usize; k];
            let mut bytes = vec![0usize; k];
            let mut before = 0usize;
            for &s in sizes {
                let j = ((before + s / 2) * k / total).min(k - 1);
                counts[j] += 1;
                bytes[j] += s;
                before += s;
            }
            if bytes.iter().all(|b| *b <= usable) {
                return counts.into_iter().filter(|c| *c > 0).collect();
            }
            if k >= total {
                self.engine
                    .faults
                    .bug(Subsystem::Btree, "record larger than a btree node");
            }
            k += 1;
        }
    }

    fn successor_or_bug(&self, pos: Bpos) -> Bpos {
        match pos.successor() {
            Some(next) => next,
            None => self
                .engine
                .faults
                .bug(Subsystem::Btree, "split point at the last possible key"),
        }
    }

    /// Turns new content into one or more pending nodes that fit the node
    /// size.
    fn finish(&mut self, level: u8, min: Bpos, max: Bpos, content: Content) -> EngineResult<Vec<Piece>> {
        match content {
            Content::Leaf(mut data) => {
                if data.bset_count() > self.engine.config.btree.compact_threshold
                    || encoded_len_for(&data) > self.node_size
                {
                    data = data.compact(true);
                }
                let size = encoded_len_for(&data);
                if size <= self.node_size {
                    return Ok(vec![self.push(level, min, max, Content::Leaf(data), size)]);
                }

                let records = data.live_records();
                let sizes: Vec<usize> = records.iter().map(Record::encoded_len).collect();
                let groups = self.split_groups(&sizes);
                debug!(btree = %self.btree, level, parts = groups.len(), records = records.len(), "splitting leaf");
                let mut out = Vec::with_capacity(groups.len());
                let mut records = records.into_iter();
                let mut lo = min;
                for (gi, n) in groups.iter().enumerate() {
                    let chunk: Vec<Record> = records.by_ref().take(*n).collect();
                    let last = gi + 1 == groups.len();
                    let hi = if last {
                        max
                    } else {
                        chunk.last().map_or(max, |r| r.pos)
                    };
                    let data = SortedNode::from_records(chunk);
                    let size = encoded_len_for(&data);
                    out.push(self.push(level, lo, hi, Content::Leaf(data), size));
                    if !last {
                        lo = self.successor_or_bug(hi);
                    }
                }
                Ok(out)
            }
            Content::Interior(pieces) => {
                let sizes: Vec<usize> = pieces.iter().map(|p| self.piece_record_len(p)).collect();
                let size = encoded_len_single(sizes.iter().sum());
                if size <= self.node_size {
                    return Ok(vec![self.push(level, min, max, Content::Interior(pieces), size)]);
                }

                let groups = self.split_groups(&sizes);
                debug!(btree = %self.btree, level, parts = groups.len(), "splitting interior node");
                let mut out = Vec::with_capacity(groups.len());
                let mut pieces = pieces.into_iter();
                let mut sizes = sizes.into_iter();
                for (gi, n) in groups.iter().enumerate() {
                    let chunk: Vec<Piece> = pieces.by_ref().take(*n).collect();
                    let bytes: usize = sizes.by_ref().take(*n).sum();
                    let lo = if gi == 0 {
                        min
                    } else {
                        chunk.first().map_or(min, |p| self.piece_min(p))
                    };
                    let hi = if gi + 1 == groups.len() {
                        max
                    } else {
                        chunk.last().map_or(max, |p| self.piece_max(p))
                    };
                    let size = encoded_len_single(bytes);
                    out.push(self.push(level, lo, hi, Content::Interior(chunk), size));
                }
                Ok(out)
            }
        }
    }

    /// Reduces the top-level pieces to a single root: grows the tree while
    /// there is more than one, and drops interior roots with one child.
    fn build_root(&mut self, root_level: u8, mut pieces: Vec<Piece>) -> EngineResult<(Piece, u8)> {
        let mut level = root_level;
        while pieces.len() > 1 {
            level += 1;
            debug!(btree = %self.btree, level, "growing tree");
            pieces = self.finish(level, Bpos::MIN, Bpos::MAX, Content::Interior(pieces))?;
        }
        let Some(mut root) = pieces.pop() else {
            self.engine
                .faults
                .bug(Subsystem::Btree, "commit produced no root");
        };
        while let Piece::Pending(i) = root {
            match &self.pending[i].content {
                Content::Interior(children) if children.len() == 1 => {
                    debug!(btree = %self.btree, level, "shrinking tree");
                    root = children[0].clone();
                    level -= 1;
                }
                _ => break,
            }
        }
        Ok((root, level))
    }

    /// Pending nodes reachable from `root`, children before parents.
    fn post_order(&self, root: &Piece) -> Vec<usize> {
        fn walk(c: &Commit<'_>, p: &Piece, out: &mut Vec<usize>) {
            if let Piece::Pending(i) = p {
                if let Content::Interior(children) = &c.pending[*i].content {
                    for child in children {
                        walk(c, child, out);
                    }
                }
                out.push(*i);
            }
        }
        let mut out = Vec::new();
        walk(self, root, &mut out);
        out
    }

    fn write(
        mut self,
        root: Piece,
        root_level: u8,
        reservation: Option<JournalReservation<'_>>,
        payload: &[u8],
        replay: Option<u64>,
    ) -> EngineResult<CommitResult> {
        let engine = self.engine;
        let node_size = engine.geometry.node_size;

        let existing_root = match &root {
            Piece::Existing { child } => Some(
                engine
                    .read_node(
                        &child.ptr,
                        &NodeExpect {
                            btree: self.btree,
                            level: root_level,
                            min_key: Bpos::MIN,
                            max_key: Bpos::MAX,
                        },
                    )
                    .map_err(|e| engine.runtime_read_error(e))?,
            ),
            Piece::Pending(_) => None,
        };

        let order = self.post_order(&root);
        let mut allocs: Vec<Vec<BucketPtr>> = Vec::with_capacity(order.len());
        for _ in &order {
            match engine.alloc.allocate_with_fallback(
                Tier::Fast,
                node_size,
                engine.geometry.metadata_replicas,
                DataType::Btree,
            ) {
                Ok(ptrs) => allocs.push(ptrs),
                Err(e) => {
                    for ptrs in &allocs {
                        engine.alloc.release(ptrs, node_size);
                    }
                    return Err(e);
                }
            }
        }

        let seq = match (replay, reservation) {
            (Some(seq), _) => seq,
            (None, Some(res)) => match engine.journal.append(res, payload) {
                Ok(seq) => seq,
                Err(e) => {
                    for ptrs in &allocs {
                        engine.alloc.release(ptrs, node_size);
                    }
                    return Err(e);
                }
            },
            (None, None) => engine
                .faults
                .bug(Subsystem::Journal, "commit without a journal reservation"),
        };

        let mut ptrs: Vec<Option<NodePtr>> = vec![None; self.pending.len()];
        let mut written: Vec<Arc<CachedNode>> = Vec::with_capacity(order.len());
        let mut touched: HashSet<u32> = HashSet::new();
        let res = (|| -> EngineResult<()> {
            for (k, &i) in order.iter().enumerate() {
                let p = &self.pending[i];
                let data = match &p.content {
                    Content::Leaf(data) => data.clone(),
                    Content::Interior(children) => {
                        let mut records = Vec::with_capacity(children.len());
                        for child in children {
                            let ptr = match child {
                                Piece::Existing { child } => child.ptr.clone(),
                                Piece::Pending(j) => match &ptrs[*j] {
                                    Some(ptr) => ptr.clone(),
                                    None => engine
                                        .faults
                                        .bug(Subsystem::Btree, "parent written before its child"),
                                },
                            };
                            records.push(Record::new(self.piece_max(child), Value::BtreePtr(ptr)));
                        }
                        SortedNode::from_records(records)
                    }
                };
                let node = BtreeNode {
                    btree_id: self.btree,
                    level: p.level,
                    min_key: p.min_key,
                    max_key: p.max_key,
                    seq: rand::random(),
                    journal_seq: seq,
                    data,
                };
                let ptr = NodePtr {
                    replicas: allocs[k].clone(),
                    seq: node.seq,
                    len: node_size,
                };
                let bytes = node.encode(engine.config.data.checksum)?;
                if bytes.len() > node_size as usize {
                    engine.faults.bug(
                        Subsystem::Btree,
                        format!("node of {} bytes exceeds node size {node_size}", bytes.len()),
                    );
                }
                let cached = engine.cache.insert(ptr.clone(), node, true);
                written.push(cached);
                if engine.write_through {
                    let mut ok = 0;
                    for replica in &ptr.replicas {
                        let dev = &engine.devices[replica.dev as usize];
                        match dev.write(replica.device_offset(engine.geometry.bucket_size), &bytes) {
                            Ok(()) => {
                                ok += 1;
                                touched.insert(replica.dev);
                            }
                            Err(e) => engine.faults.nonfatal_io(
                                Subsystem::Btree,
                                replica.dev,
                                format!("node write to {replica} failed: {e}"),
                            ),
                        }
                    }
                    if ok == 0 {
                        return Err(engine.faults.fatal_io(
                            Subsystem::Btree,
                            None,
                            format!("node seq {:#x} reached no replica", ptr.seq),
                        ));
                    }
                }
                ptrs[i] = Some(ptr);
            }
            for dev in &touched {
                if let Err(e) = engine.devices[*dev as usize].flush() {
                    engine
                        .faults
                        .nonfatal_io(Subsystem::Btree, *dev, format!("flush after node writes failed: {e}"));
                }
            }
            Ok(())
        })();
        if let Err(e) = res {
            for node in &written {
                engine.cache.remove(&node.key());
            }
            for ptrs in &allocs {
                engine.alloc.release(ptrs, node_size);
            }
            return Err(e);
        }
        if engine.write_through {
            for node in &written {
                engine.cache.mark_clean(&node.key());
            }
        }

        let new_root = match existing_root {
            Some(node) => node,
            None => match written.last() {
                Some(node) => node.clone(),
                None => engine.faults.bug(Subsystem::Btree, "commit wrote no root"),
            },
        };

        self.guards.sort_by_key(|g| g.order_key());
        for guard in &mut self.guards {
            guard.upgrade_write();
        }
        engine.roots[self.btree.index()].set(new_root);
        for guard in &self.guards {
            guard.mark_dead();
        }

        let mut frees = Vec::new();
        for guard in &self.guards {
            for replica in &guard.ptr.replicas {
                frees.push(PendingFree {
                    ptr: *replica,
                    bytes: guard.ptr.len,
                });
            }
        }
        let block_size = engine.geometry.block_size;
        for extent in &self.old_extents {
            for replica in extent.ptrs.iter().filter(|p| engine.alloc.check_ptr(p).is_ok()) {
                frees.push(PendingFree {
                    ptr: *replica,
                    bytes: extent.alloc_bytes(block_size),
                });
            }
        }
        engine.queue_frees(frees);

        Ok(CommitResult {
            seq,
            nodes_written: order.len(),
        })
    }
}

impl Engine {
    /// Applies a batch of mutations to `btree` atomically.
    pub fn mutate(&self, btree: BtreeId, mutations: Vec<Mutation>) -> EngineResult<CommitResult> {
        self.commit(btree, mutations, CommitOptions::default())
    }

    /// [`Self::mutate`] with options.
    pub fn commit(
        &self,
        btree: BtreeId,
        mutations: Vec<Mutation>,
        opts: CommitOptions,
    ) -> EngineResult<CommitResult> {
        self.check_writable()?;
        let ops = resolve(btree, mutations)?;
        if ops.is_empty() && opts.rewrite.is_none() {
            return Ok(CommitResult {
                seq: self.journal.last_seq(),
                nodes_written: 0,
            });
        }
        self.commit_ops(btree, &ops, &opts, None)
    }

    /// Re-applies a journal entry at mount.
    pub(crate) fn replay_entry(&self, entry: &JournalEntry) -> EngineResult<CommitResult> {
        let ops: Vec<KeyOp> = entry
            .records
            .iter()
            .map(|r| KeyOp {
                pos: r.pos,
                kind: if r.is_tombstone() {
                    OpKind::Remove
                } else {
                    OpKind::Put(r.value.clone())
                },
            })
            .collect();
        if ops.is_empty() {
            return Ok(CommitResult {
                seq: entry.seq,
                nodes_written: 0,
            });
        }
        self.commit_ops(entry.btree, &ops, &CommitOptions::default(), Some(entry.seq))
    }

    fn commit_ops(
        &self,
        btree: BtreeId,
        ops: &[KeyOp],
        opts: &CommitOptions,
        replay: Option<u64>,
    ) -> EngineResult<CommitResult> {
        let payload = match replay {
            None => {
                let records: Vec<Record> = ops.iter().map(KeyOp::record).collect();
                Journal::encode_payload(btree, &records)?
            }
            Some(_) => Vec::new(),
        };

        let mut attempt = 0;
        let mut checkpointed_for_space = false;
        loop {
            attempt += 1;
            match self.try_commit(btree, ops, opts, replay, &payload) {
                Ok(res) => {
                    self.counters.commit(res.nodes_written);
                    debug!(%btree, seq = res.seq, nodes = res.nodes_written, keys = ops.len(), "commit");
                    return Ok(res);
                }
                Err(EngineError::JournalFull { .. })
                    if replay.is_none() && attempt < self.config.btree.commit_retries =>
                {
                    debug!(%btree, attempt, "journal full, checkpointing");
                    self.counters.retry();
                    self.checkpoint()?;
                }
                Err(EngineError::OutOfSpace { .. })
                    if replay.is_none() && !checkpointed_for_space && self.has_pending_frees() =>
                {
                    debug!(%btree, "out of space for nodes, checkpointing to release buckets");
                    checkpointed_for_space = true;
                    self.counters.retry();
                    self.checkpoint()?;
                }
                Err(e) => {
                    if !matches!(e, EngineError::Conflict { .. } | EngineError::LockContended { .. }) {
                        warn!(%btree, error = %e, "commit failed");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn try_commit(
        &self,
        btree: BtreeId,
        ops: &[KeyOp],
        opts: &CommitOptions,
        replay: Option<u64>,
        payload: &[u8],
    ) -> EngineResult<CommitResult> {
        let _gate = self.commit_gate.read();
        if replay.is_none() {
            self.check_writable()?;
        }
        let reservation = match replay {
            None => Some(self.journal.reserve(payload.len())?),
            Some(_) => None,
        };

        let root = loop {
            let node = self.roots[btree.index()].get();
            let guard = if opts.nonblocking {
                NodeLockGuard::try_intent(node).ok_or_else(|| EngineError::LockContended {
                    what: format!("{btree} root"),
                })?
            } else {
                NodeLockGuard::intent(node)
            };
            if !guard.is_dead() {
                break guard;
            }
        };

        let root_level = root.node.level;
        let mut commit = Commit::new(self, btree, opts.rewrite, replay.is_some());
        let pieces = commit.update_node(root, ops)?;
        let (root_piece, level) = commit.build_root(root_level, pieces)?;
        commit.write(root_piece, level, reservation, payload, replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(k: u64, v: u8) -> Mutation {
        Mutation::Insert(Record::new(Bpos::new(k, 0), Value::Blob(vec![v])))
    }

    #[test]
    fn test_resolve_last_wins_and_sorts() {
        let ops = resolve(
            BtreeId::Xattrs,
            vec![blob(3, 1), blob(1, 1), Mutation::Delete(Bpos::new(3, 0)), blob(2, 7)],
        )
        .unwrap();
        let recs: Vec<Record> = ops.iter().map(KeyOp::record).collect();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].pos, Bpos::new(1, 0));
        assert_eq!(recs[1].value, Value::Blob(vec![7]));
        assert!(recs[2].is_tombstone());
    }

    #[test]
    fn test_resolve_rejects_invalid() {
        let err = resolve(
            BtreeId::Extents,
            vec![Mutation::Insert(Record::new(Bpos::new(1, 0), Value::Blob(vec![0; 1024])))],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecord { .. }));

        let err = resolve(
            BtreeId::Inodes,
            vec![Mutation::CompareAndSwap {
                pos: Bpos::new(1, 0),
                expected: None,
                new: Some(Value::Dirent(crate::key::DirentValue {
                    target: 2,
                    kind: 1,
                    name: "a".into(),
                })),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecord { .. }));
    }

    #[test]
    fn test_cas_record() {
        let op = KeyOp {
            pos: Bpos::new(4, 0),
            kind: OpKind::Cas {
                expected: Some(Value::Blob(vec![1])),
                new: None,
            },
        };
        assert!(op.record().is_tombstone());
    }
}
