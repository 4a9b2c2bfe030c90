//! Btree roots, node loading and read-side traversal.
//!
//! Readers descend with lock coupling: the child is read-locked before the
//! parent is released, so a reader always sees one consistent version of
//! the path. A node found dead (replaced by a commit) sends the reader back
//! to the root slot.

mod iter;
mod update;

pub use iter::BtreeIter;
pub use update::{CommitOptions, CommitResult, Mutation, RewriteTarget};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::device::{DeviceHealth, Tier};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::fault::Subsystem;
use crate::key::{BtreeId, Bpos, Record, Value};
use crate::node::{BtreeNode, BucketPtr, NodePtr};
use crate::node_cache::{CachedNode, NodeLockGuard};

/// The in-memory root slot of one btree.
pub(crate) struct BtreeRoot {
    slot: RwLock<Arc<CachedNode>>,
}

impl BtreeRoot {
    pub(crate) fn new(node: Arc<CachedNode>) -> Self {
        Self {
            slot: RwLock::new(node),
        }
    }

    /// Current root.
    pub(crate) fn get(&self) -> Arc<CachedNode> {
        self.slot.read().clone()
    }

    /// Publishes a new root.
    pub(crate) fn set(&self, node: Arc<CachedNode>) {
        *self.slot.write() = node;
    }
}

/// What a parent expects of a child it points to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeExpect {
    pub btree: BtreeId,
    pub level: u8,
    pub min_key: Bpos,
    pub max_key: Bpos,
}

impl NodeExpect {
    pub(crate) fn check(&self, node: &BtreeNode) -> Result<(), String> {
        if node.btree_id != self.btree
            || node.level != self.level
            || node.min_key != self.min_key
            || node.max_key != self.max_key
        {
            return Err(format!(
                "node {} level {} {}..={} where parent expects {} level {} {}..={}",
                node.btree_id,
                node.level,
                node.min_key,
                node.max_key,
                self.btree,
                self.level,
                self.min_key,
                self.max_key
            ));
        }
        Ok(())
    }
}

/// Shape of one node, as reported by [`Engine::btree_nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Level, 0 for leaves.
    pub level: u8,
    /// Smallest key covered.
    pub min_key: Bpos,
    /// Largest key covered.
    pub max_key: Bpos,
    /// Live records.
    pub records: usize,
    /// Encoded size in bytes.
    pub encoded_len: usize,
    /// Replica locations.
    pub replicas: Vec<BucketPtr>,
}

impl Engine {
    /// Orders replicas for reading: healthy devices before degraded ones,
    /// fast tier first. Failed devices are left out.
    pub(crate) fn replica_order(&self, ptrs: &[BucketPtr]) -> Vec<BucketPtr> {
        let mut out: Vec<(u8, Tier, BucketPtr)> = ptrs
            .iter()
            .filter_map(|p| {
                let dev = self.devices.get(p.dev as usize)?;
                let rank = match dev.health() {
                    DeviceHealth::Rw => 0,
                    DeviceHealth::Degraded => 1,
                    DeviceHealth::Failed => return None,
                };
                Some((rank, dev.tier(), *p))
            })
            .collect();
        out.sort_by_key(|(rank, tier, p)| (*rank, *tier, p.dev));
        out.into_iter().map(|(_, _, p)| p).collect()
    }

    /// Reads a node from the first replica that verifies, rewriting bad
    /// replicas from the good copy.
    pub(crate) fn load_node(&self, ptr: &NodePtr) -> EngineResult<BtreeNode> {
        let mut bad: Vec<BucketPtr> = Vec::new();
        let mut last_err = None;

        for replica in self.replica_order(&ptr.replicas) {
            if let Err(e) = self.alloc.check_ptr(&replica) {
                debug!(%replica, error = %e, "skipping stale node replica");
                last_err = Some(e);
                continue;
            }
            let dev = &self.devices[replica.dev as usize];
            let location = replica.to_string();
            let res = dev
                .read(replica.device_offset(self.geometry.bucket_size), ptr.len as usize)
                .and_then(|bytes| BtreeNode::decode(&bytes, &location))
                .and_then(|node| {
                    if node.seq == ptr.seq {
                        Ok(node)
                    } else {
                        Err(EngineError::ReadError {
                            location: location.clone(),
                            reason: format!("node seq {:#x}, pointer wants {:#x}", node.seq, ptr.seq),
                        })
                    }
                });
            match res {
                Ok(node) => {
                    for b in &bad {
                        self.repair_node_replica(b, &node);
                    }
                    return Ok(node);
                }
                Err(e) => {
                    if !matches!(e, EngineError::DeviceFailed { .. }) {
                        self.faults.nonfatal_io(
                            Subsystem::Btree,
                            replica.dev,
                            format!("btree node replica {replica}: {e}"),
                        );
                        bad.push(replica);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::ReadError {
            location: format!("node seq {:#x}", ptr.seq),
            reason: "no readable replica".to_string(),
        }))
    }

    fn repair_node_replica(&self, replica: &BucketPtr, node: &BtreeNode) {
        if !self.write_through || self.faults.is_read_only() {
            return;
        }
        let res = node
            .encode(self.config.data.checksum)
            .and_then(|bytes| {
                let dev = &self.devices[replica.dev as usize];
                dev.write(replica.device_offset(self.geometry.bucket_size), &bytes)?;
                dev.flush()
            });
        match res {
            Ok(()) => debug!(%replica, "rewrote damaged node replica"),
            Err(e) => warn!(%replica, error = %e, "node replica repair failed"),
        }
    }

    /// Node `ptr` refers to, from the cache or disk, checked against what
    /// the parent expects.
    pub(crate) fn read_node(
        &self,
        ptr: &NodePtr,
        expect: &NodeExpect,
    ) -> EngineResult<Arc<CachedNode>> {
        let node = self.cache.lookup(ptr, || self.load_node(ptr))?;
        expect.check(&node.node).map_err(|detail| EngineError::Inconsistent {
            subsystem: Subsystem::Btree,
            detail,
        })?;
        Ok(node)
    }

    /// Classifies a node read failure hit during normal operation.
    pub(crate) fn runtime_read_error(&self, err: EngineError) -> EngineError {
        match err {
            EngineError::ReadOnly | EngineError::FsckHalted(_) | EngineError::Cancelled => err,
            e => self.faults.inconsistent_err(Subsystem::Btree, &e),
        }
    }

    /// Read-locked leaf covering `pos`.
    pub(crate) fn find_leaf(&self, btree: BtreeId, pos: Bpos) -> EngineResult<NodeLockGuard> {
        'restart: loop {
            let mut guard = NodeLockGuard::read(self.roots[btree.index()].get());
            if guard.is_dead() {
                continue;
            }
            loop {
                if guard.node.is_leaf() {
                    return Ok(guard);
                }
                let Some(child) = guard.children().into_iter().find(|c| c.max_key >= pos) else {
                    return Err(self.runtime_read_error(EngineError::Inconsistent {
                        subsystem: Subsystem::Btree,
                        detail: format!("interior node does not cover {pos}"),
                    }));
                };
                let expect = NodeExpect {
                    btree,
                    level: guard.node.level - 1,
                    min_key: child.min_key,
                    max_key: child.max_key,
                };
                let node = match self.read_node(&child.ptr, &expect) {
                    Ok(node) => node,
                    Err(_) if guard.is_dead() => continue 'restart,
                    Err(e) => return Err(self.runtime_read_error(e)),
                };
                let child_guard = NodeLockGuard::read(node);
                drop(guard);
                if child_guard.is_dead() {
                    continue 'restart;
                }
                guard = child_guard;
            }
        }
    }

    /// Live value at `pos`.
    pub fn lookup(&self, btree: BtreeId, pos: Bpos) -> EngineResult<Option<Value>> {
        let leaf = self.find_leaf(btree, pos)?;
        Ok(leaf.node.data.lookup(pos).map(|r| r.value.clone()))
    }

    /// Live record at or after `pos`.
    pub fn lookup_ge(&self, btree: BtreeId, pos: Bpos) -> EngineResult<Option<Record>> {
        self.iter(btree, pos..).next().transpose()
    }

    /// Number of levels in `btree`.
    pub fn btree_height(&self, btree: BtreeId) -> u8 {
        self.roots[btree.index()].get().node.level + 1
    }

    /// Visits every node of `btree` top-down. Commits may run concurrently;
    /// the visit sees nodes of the version current when each was reached.
    pub fn for_each_node<F>(&self, btree: BtreeId, mut f: F) -> EngineResult<()>
    where
        F: FnMut(&CachedNode) -> EngineResult<()>,
    {
        let _gate = self.commit_gate.read();
        let root = self.roots[btree.index()].get();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            f(&node)?;
            if node.node.is_leaf() {
                continue;
            }
            let mut children = node.children();
            children.reverse();
            for child in children {
                let expect = NodeExpect {
                    btree,
                    level: node.node.level - 1,
                    min_key: child.min_key,
                    max_key: child.max_key,
                };
                stack.push(
                    self.read_node(&child.ptr, &expect)
                        .map_err(|e| self.runtime_read_error(e))?,
                );
            }
        }
        Ok(())
    }

    /// Shape of every node of `btree`, top-down.
    pub fn btree_nodes(&self, btree: BtreeId) -> EngineResult<Vec<NodeInfo>> {
        let mut out = Vec::new();
        self.for_each_node(btree, |n| {
            out.push(NodeInfo {
                level: n.node.level,
                min_key: n.node.min_key,
                max_key: n.node.max_key,
                records: n.node.data.live_count(),
                encoded_len: n.node.encoded_len(),
                replicas: n.ptr.replicas.clone(),
            });
            Ok(())
        })?;
        Ok(out)
    }
}
