//! In-memory cache of btree nodes.
//!
//! The cache is the only owner of node storage. Callers hold `Arc` pins to
//! cached nodes and lock them through [`NodeLockGuard`]; a node is evictable
//! only when it is clean and nobody but the cache holds it. Parent links are
//! kept as a key-to-key relation instead of pointers.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::key::Value;
use crate::node::{BtreeNode, NodeKey, NodePtr};
use crate::six::{LockOrderKey, LockOrderTracker, SixLock, SixMode};

/// Configuration for the node cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCacheConfig {
    /// Number of nodes kept before eviction starts.
    pub capacity: usize,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCacheStats {
    /// Lookups served from memory.
    pub hits: u64,
    /// Lookups that read the node from a device.
    pub misses: u64,
    /// Nodes evicted.
    pub evictions: u64,
    /// Nodes inserted.
    pub inserts: u64,
    /// Nodes currently cached.
    pub resident: usize,
}

impl NodeCacheStats {
    /// Fraction of lookups served from memory.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A node resident in the cache.
#[derive(Debug)]
pub struct CachedNode {
    /// Where the node lives.
    pub ptr: NodePtr,
    /// Node content.
    pub node: BtreeNode,
    lock: SixLock,
    dead: AtomicBool,
    dirty: AtomicBool,
    last_used: AtomicU64,
}

impl CachedNode {
    /// Cache key.
    pub fn key(&self) -> NodeKey {
        self.ptr.key()
    }

    /// The node's lock.
    pub fn lock(&self) -> &SixLock {
        &self.lock
    }

    /// Position in the global lock order.
    pub fn order_key(&self) -> LockOrderKey {
        LockOrderKey::new(self.node.btree_id, self.node.min_key, self.node.level)
    }

    /// Whether the node has been replaced by a newer copy.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Marks the node replaced. Must be called with the write lock held.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Whether the node has not been durably written yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Child pointers of an interior node with each child's key range.
    pub fn children(&self) -> Vec<ChildRange> {
        let mut min = self.node.min_key;
        let mut out = Vec::new();
        for rec in self.node.data.iter() {
            if let Value::BtreePtr(ptr) = &rec.value {
                out.push(ChildRange {
                    min_key: min,
                    max_key: rec.pos,
                    ptr: ptr.clone(),
                });
                match rec.pos.successor() {
                    Some(next) => min = next,
                    None => break,
                }
            }
        }
        out
    }
}

/// A child pointer together with the range the child covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRange {
    /// First key of the child.
    pub min_key: crate::key::Bpos,
    /// Last key of the child.
    pub max_key: crate::key::Bpos,
    /// Where the child lives.
    pub ptr: NodePtr,
}

/// Owned lock on a cached node; unlocks on drop. Not `Send`, since lock
/// order is tracked per thread.
pub struct NodeLockGuard {
    cached: Arc<CachedNode>,
    mode: SixMode,
    _not_send: PhantomData<*const ()>,
}

impl NodeLockGuard {
    /// Blocks for a read lock.
    pub fn read(node: Arc<CachedNode>) -> Self {
        LockOrderTracker::acquire(node.order_key(), true);
        node.lock.lock_read();
        Self::held(node, SixMode::Read)
    }

    /// Read lock without waiting.
    pub fn try_read(node: Arc<CachedNode>) -> Option<Self> {
        if !node.lock.try_lock_read() {
            return None;
        }
        LockOrderTracker::acquire(node.order_key(), false);
        Some(Self::held(node, SixMode::Read))
    }

    /// Blocks for the intent lock.
    pub fn intent(node: Arc<CachedNode>) -> Self {
        LockOrderTracker::acquire(node.order_key(), true);
        node.lock.lock_intent();
        Self::held(node, SixMode::Intent)
    }

    /// Intent lock without waiting.
    pub fn try_intent(node: Arc<CachedNode>) -> Option<Self> {
        if !node.lock.try_lock_intent() {
            return None;
        }
        LockOrderTracker::acquire(node.order_key(), false);
        Some(Self::held(node, SixMode::Intent))
    }

    fn held(node: Arc<CachedNode>, mode: SixMode) -> Self {
        Self {
            cached: node,
            mode,
            _not_send: PhantomData,
        }
    }

    /// Upgrades an intent lock to write, waiting for readers to leave.
    pub fn upgrade_write(&mut self) {
        debug_assert_eq!(self.mode, SixMode::Intent);
        if self.mode == SixMode::Intent {
            self.cached.lock.lock_write();
            self.mode = SixMode::Write;
        }
    }

    /// Current mode.
    pub fn mode(&self) -> SixMode {
        self.mode
    }

    /// The locked node.
    pub fn node(&self) -> &Arc<CachedNode> {
        &self.cached
    }
}

impl Deref for NodeLockGuard {
    type Target = CachedNode;

    fn deref(&self) -> &CachedNode {
        &self.cached
    }
}

impl Drop for NodeLockGuard {
    fn drop(&mut self) {
        match self.mode {
            SixMode::Read => self.cached.lock.unlock_read(),
            SixMode::Intent => self.cached.lock.unlock_intent(),
            SixMode::Write => {
                self.cached.lock.unlock_write();
                self.cached.lock.unlock_intent();
            }
        }
        LockOrderTracker::release(self.cached.order_key());
    }
}

struct CacheInner {
    nodes: HashMap<NodeKey, Arc<CachedNode>>,
    parents: HashMap<NodeKey, NodeKey>,
    stats: NodeCacheStats,
}

/// The node cache.
pub struct NodeCache {
    config: NodeCacheConfig,
    inner: Mutex<CacheInner>,
    clock: AtomicU64,
}

impl NodeCache {
    /// Creates an empty cache.
    pub fn new(config: NodeCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                nodes: HashMap::new(),
                parents: HashMap::new(),
                stats: NodeCacheStats::default(),
            }),
            clock: AtomicU64::new(0),
        }
    }

    fn touch(&self, node: &CachedNode) {
        let now = self.clock.fetch_add(1, Ordering::Relaxed);
        node.last_used.store(now, Ordering::Relaxed);
    }

    /// Resident node with `key`, if any.
    pub fn get(&self, key: &NodeKey) -> Option<Arc<CachedNode>> {
        let node = self.inner.lock().nodes.get(key).cloned()?;
        self.touch(&node);
        Some(node)
    }

    /// Returns the node `ptr` refers to, calling `load` on a miss. The loader
    /// reads and verifies the node; its errors are returned unchanged.
    pub fn lookup<F>(&self, ptr: &NodePtr, load: F) -> EngineResult<Arc<CachedNode>>
    where
        F: FnOnce() -> EngineResult<BtreeNode>,
    {
        let key = ptr.key();
        {
            let mut inner = self.inner.lock();
            if let Some(node) = inner.nodes.get(&key).cloned() {
                inner.stats.hits += 1;
                drop(inner);
                self.touch(&node);
                return Ok(node);
            }
            inner.stats.misses += 1;
        }

        let node = load()?;
        if node.seq != ptr.seq {
            return Err(EngineError::ReadError {
                location: key.to_string(),
                reason: format!("node seq {:#x} does not match pointer", node.seq),
            });
        }
        Ok(self.insert(ptr.clone(), node, false))
    }

    /// Adds a node; if another thread inserted it first, that copy wins.
    pub fn insert(&self, ptr: NodePtr, node: BtreeNode, dirty: bool) -> Arc<CachedNode> {
        let key = ptr.key();
        let children: Vec<NodeKey> = if node.level > 0 {
            node.data
                .iter()
                .filter_map(|r| match &r.value {
                    Value::BtreePtr(p) => Some(p.key()),
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };
        let cached = Arc::new(CachedNode {
            ptr,
            node,
            lock: SixLock::new(),
            dead: AtomicBool::new(false),
            dirty: AtomicBool::new(dirty),
            last_used: AtomicU64::new(0),
        });
        self.touch(&cached);

        let over = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.nodes.get(&key).cloned() {
                return existing;
            }
            for child in children {
                inner.parents.insert(child, key);
            }
            inner.nodes.insert(key, cached.clone());
            inner.stats.inserts += 1;
            inner.nodes.len() > self.config.capacity
        };
        if over {
            self.evict();
        }
        cached
    }

    /// Marks a node durably written.
    pub fn mark_clean(&self, key: &NodeKey) {
        if let Some(node) = self.inner.lock().nodes.get(key) {
            node.dirty.store(false, Ordering::Release);
        }
    }

    /// Drops a node regardless of pins, e.g. after a failed write.
    pub fn remove(&self, key: &NodeKey) {
        let mut inner = self.inner.lock();
        inner.nodes.remove(key);
        inner.parents.remove(key);
    }

    /// Parent of `child`, as last recorded.
    pub fn parent_of(&self, child: &NodeKey) -> Option<NodeKey> {
        self.inner.lock().parents.get(child).copied()
    }

    /// Evicts clean, unpinned nodes until the cache fits its capacity. Dead
    /// nodes go first, then the least recently used. Returns the number
    /// evicted.
    pub fn evict(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut candidates: Vec<(bool, u64, NodeKey)> = inner
            .nodes
            .iter()
            .filter(|(_, n)| Arc::strong_count(n) == 1 && !n.is_dirty())
            .map(|(k, n)| (!n.is_dead(), n.last_used.load(Ordering::Relaxed), *k))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (alive, _, key) in candidates {
            if alive && inner.nodes.len() <= self.config.capacity {
                break;
            }
            if let Some(node) = inner.nodes.remove(&key) {
                inner.parents.remove(&key);
                if node.node.level > 0 {
                    inner.parents.retain(|_, p| *p != key);
                }
                evicted += 1;
            }
        }
        inner.stats.evictions += evicted as u64;
        if evicted > 0 {
            debug!(evicted, resident = inner.nodes.len(), "evicted btree nodes");
        }
        evicted
    }

    /// Number of resident nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Whether no nodes are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every unpinned node.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.retain(|_, n| Arc::strong_count(n) > 1);
        inner.parents.clear();
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> NodeCacheStats {
        let inner = self.inner.lock();
        NodeCacheStats {
            resident: inner.nodes.len(),
            ..inner.stats.clone()
        }
    }
}
