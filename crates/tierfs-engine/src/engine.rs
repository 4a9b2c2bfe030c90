//! The mounted filesystem context.
//!
//! An [`Engine`] is created by [`Engine::mount`] and owns every piece of
//! per-mount state: devices, allocator, journal, node cache, btree roots and
//! the fault handler. Nothing is process-global. Dropping the engine without
//! [`Engine::unmount`] is equivalent to a crash.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::{Allocator, AllocatorStats, DeviceUsage};
use crate::btree::BtreeRoot;
use crate::bucket::{encode_gens, DeviceLayout};
use crate::config::EngineConfig;
use crate::crypt::EncryptionKey;
use crate::device::Device;
use crate::error::{EngineError, EngineResult};
use crate::fault::{FaultClass, FaultHandler, Subsystem};
use crate::gc::MoverState;
use crate::journal::{Journal, JournalStats};
use crate::key::BtreeId;
use crate::node::BucketPtr;
use crate::node_cache::{NodeCache, NodeCacheStats};
use crate::superblock::{BtreeRootPtr, Superblock};
use crate::tiering::AccessTracker;

/// Space held by a replaced node or extent, released at the next
/// checkpoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingFree {
    pub ptr: BucketPtr,
    pub bytes: u32,
}

/// Sizes fixed at format time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub block_size: u32,
    pub bucket_size: u32,
    pub node_size: u32,
    pub metadata_replicas: u8,
    pub data_replicas: u8,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    commits: AtomicU64,
    commit_retries: AtomicU64,
    nodes_written: AtomicU64,
    replayed: AtomicU64,
    extents_written: AtomicU64,
    extents_read: AtomicU64,
    replica_repairs: AtomicU64,
    checkpoints: AtomicU64,
}

impl Counters {
    pub(crate) fn commit(&self, nodes: usize) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.nodes_written.fetch_add(nodes as u64, Ordering::Relaxed);
    }

    pub(crate) fn retry(&self) {
        self.commit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replayed(&self, n: u64) {
        self.replayed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn extent_written(&self) {
        self.extents_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn extent_read(&self) {
        self.extents_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replica_repaired(&self) {
        self.replica_repairs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    /// Successful commits, replay included.
    pub commits: u64,
    /// Commits retried after a checkpoint.
    pub commit_retries: u64,
    /// Btree nodes written.
    pub nodes_written: u64,
    /// Journal entries replayed.
    pub journal_entries_replayed: u64,
    /// Extents written.
    pub extents_written: u64,
    /// Extents read.
    pub extents_read: u64,
    /// Extent and node replicas rewritten from a good copy.
    pub replica_repairs: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Nonfatal I/O faults.
    pub nonfatal_io_errors: u64,
    /// Inconsistencies.
    pub inconsistencies: u64,
    /// Fatal I/O faults.
    pub fatal_io_errors: u64,
    /// Whether mutations are refused.
    pub read_only: bool,
    /// Whether the filesystem is known to contain errors.
    pub errors: bool,
    /// Seconds since mount.
    pub uptime_secs: u64,
    /// Node cache.
    pub node_cache: NodeCacheStats,
    /// Journal.
    pub journal: JournalStats,
    /// Allocator.
    pub allocator: AllocatorStats,
}

/// A mounted filesystem.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) sb: Mutex<Superblock>,
    pub(crate) devices: Vec<Arc<Device>>,
    pub(crate) layouts: Vec<DeviceLayout>,
    pub(crate) cache: NodeCache,
    pub(crate) alloc: Allocator,
    pub(crate) journal: Journal,
    pub(crate) faults: Arc<FaultHandler>,
    pub(crate) roots: Vec<BtreeRoot>,
    /// Held shared by commits and exclusively by checkpoints.
    pub(crate) commit_gate: RwLock<()>,
    pending_frees: Mutex<Vec<PendingFree>>,
    pub(crate) key: Option<EncryptionKey>,
    pub(crate) inode_locks: DashMap<u64, Arc<Mutex<()>>>,
    pub(crate) access: AccessTracker,
    pub(crate) gc_state: MoverState,
    pub(crate) tiering_state: MoverState,
    pub(crate) counters: Counters,
    /// False while replaying for a mount that must not write.
    pub(crate) write_through: bool,
    pub(crate) geometry: Geometry,
    mounted_at: Instant,
    closed: AtomicBool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        config: EngineConfig,
        sb: Superblock,
        devices: Vec<Arc<Device>>,
        layouts: Vec<DeviceLayout>,
        alloc: Allocator,
        journal: Journal,
        faults: Arc<FaultHandler>,
        key: Option<EncryptionKey>,
        write_through: bool,
    ) -> Self {
        let geometry = Geometry {
            block_size: sb.block_size,
            bucket_size: sb.bucket_size,
            node_size: sb.node_size,
            metadata_replicas: sb.metadata_replicas,
            data_replicas: sb.data_replicas,
        };
        Self {
            cache: NodeCache::new(config.node_cache.clone()),
            access: AccessTracker::new(config.tiering.window_secs),
            config,
            sb: Mutex::new(sb),
            devices,
            layouts,
            alloc,
            journal,
            faults,
            roots: Vec::with_capacity(BtreeId::ALL.len()),
            commit_gate: RwLock::new(()),
            pending_frees: Mutex::new(Vec::new()),
            key,
            inode_locks: DashMap::new(),
            gc_state: MoverState::default(),
            tiering_state: MoverState::default(),
            counters: Counters::default(),
            write_through,
            geometry,
            mounted_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    /// Fails once the filesystem is read-only or unmounted.
    pub(crate) fn check_writable(&self) -> EngineResult<()> {
        if !self.write_through || self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ReadOnly);
        }
        self.faults.check_writable()
    }

    pub(crate) fn queue_frees(&self, frees: Vec<PendingFree>) {
        if !frees.is_empty() {
            self.pending_frees.lock().extend(frees);
        }
    }

    pub(crate) fn has_pending_frees(&self) -> bool {
        !self.pending_frees.lock().is_empty()
    }

    /// Filesystem uuid.
    pub fn uuid(&self) -> Uuid {
        self.sb.lock().uuid
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().clone()
    }

    /// Mount configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fault bookkeeping of this mount.
    pub fn faults(&self) -> &FaultHandler {
        &self.faults
    }

    /// Devices of the filesystem, by index.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Whether mutations are refused.
    pub fn is_read_only(&self) -> bool {
        self.check_writable().is_err()
    }

    /// Space usage per device.
    pub fn usage(&self) -> Vec<DeviceUsage> {
        self.alloc.usage()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            commits: c.commits.load(Ordering::Relaxed),
            commit_retries: c.commit_retries.load(Ordering::Relaxed),
            nodes_written: c.nodes_written.load(Ordering::Relaxed),
            journal_entries_replayed: c.replayed.load(Ordering::Relaxed),
            extents_written: c.extents_written.load(Ordering::Relaxed),
            extents_read: c.extents_read.load(Ordering::Relaxed),
            replica_repairs: c.replica_repairs.load(Ordering::Relaxed),
            checkpoints: c.checkpoints.load(Ordering::Relaxed),
            nonfatal_io_errors: self.faults.count(FaultClass::NonfatalIo),
            inconsistencies: self.faults.count(FaultClass::Inconsistency),
            fatal_io_errors: self.faults.count(FaultClass::FatalIo),
            read_only: self.is_read_only(),
            errors: self.faults.has_errors(),
            uptime_secs: self.mounted_at.elapsed().as_secs(),
            node_cache: self.cache.stats(),
            journal: self.journal.stats(),
            allocator: self.alloc.stats(),
        }
    }

    /// Persists the current roots and bucket generations, releases space
    /// of replaced nodes and extents, and empties the journal.
    pub fn checkpoint(&self) -> EngineResult<()> {
        self.check_writable()?;
        let _gate = self.commit_gate.write();
        self.checkpoint_locked(false)
    }

    /// Checkpoint with commits already excluded.
    pub(crate) fn checkpoint_locked(&self, clean: bool) -> EngineResult<()> {
        let started = Instant::now();
        let mut sb = self.sb.lock().clone();
        sb.write_seq += 1;

        let mut gens_ok = 0;
        for (dev, layout) in self.devices.iter().zip(&self.layouts) {
            if !dev.is_online() {
                continue;
            }
            let (offset, len) = layout.gens_slot(sb.write_seq);
            let table = encode_gens(&self.alloc.gens(dev.idx()), sb.write_seq);
            if table.len() as u64 > len {
                self.faults.bug(
                    Subsystem::Allocator,
                    format!("generation table of {} bytes exceeds its {len} byte slot", table.len()),
                );
            }
            match dev.write(offset, &table).and_then(|()| dev.flush()) {
                Ok(()) => gens_ok += 1,
                Err(e) => self.faults.nonfatal_io(
                    Subsystem::Allocator,
                    dev.idx(),
                    format!("generation table write failed: {e}"),
                ),
            }
        }
        if gens_ok == 0 {
            return Err(self.faults.fatal_io(
                Subsystem::Allocator,
                None,
                "generation tables reached no device",
            ));
        }

        sb.roots = BtreeId::ALL
            .iter()
            .map(|&btree| {
                let root = self.roots[btree.index()].get();
                if root.is_dirty() {
                    self.faults
                        .bug(Subsystem::Btree, format!("checkpoint of unwritten {btree} root"));
                }
                BtreeRootPtr {
                    btree,
                    level: root.node.level,
                    ptr: root.ptr.clone(),
                }
            })
            .collect();
        sb.journal_seq = self.journal.last_seq();
        sb.errors = self.faults.has_errors();
        sb.fsck_fixed = self.faults.fsck_fixed();
        sb.clean = clean;
        sb.touch();
        self.write_superblocks(&sb)?;

        self.journal.reset(sb.write_seq as u32);
        *self.sb.lock() = sb.clone();

        // the new roots are durable, so nothing persisted refers to these
        let frees = std::mem::take(&mut *self.pending_frees.lock());
        let mut released = 0usize;
        for f in &frees {
            match self.alloc.free(&f.ptr, f.bytes) {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!(ptr = %f.ptr, error = %e, "deferred free failed"),
            }
        }
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(
            write_seq = sb.write_seq,
            journal_seq = sb.journal_seq,
            frees = frees.len(),
            buckets_released = released,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint"
        );
        Ok(())
    }

    /// Writes `sb` to every online device.
    pub(crate) fn write_superblocks(&self, sb: &Superblock) -> EngineResult<()> {
        let mut ok = 0;
        for dev in self.devices.iter().filter(|d| d.is_online()) {
            match sb.write_to(dev).and_then(|()| dev.flush()) {
                Ok(()) => ok += 1,
                Err(e) => self.faults.nonfatal_io(
                    Subsystem::Superblock,
                    dev.idx(),
                    format!("superblock write failed: {e}"),
                ),
            }
        }
        if ok == 0 {
            return Err(self.faults.fatal_io(
                Subsystem::Superblock,
                None,
                "superblock reached no device",
            ));
        }
        debug!(write_seq = sb.write_seq, copies = ok, "superblock written");
        Ok(())
    }

    /// Writes a final checkpoint marked clean and refuses further
    /// mutations. A read-only mount only detaches.
    pub fn unmount(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let res = if self.check_writable().is_ok() {
            let _gate = self.commit_gate.write();
            self.checkpoint_locked(true)
        } else {
            Ok(())
        };
        self.closed.store(true, Ordering::Release);
        self.cache.clear();
        info!(uuid = %self.uuid(), clean = res.is_ok(), "unmounted");
        res
    }

    /// Per-inode lock serializing data writes.
    pub(crate) fn inode_lock(&self, inode: u64) -> Arc<Mutex<()>> {
        self.inode_locks.entry(inode).or_default().clone()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("uuid", &self.uuid())
            .field("devices", &self.devices.len())
            .field("write_through", &self.write_through)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}
