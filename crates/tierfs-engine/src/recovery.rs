//! Format, mount and offline check.
//!
//! A mount reads the newest superblock copy, loads bucket generations and
//! walks every btree from its root, counting each pointer against its
//! bucket (the mark pass). Entries journaled since the last checkpoint are
//! marked and replayed on top, and a writable mount ends with a checkpoint
//! of its own. Everything questionable found on the way is reported through
//! an [`FsckContext`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocator::{Allocator, MarkOutcome};
use crate::btree::{BtreeRoot, CommitOptions, Mutation, NodeExpect};
use crate::bucket::{decode_gens, encode_gens, DataType, DeviceLayout, GENS_HEADER_LEN};
use crate::checksum::ChecksumAlgorithm;
use crate::config::{EngineConfig, FormatOptions};
use crate::crypt::{EncryptionKey, KeyProvider};
use crate::device::{BlockDevice, Device, DeviceHealth, Tier};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::extent::Extent;
use crate::fault::{FaultHandler, Subsystem};
use crate::fsck::{DeclinePrompt, FixPolicy, FixPrompt, FsckContext, FsckReport};
use crate::journal::{Journal, JournalRegion};
use crate::key::{self, BtreeId, Bpos, Record, Value};
use crate::node::{BtreeNode, BucketPtr, NodePtr};
use crate::node_cache::CachedNode;
use crate::superblock::{
    pick_newest, BtreeRootPtr, DeviceDescriptor, Superblock, FEATURE_ENCRYPTION,
    FEATURE_REPLICATION, SB_MAX_LEN,
};

/// A record found broken during the mark pass, replaced once the mount is
/// writable.
#[derive(Debug, Clone)]
struct Repair {
    btree: BtreeId,
    pos: Bpos,
    expected: Value,
    new: Option<Value>,
}

#[derive(Debug, Default)]
struct MarkPass {
    /// Devices whose generation table was lost; pointers ahead of it are
    /// expected there.
    rebuild: HashSet<u32>,
    repairs: Vec<Repair>,
    nodes: u64,
    records: u64,
}

enum CopyState {
    Valid { write_seq: u64, uuid: Uuid },
    Unreadable(String),
    Damaged(String),
}

/// Reports a repairable problem. A mount that cannot write records it as
/// unfixed instead of pretending to repair it.
fn fixable(
    ctx: &mut FsckContext,
    writable: bool,
    subsystem: Subsystem,
    message: String,
) -> EngineResult<bool> {
    if writable {
        ctx.fsck_err(subsystem, message)
    } else {
        ctx.need_fsck_err_on(true, subsystem, message)?;
        Ok(false)
    }
}

fn read_gens(dev: &Device, layout: &DeviceLayout, write_seq: u64) -> EngineResult<Vec<u32>> {
    let (offset, _) = layout.gens_slot(write_seq);
    let len = GENS_HEADER_LEN + 4 * layout.nbuckets as usize;
    let bytes = dev.read(offset, len)?;
    decode_gens(
        &bytes,
        write_seq,
        &format!("generation table dev{} slot {}", dev.idx(), write_seq % 2),
    )
}

/// Writes an empty filesystem across `devices` and returns its uuid.
///
/// Device `i` gets tier `opts.tier(i)`. An encrypted filesystem records a
/// check value of `key` so later mounts can recognise it.
pub fn format(
    devices: &[Arc<dyn BlockDevice>],
    opts: &FormatOptions,
    key: Option<&EncryptionKey>,
) -> EngineResult<Uuid> {
    opts.validate(devices.len())?;
    if opts.encrypted && key.is_none() {
        return Err(EngineError::InvalidConfig {
            reason: "an encrypted filesystem needs a key".to_string(),
        });
    }

    let mut sb = Superblock::new(&opts.label, opts.block_size, opts.bucket_size, opts.node_size);
    sb.metadata_replicas = opts.metadata_replicas;
    sb.data_replicas = opts.data_replicas;
    if opts.encrypted {
        sb.features |= FEATURE_ENCRYPTION;
        sb.key_check = key.map(EncryptionKey::key_check);
    }
    if opts.metadata_replicas > 1 || opts.data_replicas > 1 {
        sb.features |= FEATURE_REPLICATION;
    }

    let mut devs = Vec::with_capacity(devices.len());
    let mut layouts = Vec::with_capacity(devices.len());
    for (i, backend) in devices.iter().enumerate() {
        let idx = i as u32;
        let nbuckets = backend.capacity() / u64::from(opts.bucket_size);
        let layout = DeviceLayout::new(nbuckets, opts.bucket_size, opts.journal_buckets)?;
        let tier = opts.tier(i);
        devs.push(Arc::new(Device::new(idx, tier, backend.clone(), opts.bucket_size, 1)));
        layouts.push(layout);
        sb.devices.push(DeviceDescriptor {
            idx,
            uuid: Uuid::new_v4(),
            tier,
            layout,
        });
    }

    let alloc = Allocator::new(&devs, &layouts, opts.block_size);
    for btree in BtreeId::ALL {
        let node = BtreeNode::empty_root(btree, rand::random());
        let bytes = node.encode(ChecksumAlgorithm::default())?;
        let replicas = alloc.allocate_with_fallback(
            Tier::Fast,
            opts.node_size,
            opts.metadata_replicas,
            DataType::Btree,
        )?;
        for r in &replicas {
            devs[r.dev as usize].write(r.device_offset(opts.bucket_size), &bytes)?;
        }
        sb.roots.push(BtreeRootPtr {
            btree,
            level: 0,
            ptr: NodePtr {
                replicas,
                seq: node.seq,
                len: opts.node_size,
            },
        });
    }

    sb.write_seq = 1;
    sb.journal_seq = 0;
    let zero = vec![0u8; opts.block_size as usize];
    for (dev, layout) in devs.iter().zip(&layouts) {
        let (journal_offset, _) = layout.journal_region();
        dev.write(journal_offset, &zero)?;
        let (gens_offset, _) = layout.gens_slot(sb.write_seq);
        dev.write(gens_offset, &encode_gens(&alloc.gens(dev.idx()), sb.write_seq))?;
        sb.write_to(dev)?;
        dev.flush()?;
    }

    info!(
        uuid = %sb.uuid,
        label = %sb.label,
        devices = devs.len(),
        bucket_size = sb.bucket_size,
        encrypted = opts.encrypted,
        "formatted"
    );
    Ok(sb.uuid)
}

/// Checks the filesystem on `devices` without keeping it mounted.
///
/// Repairs follow `policy`; with [`FixPolicy::No`] nothing is written.
/// Every failure ends up in the report's exit status rather than an error.
pub fn fsck(
    devices: &[Arc<dyn BlockDevice>],
    config: &EngineConfig,
    keys: &dyn KeyProvider,
    policy: FixPolicy,
    prompt: Arc<dyn FixPrompt>,
) -> FsckReport {
    let mut config = config.clone();
    config.fsck_on_mount = true;
    config.fix_policy = policy;
    if policy == FixPolicy::No {
        config.read_only = true;
    }

    let mut ctx = FsckContext::new(policy, prompt);
    let res = Engine::mount_with_fsck(devices, &config, keys, &mut ctx).and_then(|engine| {
        let checked = engine.verify_extents(&mut ctx);
        if checked.is_ok() && ctx.unfixed() == 0 && !engine.is_read_only() {
            engine.faults.set_errors(false);
        }
        let unmounted = engine.unmount();
        checked.and(unmounted)
    });
    match res {
        Ok(()) => {}
        Err(EngineError::UnknownVersion { version }) => return FsckReport::unknown_version(version),
        Err(EngineError::FsckHalted(_)) => {}
        Err(e) => {
            let halted = ctx.impossible(Subsystem::Recovery, e.to_string());
            debug!(%halted, "fsck pass stopped");
        }
    }
    let report = ctx.finish();
    info!(
        exit = %report.exit,
        fixed = report.fixed,
        unfixed = report.unfixed,
        "fsck finished"
    );
    report
}

impl Engine {
    /// Mounts the filesystem on `devices`, given in the order they were
    /// formatted.
    ///
    /// With `fsck_on_mount` problems found while mounting are repaired per
    /// `fix_policy` (asking is declined); otherwise they are only reported.
    pub fn mount(
        devices: &[Arc<dyn BlockDevice>],
        config: &EngineConfig,
        keys: &dyn KeyProvider,
    ) -> EngineResult<Engine> {
        let policy = if config.fsck_on_mount {
            config.fix_policy
        } else {
            FixPolicy::No
        };
        let mut ctx = FsckContext::new(policy, Arc::new(DeclinePrompt));
        Self::mount_with_fsck(devices, config, keys, &mut ctx)
    }

    /// [`Self::mount`] reporting through a caller-supplied context.
    pub fn mount_with_fsck(
        devices: &[Arc<dyn BlockDevice>],
        config: &EngineConfig,
        keys: &dyn KeyProvider,
        ctx: &mut FsckContext,
    ) -> EngineResult<Engine> {
        let started = Instant::now();
        config.validate()?;
        let writable = !config.read_only;

        // superblock copies
        let opened: Vec<Device> = devices
            .iter()
            .enumerate()
            .map(|(i, b)| {
                Device::new(i as u32, Tier::Fast, b.clone(), SB_MAX_LEN as u32, config.max_write_errors)
            })
            .collect();
        let copies: Vec<EngineResult<Superblock>> = opened.iter().map(Superblock::read_from).collect();
        let states: Vec<CopyState> = copies
            .iter()
            .map(|c| match c {
                Ok(sb) => CopyState::Valid {
                    write_seq: sb.write_seq,
                    uuid: sb.uuid,
                },
                Err(e @ (EngineError::Io { .. } | EngineError::DeviceFailed { .. })) => {
                    CopyState::Unreadable(e.to_string())
                }
                Err(e) => CopyState::Damaged(e.to_string()),
            })
            .collect();
        drop(opened);
        let mut sb = pick_newest(copies)?;

        if sb.unknown_features() != 0 {
            return Err(EngineError::CorruptedSuperblock {
                reason: format!("unknown feature bits {:#x}", sb.unknown_features()),
            });
        }
        if u64::from(config.data.max_extent_bytes) + 16 > u64::from(sb.bucket_size) {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "max_extent_bytes {} does not fit bucket size {}",
                    config.data.max_extent_bytes, sb.bucket_size
                ),
            });
        }
        if sb.devices.len() != devices.len() {
            return Err(ctx.impossible(
                Subsystem::Superblock,
                format!(
                    "filesystem has {} devices, {} given",
                    sb.devices.len(),
                    devices.len()
                ),
            ));
        }

        let mut failed = HashSet::new();
        for (i, state) in states.iter().enumerate() {
            match state {
                CopyState::Valid { uuid, .. } if *uuid != sb.uuid => {
                    return Err(ctx.impossible(
                        Subsystem::Superblock,
                        format!("device {i} belongs to filesystem {uuid}, not {}", sb.uuid),
                    ));
                }
                CopyState::Valid { write_seq, .. } if *write_seq < sb.write_seq => {
                    fixable(
                        ctx,
                        writable,
                        Subsystem::Superblock,
                        format!(
                            "superblock copy on device {i} is stale (write {write_seq}, newest {})",
                            sb.write_seq
                        ),
                    )?;
                }
                CopyState::Valid { .. } => {}
                CopyState::Damaged(reason) => {
                    fixable(
                        ctx,
                        writable,
                        Subsystem::Superblock,
                        format!("superblock copy on device {i} is damaged: {reason}"),
                    )?;
                }
                CopyState::Unreadable(reason) => {
                    if !config.degraded {
                        return Err(EngineError::DeviceError {
                            device: i as u32,
                            reason: format!("superblock unreadable ({reason}); mount degraded to continue"),
                        });
                    }
                    warn!(device = i, %reason, "device unreadable, mounting degraded");
                    failed.insert(i as u32);
                }
            }
        }

        let mut devs = Vec::with_capacity(devices.len());
        for (i, (desc, backend)) in sb.devices.iter().zip(devices).enumerate() {
            if desc.idx as usize != i {
                return Err(ctx.impossible(
                    Subsystem::Superblock,
                    format!("device slot {i} describes device {}", desc.idx),
                ));
            }
            let needed = desc.layout.nbuckets * u64::from(sb.bucket_size);
            if !failed.contains(&desc.idx) && backend.capacity() < needed {
                return Err(ctx.impossible(
                    Subsystem::Device,
                    format!(
                        "device {i} holds {} bytes, layout needs {needed}",
                        backend.capacity()
                    ),
                ));
            }
            let dev = Device::new(
                desc.idx,
                desc.tier,
                backend.clone(),
                sb.bucket_size,
                config.max_write_errors,
            );
            if failed.contains(&desc.idx) {
                dev.set_health(DeviceHealth::Failed);
            }
            devs.push(Arc::new(dev));
        }
        let layouts: Vec<DeviceLayout> = sb.devices.iter().map(|d| d.layout).collect();

        let key = if sb.features & FEATURE_ENCRYPTION != 0 {
            let key = keys.unlock(sb.uuid)?;
            if sb.key_check != Some(key.key_check()) {
                return Err(EngineError::KeyDenied {
                    reason: format!("key does not unlock filesystem {}", sb.uuid),
                });
            }
            Some(key)
        } else {
            None
        };

        let faults = Arc::new(FaultHandler::new(config.errors));
        faults.set_errors(sb.errors);
        faults.set_fsck_fixed(sb.fsck_fixed);
        ctx.attach_faults(faults.clone());

        // bucket generations
        let alloc = Allocator::new(&devs, &layouts, sb.block_size);
        let mut pass = MarkPass::default();
        for (dev, layout) in devs.iter().zip(&layouts) {
            if !dev.is_online() {
                continue;
            }
            match read_gens(dev, layout, sb.write_seq) {
                Ok(gens) => alloc.load_gens(dev.idx(), &gens)?,
                Err(e) => {
                    fixable(
                        ctx,
                        writable,
                        Subsystem::Allocator,
                        format!(
                            "generation table of device {} unreadable ({e}), rebuilding from pointers",
                            dev.idx()
                        ),
                    )?;
                    if sb.write_seq > 1 {
                        if let Ok(older) = read_gens(dev, layout, sb.write_seq - 1) {
                            alloc.load_gens(dev.idx(), &older)?;
                        }
                    }
                    pass.rebuild.insert(dev.idx());
                }
            }
        }

        let regions = devs
            .iter()
            .zip(&layouts)
            .map(|(dev, layout)| {
                let (offset, len) = layout.journal_region();
                JournalRegion {
                    dev: dev.clone(),
                    offset,
                    len,
                }
            })
            .collect();
        let journal = Journal::new(regions, sb.block_size, faults.clone());

        let mut engine = Engine::assemble(
            config.clone(),
            sb.clone(),
            devs,
            layouts,
            alloc,
            journal,
            faults,
            key,
            writable,
        );

        // pass 1: persisted trees, then the journal on top
        engine.alloc.begin_mark();
        let mut roots = Vec::with_capacity(BtreeId::ALL.len());
        for btree in BtreeId::ALL {
            let Some(root) = sb.root(btree).cloned() else {
                return Err(ctx.impossible(Subsystem::Btree, format!("superblock has no {btree} root")));
            };
            engine.mark_node_ptr(ctx, &mut pass, &root.ptr, &format!("{btree} root"))?;
            let expect = NodeExpect {
                btree,
                level: root.level,
                min_key: Bpos::MIN,
                max_key: Bpos::MAX,
            };
            let node = engine.read_node(&root.ptr, &expect).map_err(|e| {
                ctx.impossible(Subsystem::Btree, format!("{btree} root unreadable: {e}"))
            })?;
            roots.push(node);
        }
        for node in &roots {
            engine.mark_tree(ctx, &mut pass, node.clone())?;
        }
        engine.roots = roots.into_iter().map(BtreeRoot::new).collect();

        let epoch = sb.write_seq as u32;
        let scan = engine.journal.scan(sb.journal_seq, epoch)?;
        for entry in scan.entries.iter().filter(|e| e.btree == BtreeId::Extents) {
            for rec in &entry.records {
                if let Value::Extent(e) = &rec.value {
                    engine.mark_extent(ctx, &mut pass, rec.pos, e, true)?;
                }
            }
        }
        if let Some(damage) = &scan.damage {
            fixable(
                ctx,
                writable,
                Subsystem::Journal,
                format!(
                    "journal entry {} at offset {} is damaged, dropping it and everything after",
                    damage.seq, damage.offset
                ),
            )?;
        }
        engine.alloc.finish_mark();

        let mut replayed = 0u64;
        for entry in &scan.entries {
            engine.replay_entry(entry)?;
            replayed += 1;
        }
        engine.counters.replayed(replayed);
        let last = scan.entries.last().map_or(sb.journal_seq, |e| e.seq);
        engine.journal.set_position(scan.end_offset, last + 1, epoch);

        let mut repaired = 0usize;
        if writable {
            repaired = engine.apply_repairs(std::mem::take(&mut pass.repairs))?;
        }

        if writable {
            {
                let mut live = engine.sb.lock();
                live.clean = false;
                live.mount_count += 1;
                sb = live.clone();
            }
            {
                let _gate = engine.commit_gate.write();
                engine.checkpoint_locked(false)?;
            }
            if replayed > 0 || repaired > 0 {
                engine.remark()?;
            }
        } else {
            engine.faults.set_read_only();
        }

        info!(
            uuid = %sb.uuid,
            label = %sb.label,
            devices = devices.len(),
            degraded = failed.len(),
            read_only = !writable,
            nodes = pass.nodes,
            records = pass.records,
            replayed,
            repaired,
            findings = ctx.findings().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mounted"
        );
        Ok(engine)
    }

    /// Replays journal entries written since the last checkpoint again.
    ///
    /// Replay is idempotent, so on a healthy mount this changes nothing.
    /// Meant for a quiescent filesystem; returns the entries applied.
    pub fn replay_journal(&self) -> EngineResult<u64> {
        let (journal_seq, epoch) = {
            let sb = self.sb.lock();
            (sb.journal_seq, sb.write_seq as u32)
        };
        let scan = self.journal.scan(journal_seq, epoch)?;
        let mut n = 0;
        for entry in &scan.entries {
            self.replay_entry(entry)?;
            n += 1;
        }
        self.counters.replayed(n);
        debug!(entries = n, "journal replayed again");
        Ok(n)
    }

    fn mark_node_ptr(
        &self,
        ctx: &mut FsckContext,
        pass: &mut MarkPass,
        ptr: &NodePtr,
        what: &str,
    ) -> EngineResult<()> {
        let writable = self.write_through;
        for r in &ptr.replicas {
            match self.alloc.mark(r, self.geometry.node_size, DataType::Btree) {
                MarkOutcome::Marked => {}
                MarkOutcome::GenAhead { bucket_gen } => {
                    if !pass.rebuild.contains(&r.dev) {
                        fixable(
                            ctx,
                            writable,
                            Subsystem::Allocator,
                            format!("{what} replica {r} is ahead of bucket generation {bucket_gen}"),
                        )?;
                    }
                    self.alloc.raise_gen(r)?;
                    self.alloc.mark(r, self.geometry.node_size, DataType::Btree);
                }
                MarkOutcome::Stale { bucket_gen } => {
                    ctx.unfixable_fsck_err_on(
                        true,
                        Subsystem::Btree,
                        format!("{what} replica {r} is stale, bucket is at generation {bucket_gen}"),
                    )?;
                }
                MarkOutcome::OutOfRange => {
                    ctx.unfixable_fsck_err_on(
                        true,
                        Subsystem::Btree,
                        format!("{what} replica {r} points outside the data buckets"),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Marks every node and extent below `root`.
    fn mark_tree(
        &self,
        ctx: &mut FsckContext,
        pass: &mut MarkPass,
        root: Arc<CachedNode>,
    ) -> EngineResult<()> {
        let btree = root.node.btree_id;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            ctx.checkpoint()?;
            pass.nodes += 1;
            if node.node.is_leaf() {
                for rec in node.node.data.live_records() {
                    pass.records += 1;
                    self.check_leaf_record(ctx, pass, btree, &rec)?;
                }
                continue;
            }

            let children = node.children();
            ctx.unfixable_fsck_err_on(
                children.len() != node.node.data.live_count(),
                Subsystem::Btree,
                format!(
                    "{btree} interior node {}..={} holds records that are not child pointers",
                    node.node.min_key, node.node.max_key
                ),
            )?;
            for child in children.into_iter().rev() {
                let what = format!("{btree} node {}..={}", child.min_key, child.max_key);
                if let Err(reason) = child.ptr.validate() {
                    return Err(ctx.impossible(Subsystem::Btree, format!("{what}: {reason}")));
                }
                self.mark_node_ptr(ctx, pass, &child.ptr, &what)?;
                let expect = NodeExpect {
                    btree,
                    level: node.node.level - 1,
                    min_key: child.min_key,
                    max_key: child.max_key,
                };
                let child = self
                    .read_node(&child.ptr, &expect)
                    .map_err(|e| ctx.impossible(Subsystem::Btree, format!("{what} unreadable: {e}")))?;
                stack.push(child);
            }
        }
        Ok(())
    }

    fn check_leaf_record(
        &self,
        ctx: &mut FsckContext,
        pass: &mut MarkPass,
        btree: BtreeId,
        rec: &Record,
    ) -> EngineResult<()> {
        if let Err(reason) = key::validate(btree, 0, rec) {
            let fix = fixable(
                ctx,
                self.write_through,
                Subsystem::Btree,
                format!(
                    "invalid {} record at {} in {btree}: {reason}",
                    rec.value.kind(),
                    rec.pos
                ),
            )?;
            if fix {
                pass.repairs.push(Repair {
                    btree,
                    pos: rec.pos,
                    expected: rec.value.clone(),
                    new: None,
                });
            }
            return Ok(());
        }
        if let Value::Extent(e) = &rec.value {
            self.mark_extent(ctx, pass, rec.pos, e, false)?;
        }
        Ok(())
    }

    /// Marks the replicas of one extent. Journaled extents may legitimately
    /// be ahead of the generation table, which lags one checkpoint.
    fn mark_extent(
        &self,
        ctx: &mut FsckContext,
        pass: &mut MarkPass,
        pos: Bpos,
        extent: &Extent,
        journaled: bool,
    ) -> EngineResult<()> {
        let bytes = extent.alloc_bytes(self.geometry.block_size);
        let mut dropped: Vec<BucketPtr> = Vec::new();
        for p in &extent.ptrs {
            let problem = match self.alloc.mark(p, bytes, DataType::User) {
                MarkOutcome::Marked => continue,
                MarkOutcome::GenAhead { bucket_gen } => {
                    if !journaled && !pass.rebuild.contains(&p.dev) {
                        fixable(
                            ctx,
                            self.write_through,
                            Subsystem::Allocator,
                            format!("extent {pos} replica {p} is ahead of bucket generation {bucket_gen}"),
                        )?;
                    }
                    self.alloc.raise_gen(p)?;
                    self.alloc.mark(p, bytes, DataType::User);
                    continue;
                }
                MarkOutcome::Stale { bucket_gen } => {
                    format!("stale, bucket is at generation {bucket_gen}")
                }
                MarkOutcome::OutOfRange => "outside the data buckets".to_string(),
            };
            if fixable(
                ctx,
                self.write_through,
                Subsystem::Extent,
                format!("extent {pos} replica {p} is {problem}"),
            )? {
                dropped.push(*p);
            }
        }
        if !dropped.is_empty() {
            let kept: Vec<BucketPtr> = extent
                .ptrs
                .iter()
                .filter(|p| !dropped.contains(p))
                .copied()
                .collect();
            let new = (!kept.is_empty()).then(|| {
                Value::Extent(Extent {
                    ptrs: kept,
                    ..extent.clone()
                })
            });
            pass.repairs.push(Repair {
                btree: BtreeId::Extents,
                pos,
                expected: Value::Extent(extent.clone()),
                new,
            });
        }
        Ok(())
    }

    /// Applies repairs as compare-and-swap commits. A record changed since
    /// it was examined is left alone.
    fn apply_repairs(&self, repairs: Vec<Repair>) -> EngineResult<usize> {
        let mut applied = 0;
        for r in repairs {
            let m = Mutation::CompareAndSwap {
                pos: r.pos,
                expected: Some(r.expected),
                new: r.new,
            };
            match self.commit(r.btree, vec![m], CommitOptions::default()) {
                Ok(_) => applied += 1,
                Err(EngineError::Conflict { pos }) => {
                    debug!(btree = %r.btree, %pos, "record changed before repair, skipping")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }

    /// Recounts bucket liveness from the current trees. Only valid right
    /// after a checkpoint, when the trees are all that refers to buckets.
    fn remark(&self) -> EngineResult<()> {
        let _gate = self.commit_gate.write();
        self.alloc.begin_mark();
        for btree in BtreeId::ALL {
            let mut stack = vec![self.roots[btree.index()].get()];
            while let Some(node) = stack.pop() {
                for r in &node.ptr.replicas {
                    self.alloc.mark(r, self.geometry.node_size, DataType::Btree);
                }
                if node.node.is_leaf() {
                    for rec in node.node.data.live_records() {
                        if let Value::Extent(e) = &rec.value {
                            let bytes = e.alloc_bytes(self.geometry.block_size);
                            for p in &e.ptrs {
                                self.alloc.mark(p, bytes, DataType::User);
                            }
                        }
                    }
                    continue;
                }
                for child in node.children() {
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
        }
        self.alloc.finish_mark();
        debug!("bucket liveness recounted");
        Ok(())
    }
}
