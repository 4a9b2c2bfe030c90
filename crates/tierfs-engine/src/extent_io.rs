//! File data path.
//!
//! Writes are split into extents of at most `max_extent_bytes`, each
//! compressed, encrypted when the filesystem has a key, checksummed and
//! written to `data_replicas` devices before the extents btree is updated
//! in one commit. Partially overwritten extents are read back and
//! rewritten, so an extent is never shared between two records.
//!
//! Reads try replicas in preference order, skip stale pointers and rewrite
//! replicas that failed their checksum from the first good copy.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::btree::{CommitOptions, Mutation};
use crate::bucket::DataType;
use crate::checksum;
use crate::compress::{compress, decompress};
use crate::crypt::{decrypt, encrypt, random_nonce};
use crate::device::Tier;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::extent::Extent;
use crate::fault::Subsystem;
use crate::fsck::FsckContext;
use crate::key::{BtreeId, Bpos, Record, Value};
use crate::node::BucketPtr;

impl Engine {
    /// Writes `data` to `inode` at `offset`, replacing what was there.
    ///
    /// When space runs out the write checkpoints to release replaced
    /// extents, then runs the garbage collector, before giving up.
    pub fn write_data(&self, inode: u64, offset: u64, data: &[u8]) -> EngineResult<()> {
        self.check_writable()?;
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| EngineError::InvalidRecord {
                pos: Bpos::new(inode, offset),
                reason: "write runs past the largest offset".to_string(),
            })?;

        let lock = self.inode_lock(inode);
        let _guard = lock.lock();
        let mut stage = 0;
        loop {
            match self.try_write_data(inode, offset, end, data) {
                Err(e @ EngineError::OutOfSpace { .. }) => {
                    if !self.reclaim_space(&mut stage)? {
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
    }

    /// One step of space recovery for a failed write. Returns whether
    /// retrying may help.
    fn reclaim_space(&self, stage: &mut u8) -> EngineResult<bool> {
        if *stage == 0 {
            *stage = 1;
            if self.has_pending_frees() {
                debug!("out of data space, checkpointing to release buckets");
                self.checkpoint()?;
                return Ok(true);
            }
        }
        if *stage == 1 {
            *stage = 2;
            debug!("out of data space, running gc");
            match self.run_gc(&AtomicBool::new(false)) {
                Ok(report) => return Ok(report.buckets_freed > 0),
                Err(EngineError::LockContended { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    fn try_write_data(&self, inode: u64, offset: u64, end: u64, data: &[u8]) -> EngineResult<()> {
        let (old, buf_start, buf) = {
            let _gate = self.commit_gate.read();
            let mut old: Vec<(Bpos, Extent)> = Vec::new();
            for rec in self.iter(
                BtreeId::Extents,
                Bpos::new(inode, offset + 1)..=Bpos::new(inode, u64::MAX),
            ) {
                let rec = rec?;
                let Value::Extent(e) = rec.value else {
                    continue;
                };
                if e.start(rec.pos.offset) >= end {
                    break;
                }
                old.push((rec.pos, e));
            }

            let buf_start = old
                .first()
                .map_or(offset, |(pos, e)| e.start(pos.offset).min(offset));
            let buf_end = old.last().map_or(end, |(pos, _)| pos.offset.max(end));
            let mut buf = vec![0u8; (buf_end - buf_start) as usize];

            // keep the parts of overlapped extents outside the new range
            for (pos, e) in &old {
                let start = e.start(pos.offset);
                if start >= offset && pos.offset <= end {
                    continue;
                }
                let bytes = self.read_extent(*pos, e)?;
                if start < offset {
                    let n = (offset - start) as usize;
                    let at = (start - buf_start) as usize;
                    buf[at..at + n].copy_from_slice(&bytes[..n]);
                }
                if pos.offset > end {
                    let from = (end - start) as usize;
                    let at = (end - buf_start) as usize;
                    buf[at..at + bytes.len() - from].copy_from_slice(&bytes[from..]);
                }
            }
            let at = (offset - buf_start) as usize;
            buf[at..at + data.len()].copy_from_slice(data);
            (old, buf_start, buf)
        };

        let mut mutations: Vec<Mutation> = old.iter().map(|(pos, _)| Mutation::Delete(*pos)).collect();
        let mut written: Vec<Extent> = Vec::new();
        let mut at = buf_start;
        for chunk in buf.chunks(self.config.data.max_extent_bytes as usize) {
            match self.write_extent(chunk) {
                Ok(extent) => {
                    at += chunk.len() as u64;
                    mutations.push(Mutation::Insert(Record::new(
                        Bpos::new(inode, at),
                        Value::Extent(extent.clone()),
                    )));
                    written.push(extent);
                }
                Err(e) => {
                    self.release_extents(&written);
                    return Err(e);
                }
            }
        }

        match self.mutate(BtreeId::Extents, mutations) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.release_extents(&written);
                Err(e)
            }
        }
    }

    fn release_extents(&self, extents: &[Extent]) {
        for e in extents {
            self.alloc.release(&e.ptrs, e.alloc_bytes(self.geometry.block_size));
        }
    }

    /// Encodes and writes one extent's worth of data.
    fn write_extent(&self, data: &[u8]) -> EngineResult<Extent> {
        let cfg = &self.config.data;
        let min_gain = cfg.compression_min_gain_percent.min(100) as u8;
        let (compression, compressed) = compress(data, cfg.compression, min_gain)?;
        let (stored, nonce) = match &self.key {
            Some(key) => {
                let nonce = random_nonce();
                (encrypt(key, &nonce, &compressed)?, Some(nonce))
            }
            None => (compressed, None),
        };
        let csum = checksum::compute(cfg.checksum, &stored);
        let ptrs = self.alloc.allocate_with_fallback(
            cfg.foreground_tier,
            stored.len() as u32,
            self.geometry.data_replicas,
            DataType::User,
        )?;
        let ptrs = self.write_replicas(ptrs, &stored)?;
        self.counters.extent_written();
        Ok(Extent {
            ptrs,
            len: data.len() as u32,
            stored_len: stored.len() as u32,
            csum,
            compression,
            nonce,
        })
    }

    /// Writes `bytes` to every allocated replica and flushes. Replicas that
    /// fail are released and left out; at least one must succeed.
    fn write_replicas(&self, ptrs: Vec<BucketPtr>, bytes: &[u8]) -> EngineResult<Vec<BucketPtr>> {
        let mut ok = Vec::with_capacity(ptrs.len());
        for p in ptrs {
            let dev = &self.devices[p.dev as usize];
            match dev
                .write(p.device_offset(self.geometry.bucket_size), bytes)
                .and_then(|()| dev.flush())
            {
                Ok(()) => ok.push(p),
                Err(e) => {
                    self.faults
                        .nonfatal_io(Subsystem::Extent, p.dev, format!("extent write to {p} failed: {e}"));
                    self.alloc.release(&[p], bytes.len() as u32);
                }
            }
        }
        if ok.is_empty() {
            return Err(self
                .faults
                .fatal_io(Subsystem::Extent, None, "extent write reached no replica"));
        }
        Ok(ok)
    }

    /// Reads `len` bytes of `inode` at `offset`. Holes read as zeros.
    pub fn read_data(&self, inode: u64, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        if len == 0 {
            return Ok(out);
        }
        let end = offset.saturating_add(len as u64);
        let _gate = self.commit_gate.read();
        for rec in self.iter(
            BtreeId::Extents,
            Bpos::new(inode, offset.saturating_add(1))..=Bpos::new(inode, u64::MAX),
        ) {
            let rec = rec?;
            let Value::Extent(e) = &rec.value else {
                continue;
            };
            let start = e.start(rec.pos.offset);
            if start >= end {
                break;
            }
            let bytes = self.read_extent(rec.pos, e)?;
            self.access.record(rec.pos);
            let from = start.max(offset);
            let to = rec.pos.offset.min(end);
            out[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&bytes[(from - start) as usize..(to - start) as usize]);
        }
        Ok(out)
    }

    /// Logical contents of one extent.
    pub(crate) fn read_extent(&self, pos: Bpos, extent: &Extent) -> EngineResult<Vec<u8>> {
        let stored = self.read_stored(pos, extent)?;
        let plain = match (&extent.nonce, &self.key) {
            (Some(nonce), Some(key)) => decrypt(key, nonce, &stored).map_err(|e| {
                self.faults
                    .inconsistent(Subsystem::Extent, format!("extent {pos}: {e}"))
            })?,
            (Some(_), None) => {
                return Err(self.faults.inconsistent(
                    Subsystem::Extent,
                    format!("extent {pos} is encrypted but the filesystem has no key"),
                ))
            }
            (None, _) => stored,
        };
        let data = decompress(&plain, extent.compression, extent.len as usize).map_err(|e| {
            self.faults
                .inconsistent(Subsystem::Extent, format!("extent {pos}: {e}"))
        })?;
        self.counters.extent_read();
        Ok(data)
    }

    /// Stored bytes of the first replica that verifies. Replicas that
    /// failed are rewritten from it when the filesystem is writable.
    fn read_stored(&self, pos: Bpos, extent: &Extent) -> EngineResult<Vec<u8>> {
        let mut bad: Vec<BucketPtr> = Vec::new();
        for p in self.replica_order(&extent.ptrs) {
            if self.alloc.check_ptr(&p).is_err() {
                debug!(%pos, replica = %p, "skipping stale extent replica");
                continue;
            }
            let dev = &self.devices[p.dev as usize];
            match dev.read(p.device_offset(self.geometry.bucket_size), extent.stored_len as usize) {
                Ok(bytes) if checksum::verify(&extent.csum, &bytes) => {
                    if !bad.is_empty() {
                        self.repair_extent_replicas(pos, &bad, &bytes);
                    }
                    return Ok(bytes);
                }
                Ok(bytes) => {
                    let actual = checksum::compute(extent.csum.algorithm, &bytes).value;
                    self.faults.nonfatal_io(
                        Subsystem::Extent,
                        p.dev,
                        format!(
                            "extent {pos} replica {p}: checksum {:#x}, expected {:#x}",
                            actual, extent.csum.value
                        ),
                    );
                    bad.push(p);
                }
                Err(EngineError::DeviceFailed { .. }) => {}
                Err(e) => {
                    self.faults.nonfatal_io(
                        Subsystem::Extent,
                        p.dev,
                        format!("extent {pos} replica {p}: {e}"),
                    );
                    bad.push(p);
                }
            }
        }
        Err(self.faults.inconsistent(
            Subsystem::Extent,
            format!("extent {pos} has no readable replica"),
        ))
    }

    fn repair_extent_replicas(&self, pos: Bpos, bad: &[BucketPtr], bytes: &[u8]) {
        if self.check_writable().is_err() {
            return;
        }
        for p in bad {
            let dev = &self.devices[p.dev as usize];
            match dev
                .write(p.device_offset(self.geometry.bucket_size), bytes)
                .and_then(|()| dev.flush())
            {
                Ok(()) => {
                    self.counters.replica_repaired();
                    info!(%pos, replica = %p, "rewrote damaged extent replica");
                }
                Err(e) => warn!(%pos, replica = %p, error = %e, "extent replica repair failed"),
            }
        }
    }

    /// Moves the extent at `pos` to `tier`, keeping its replica count.
    ///
    /// The stored bytes are copied as they are and the record is swapped
    /// only if it is unchanged, so a concurrent write wins. Returns whether
    /// the extent moved. Lock contention is retried `retries` times with
    /// exponential backoff starting at `backoff`.
    pub(crate) fn relocate_extent(
        &self,
        pos: Bpos,
        tier: Tier,
        fallback: bool,
        retries: u32,
        backoff: Duration,
    ) -> EngineResult<bool> {
        let (old, stored) = {
            let _gate = self.commit_gate.read();
            let Some(Value::Extent(old)) = self.lookup(BtreeId::Extents, pos)? else {
                return Ok(false);
            };
            let stored = self.read_stored(pos, &old)?;
            (old, stored)
        };

        let replicas = old.ptrs.len() as u8;
        let ptrs = if fallback {
            self.alloc
                .allocate_with_fallback(tier, old.stored_len, replicas, DataType::User)?
        } else {
            self.alloc.allocate(tier, old.stored_len, replicas, DataType::User)?
        };
        let new = Extent {
            ptrs: self.write_replicas(ptrs, &stored)?,
            ..old.clone()
        };

        let mut attempt = 0;
        loop {
            let cas = Mutation::CompareAndSwap {
                pos,
                expected: Some(Value::Extent(old.clone())),
                new: Some(Value::Extent(new.clone())),
            };
            let opts = CommitOptions {
                nonblocking: true,
                rewrite: None,
            };
            match self.commit(BtreeId::Extents, vec![cas], opts) {
                Ok(_) => {
                    debug!(%pos, %tier, "extent relocated");
                    return Ok(true);
                }
                Err(EngineError::LockContended { .. }) if attempt < retries => {
                    std::thread::sleep(backoff * 2u32.saturating_pow(attempt.min(16)));
                    attempt += 1;
                }
                Err(e) => {
                    self.release_extents(std::slice::from_ref(&new));
                    return match e {
                        EngineError::Conflict { .. } | EngineError::LockContended { .. } => Ok(false),
                        e => Err(e),
                    };
                }
            }
        }
    }

    /// Reads every replica of every extent and checks it against the
    /// extent checksum. Damaged replicas are rewritten from a good copy
    /// when the policy allows.
    pub(crate) fn verify_extents(&self, ctx: &mut FsckContext) -> EngineResult<()> {
        let extents: Vec<(Bpos, Extent)> = {
            let _gate = self.commit_gate.read();
            self.iter(BtreeId::Extents, ..)
                .filter_map(|rec| match rec {
                    Ok(Record {
                        pos,
                        value: Value::Extent(e),
                    }) => Some(Ok((pos, e))),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect::<EngineResult<_>>()?
        };
        let writable = self.check_writable().is_ok();

        for (pos, extent) in &extents {
            ctx.checkpoint()?;
            let mut good: Option<Vec<u8>> = None;
            let mut bad: Vec<(BucketPtr, String)> = Vec::new();
            for p in &extent.ptrs {
                let dev = &self.devices[p.dev as usize];
                if self.alloc.check_ptr(p).is_err() || !dev.is_online() {
                    continue;
                }
                match dev.read(p.device_offset(self.geometry.bucket_size), extent.stored_len as usize) {
                    Ok(bytes) if checksum::verify(&extent.csum, &bytes) => {
                        good.get_or_insert(bytes);
                    }
                    Ok(_) => bad.push((*p, "does not match its checksum".to_string())),
                    Err(e) => bad.push((*p, format!("is unreadable: {e}"))),
                }
            }
            if bad.is_empty() {
                continue;
            }
            let Some(bytes) = good else {
                ctx.unfixable_fsck_err_on(
                    true,
                    Subsystem::Extent,
                    format!("extent {pos} has no replica matching its checksum"),
                )?;
                continue;
            };
            for (p, problem) in bad {
                let message = format!("extent {pos} replica {p} {problem}");
                let fix = if writable {
                    ctx.fsck_err(Subsystem::Extent, message)?
                } else {
                    ctx.need_fsck_err_on(true, Subsystem::Extent, message)?
                };
                if fix {
                    let dev = &self.devices[p.dev as usize];
                    dev.write(p.device_offset(self.geometry.bucket_size), &bytes)
                        .and_then(|()| dev.flush())?;
                    self.counters.replica_repaired();
                }
            }
        }
        info!(extents = extents.len(), "extents verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, FormatOptions};
    use crate::crypt::NoKeyProvider;
    use crate::device::{BlockDevice, MemDevice};
    use crate::recovery::format;
    use std::sync::Arc;

    fn engine_with(config: EngineConfig) -> Engine {
        let devs: Vec<Arc<dyn BlockDevice>> = vec![Arc::new(MemDevice::new("mem0", 64 * 65536))];
        format(&devs, &FormatOptions::default(), None).unwrap();
        Engine::mount(&devs, &config, &NoKeyProvider).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let engine = engine_with(EngineConfig::default());
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        engine.write_data(7, 100, &data).unwrap();
        assert_eq!(engine.read_data(7, 100, data.len()).unwrap(), data);
        // holes on both sides
        let around = engine.read_data(7, 0, 10_200).unwrap();
        assert!(around[..100].iter().all(|b| *b == 0));
        assert!(around[10_100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_overwrite_middle_keeps_head_and_tail() {
        let engine = engine_with(EngineConfig::default());
        engine.write_data(1, 0, &[b'a'; 8192]).unwrap();
        engine.write_data(1, 1000, &[b'b'; 100]).unwrap();
        let out = engine.read_data(1, 0, 8192).unwrap();
        assert!(out[..1000].iter().all(|b| *b == b'a'));
        assert!(out[1000..1100].iter().all(|b| *b == b'b'));
        assert!(out[1100..].iter().all(|b| *b == b'a'));
    }

    #[test]
    fn test_large_write_splits_into_extents() {
        let mut config = EngineConfig::default();
        config.data.max_extent_bytes = 4096;
        let engine = engine_with(config);
        engine.write_data(3, 0, &vec![9u8; 10_000]).unwrap();
        let records: Vec<Record> = engine
            .iter(BtreeId::Extents, Bpos::new(3, 0)..=Bpos::new(3, u64::MAX))
            .collect::<EngineResult<_>>()
            .unwrap();
        let ends: Vec<u64> = records.iter().map(|r| r.pos.offset).collect();
        assert_eq!(ends, vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_corrupt_only_replica_is_inconsistent() {
        let engine = engine_with(EngineConfig::default());
        engine.write_data(5, 0, b"hello extent").unwrap();
        let Some(Value::Extent(e)) = engine.lookup(BtreeId::Extents, Bpos::new(5, 12)).unwrap() else {
            panic!("extent missing");
        };
        // single replica: damage makes the extent unreadable
        let p = e.ptrs[0];
        let dev = &engine.devices[0];
        let offset = p.device_offset(engine.geometry.bucket_size);
        let mut bytes = dev.read(offset, e.stored_len as usize).unwrap();
        bytes[0] ^= 0xff;
        dev.write(offset, &bytes).unwrap();
        assert!(matches!(
            engine.read_data(5, 0, 12),
            Err(EngineError::Inconsistent { .. })
        ));
    }
}
