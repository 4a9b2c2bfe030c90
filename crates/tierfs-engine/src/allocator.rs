//! Bucket allocator.
//!
//! Each device keeps a table of buckets with their generation, content type
//! and live byte count. Allocation appends into an open bucket per content
//! type and opens a fresh bucket from the free list when the open one is
//! full. Replicas always land on distinct devices; among the devices of the
//! requested tier, those with the largest free fraction are chosen first.
//!
//! A bucket whose live count drops to zero gets its generation bumped before
//! it returns to the free list, so pointers made under the old generation
//! are recognizably stale.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bucket::{Bucket, DataType, DeviceLayout};
use crate::device::{Device, DeviceHealth, Tier};
use crate::error::{EngineError, EngineResult};
use crate::fault::Subsystem;
use crate::node::BucketPtr;

/// Orders generation `a` against `b`, allowing for wraparound: `a` is
/// ahead when it lies less than half the u32 range after `b`.
pub(crate) fn gen_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

/// Allocator counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Successful allocations (one per replica).
    pub allocations: u64,
    /// Frees.
    pub frees: u64,
    /// Buckets opened from the free list.
    pub buckets_opened: u64,
    /// Buckets returned to the free list.
    pub buckets_freed: u64,
    /// Requests that failed for lack of space.
    pub out_of_space: u64,
}

/// Space usage of one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUsage {
    /// Device index.
    pub dev: u32,
    /// Tier.
    pub tier: Tier,
    /// Health.
    pub health: DeviceHealth,
    /// Buckets available to the allocator.
    pub data_buckets: u64,
    /// Buckets on the free list.
    pub free_buckets: u64,
    /// Live bytes across all buckets.
    pub live_bytes: u64,
}

/// Result of accounting one pointer during a mark pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Counted.
    Marked,
    /// The pointer's generation is older than the bucket's.
    Stale {
        /// Current bucket generation.
        bucket_gen: u32,
    },
    /// The pointer's generation is newer than the bucket's.
    GenAhead {
        /// Current bucket generation.
        bucket_gen: u32,
    },
    /// The pointer does not address a data bucket.
    OutOfRange,
}

#[derive(Debug)]
struct DeviceAllocInner {
    buckets: Vec<Bucket>,
    free: VecDeque<u64>,
    open_btree: Option<u64>,
    open_user: Option<u64>,
}

impl DeviceAllocInner {
    fn open_slot(&mut self, kind: DataType) -> &mut Option<u64> {
        match kind {
            DataType::Btree => &mut self.open_btree,
            _ => &mut self.open_user,
        }
    }

    fn free_bytes(&self, bucket_size: u32) -> u64 {
        let open_room: u64 = [self.open_btree, self.open_user]
            .into_iter()
            .flatten()
            .map(|b| u64::from(bucket_size - self.buckets[b as usize].fill))
            .sum();
        self.free.len() as u64 * u64::from(bucket_size) + open_room
    }
}

struct DeviceAlloc {
    dev: Arc<Device>,
    layout: DeviceLayout,
    inner: Mutex<DeviceAllocInner>,
}

impl DeviceAlloc {
    fn new(dev: Arc<Device>, layout: DeviceLayout) -> Self {
        let mut buckets = vec![Bucket::default(); layout.nbuckets as usize];
        for (b, bucket) in buckets.iter_mut().enumerate() {
            if let Some(t) = layout.reserved_type(b as u64) {
                bucket.data_type = t;
            }
        }
        let free = (layout.first_data_bucket..layout.nbuckets).collect();
        Self {
            dev,
            layout,
            inner: Mutex::new(DeviceAllocInner {
                buckets,
                free,
                open_btree: None,
                open_user: None,
            }),
        }
    }

    fn is_data_bucket(&self, b: u64) -> bool {
        b >= self.layout.first_data_bucket && b < self.layout.nbuckets
    }

    fn free_fraction(&self) -> f64 {
        let inner = self.inner.lock();
        let total = self.layout.data_buckets() * u64::from(self.layout.bucket_size);
        inner.free_bytes(self.layout.bucket_size) as f64 / total as f64
    }

    fn alloc(&self, bytes: u32, kind: DataType, stats: &Mutex<AllocatorStats>) -> Option<BucketPtr> {
        let bucket_size = self.layout.bucket_size;
        let mut inner = self.inner.lock();

        if let Some(b) = *inner.open_slot(kind) {
            let bucket = &mut inner.buckets[b as usize];
            if !bucket.needs_gc && bucket_size - bucket.fill >= bytes {
                let ptr = BucketPtr {
                    dev: self.dev.idx(),
                    bucket: b,
                    offset: bucket.fill,
                    gen: bucket.gen,
                };
                bucket.fill += bytes;
                bucket.live_bytes += bytes;
                return Some(ptr);
            }
            *inner.open_slot(kind) = None;
        }

        let b = loop {
            let b = inner.free.pop_front()?;
            let bucket = &inner.buckets[b as usize];
            if bucket.is_free() && !bucket.needs_gc {
                break b;
            }
        };
        let bucket = &mut inner.buckets[b as usize];
        bucket.data_type = kind;
        bucket.fill = bytes;
        bucket.live_bytes = bytes;
        let ptr = BucketPtr {
            dev: self.dev.idx(),
            bucket: b,
            offset: 0,
            gen: bucket.gen,
        };
        *inner.open_slot(kind) = Some(b);
        stats.lock().buckets_opened += 1;
        debug!(dev = self.dev.idx(), bucket = b, ?kind, gen = ptr.gen, "opened bucket");
        Some(ptr)
    }
}

/// Allocator over every device of a mounted filesystem.
pub struct Allocator {
    devices: Vec<DeviceAlloc>,
    block_size: u32,
    stats: Mutex<AllocatorStats>,
}

impl Allocator {
    /// Creates an allocator with every data bucket free.
    pub fn new(devices: &[Arc<Device>], layouts: &[DeviceLayout], block_size: u32) -> Self {
        Self {
            devices: devices
                .iter()
                .zip(layouts)
                .map(|(d, l)| DeviceAlloc::new(d.clone(), *l))
                .collect(),
            block_size,
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    fn device(&self, dev: u32) -> EngineResult<&DeviceAlloc> {
        self.devices
            .get(dev as usize)
            .ok_or_else(|| EngineError::Inconsistent {
                subsystem: Subsystem::Allocator,
                detail: format!("pointer to nonexistent device {dev}"),
            })
    }

    /// Block size allocations are rounded to.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Rounds `bytes` up to the block size.
    pub fn round_up(&self, bytes: u32) -> u32 {
        bytes.div_ceil(self.block_size) * self.block_size
    }

    /// Allocates `bytes` on `replicas` distinct devices of `tier`.
    pub fn allocate(
        &self,
        tier: Tier,
        bytes: u32,
        replicas: u8,
        kind: DataType,
    ) -> EngineResult<Vec<BucketPtr>> {
        self.allocate_in(Some(tier), bytes, replicas, kind)
    }

    /// Like [`Self::allocate`], falling back to devices of any tier.
    pub fn allocate_with_fallback(
        &self,
        tier: Tier,
        bytes: u32,
        replicas: u8,
        kind: DataType,
    ) -> EngineResult<Vec<BucketPtr>> {
        match self.allocate_in(Some(tier), bytes, replicas, kind) {
            Err(EngineError::OutOfSpace { .. }) => self
                .allocate_in(None, bytes, replicas, kind)
                .map_err(|e| match e {
                    EngineError::OutOfSpace { bytes, replicas, .. } => EngineError::OutOfSpace {
                        tier: tier.to_string(),
                        bytes,
                        replicas,
                    },
                    e => e,
                }),
            other => other,
        }
    }

    fn allocate_in(
        &self,
        tier: Option<Tier>,
        bytes: u32,
        replicas: u8,
        kind: DataType,
    ) -> EngineResult<Vec<BucketPtr>> {
        let rounded = self.round_up(bytes.max(1));
        let out_of_space = || EngineError::OutOfSpace {
            tier: tier.map_or_else(|| "any".to_string(), |t| t.to_string()),
            bytes: u64::from(rounded),
            replicas,
        };

        let mut candidates: Vec<(f64, &DeviceAlloc)> = self
            .devices
            .iter()
            .filter(|d| tier.is_none_or(|t| d.dev.tier() == t))
            .filter(|d| d.dev.health() != DeviceHealth::Failed)
            .filter(|d| rounded <= d.layout.bucket_size)
            .map(|d| (d.free_fraction(), d))
            .collect();
        candidates.sort_by(|a, b| {
            // degraded devices only when nothing healthy is left
            let ha = a.1.dev.health() == DeviceHealth::Degraded;
            let hb = b.1.dev.health() == DeviceHealth::Degraded;
            ha.cmp(&hb)
                .then(b.0.total_cmp(&a.0))
                .then(a.1.dev.idx().cmp(&b.1.dev.idx()))
        });

        let mut ptrs = Vec::with_capacity(usize::from(replicas));
        for (_, dev) in candidates {
            if ptrs.len() == usize::from(replicas) {
                break;
            }
            if let Some(ptr) = dev.alloc(rounded, kind, &self.stats) {
                ptrs.push(ptr);
            }
        }

        if ptrs.len() < usize::from(replicas) || replicas == 0 {
            self.release(&ptrs, rounded);
            self.stats.lock().out_of_space += 1;
            debug!(?tier, bytes = rounded, replicas, "allocation failed");
            return Err(out_of_space());
        }
        self.stats.lock().allocations += ptrs.len() as u64;
        Ok(ptrs)
    }

    /// Returns space that was allocated but never published.
    pub fn release(&self, ptrs: &[BucketPtr], bytes: u32) {
        for ptr in ptrs {
            if let Err(e) = self.free(ptr, bytes) {
                warn!(%ptr, error = %e, "failed to release unused allocation");
            }
        }
    }

    /// Drops `bytes` of liveness from the bucket `ptr` addresses. Returns
    /// whether the bucket became free.
    pub fn free(&self, ptr: &BucketPtr, bytes: u32) -> EngineResult<bool> {
        let bytes = self.round_up(bytes);
        let dev = self.device(ptr.dev)?;
        if !dev.is_data_bucket(ptr.bucket) {
            return Err(EngineError::Inconsistent {
                subsystem: Subsystem::Allocator,
                detail: format!("free of out-of-range pointer {ptr}"),
            });
        }
        let mut inner = dev.inner.lock();
        let bucket = &mut inner.buckets[ptr.bucket as usize];
        if bucket.gen != ptr.gen {
            return Err(EngineError::StalePointer {
                device: ptr.dev,
                bucket: ptr.bucket,
                ptr_gen: ptr.gen,
                bucket_gen: bucket.gen,
            });
        }
        if bucket.live_bytes < bytes {
            let detail = format!(
                "freeing {bytes} bytes from bucket {} with {} live",
                ptr, bucket.live_bytes
            );
            bucket.live_bytes = 0;
            warn!(%detail, "bucket accounting underflow");
        } else {
            bucket.live_bytes -= bytes;
        }

        let emptied = bucket.live_bytes == 0;
        if emptied {
            bucket.gen = bucket.gen.wrapping_add(1);
            bucket.data_type = DataType::Free;
            bucket.fill = 0;
            bucket.needs_gc = false;
            let inner = &mut *inner;
            for slot in [&mut inner.open_btree, &mut inner.open_user] {
                if *slot == Some(ptr.bucket) {
                    *slot = None;
                }
            }
            inner.free.push_back(ptr.bucket);
            debug!(dev = ptr.dev, bucket = ptr.bucket, "bucket freed");
        }
        drop(inner);

        let mut stats = self.stats.lock();
        stats.frees += 1;
        if emptied {
            stats.buckets_freed += 1;
        }
        Ok(emptied)
    }

    /// Rejects pointers whose generation does not match their bucket.
    pub fn check_ptr(&self, ptr: &BucketPtr) -> EngineResult<()> {
        let dev = self.device(ptr.dev)?;
        if !dev.is_data_bucket(ptr.bucket) {
            return Err(EngineError::Inconsistent {
                subsystem: Subsystem::Allocator,
                detail: format!("out-of-range pointer {ptr}"),
            });
        }
        let inner = dev.inner.lock();
        let bucket = &inner.buckets[ptr.bucket as usize];
        if bucket.gen != ptr.gen {
            return Err(EngineError::StalePointer {
                device: ptr.dev,
                bucket: ptr.bucket,
                ptr_gen: ptr.gen,
                bucket_gen: bucket.gen,
            });
        }
        Ok(())
    }

    /// Starts a mark pass: all liveness is forgotten until [`Self::mark`]
    /// re-counts it.
    pub fn begin_mark(&self) {
        for dev in &self.devices {
            let mut inner = dev.inner.lock();
            for b in dev.layout.first_data_bucket..dev.layout.nbuckets {
                let bucket = &mut inner.buckets[b as usize];
                bucket.live_bytes = 0;
                bucket.fill = 0;
                bucket.data_type = DataType::Free;
            }
            inner.open_btree = None;
            inner.open_user = None;
        }
    }

    /// Counts `bytes` at `ptr` as live.
    pub fn mark(&self, ptr: &BucketPtr, bytes: u32, kind: DataType) -> MarkOutcome {
        let bytes = self.round_up(bytes);
        let Some(dev) = self.devices.get(ptr.dev as usize) else {
            return MarkOutcome::OutOfRange;
        };
        if !dev.is_data_bucket(ptr.bucket) {
            return MarkOutcome::OutOfRange;
        }
        let mut inner = dev.inner.lock();
        let bucket = &mut inner.buckets[ptr.bucket as usize];
        match gen_cmp(ptr.gen, bucket.gen) {
            Ordering::Less => {
                return MarkOutcome::Stale {
                    bucket_gen: bucket.gen,
                }
            }
            Ordering::Greater => {
                return MarkOutcome::GenAhead {
                    bucket_gen: bucket.gen,
                }
            }
            Ordering::Equal => {}
        }
        bucket.live_bytes += bytes;
        bucket.data_type = kind;
        MarkOutcome::Marked
    }

    /// Raises a bucket's generation to match a pointer made under a newer
    /// generation than the table records.
    pub fn raise_gen(&self, ptr: &BucketPtr) -> EngineResult<()> {
        let dev = self.device(ptr.dev)?;
        let mut inner = dev.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(ptr.bucket as usize) {
            if gen_cmp(ptr.gen, bucket.gen) == Ordering::Greater {
                bucket.gen = ptr.gen;
            }
        }
        Ok(())
    }

    /// Ends a mark pass: unreferenced buckets return to the free list and
    /// referenced ones are closed. Generations are left alone; the pass
    /// only runs when no persisted pointer can address an unreferenced
    /// bucket.
    pub fn finish_mark(&self) {
        for dev in &self.devices {
            let bucket_size = dev.layout.bucket_size;
            let mut inner = dev.inner.lock();
            let mut free = VecDeque::new();
            for b in dev.layout.first_data_bucket..dev.layout.nbuckets {
                let bucket = &mut inner.buckets[b as usize];
                if bucket.live_bytes == 0 {
                    bucket.data_type = DataType::Free;
                    bucket.fill = 0;
                    bucket.needs_gc = false;
                    free.push_back(b);
                } else {
                    bucket.fill = bucket_size;
                }
            }
            inner.free = free;
        }
    }

    /// Copy of one bucket's state.
    pub fn bucket(&self, dev: u32, bucket: u64) -> Option<Bucket> {
        let dev = self.devices.get(dev as usize)?;
        dev.inner.lock().buckets.get(bucket as usize).copied()
    }

    /// Excludes a bucket from allocation, or lifts the exclusion.
    pub fn set_needs_gc(&self, dev: u32, bucket: u64, needs_gc: bool) {
        if let Some(d) = self.devices.get(dev as usize) {
            let mut inner = d.inner.lock();
            if let Some(b) = inner.buckets.get_mut(bucket as usize) {
                b.needs_gc = needs_gc;
            }
            if needs_gc {
                let inner = &mut *inner;
                for slot in [&mut inner.open_btree, &mut inner.open_user] {
                    if *slot == Some(bucket) {
                        *slot = None;
                    }
                }
            }
        }
    }

    /// Closed, in-use buckets whose live fraction is below `threshold`,
    /// emptiest first.
    pub fn gc_candidates(&self, threshold: f64) -> Vec<(u32, u64, Bucket)> {
        let mut out = Vec::new();
        for dev in &self.devices {
            if dev.dev.health() == DeviceHealth::Failed {
                continue;
            }
            let inner = dev.inner.lock();
            for b in dev.layout.first_data_bucket..dev.layout.nbuckets {
                if inner.open_btree == Some(b) || inner.open_user == Some(b) {
                    continue;
                }
                let bucket = inner.buckets[b as usize];
                if matches!(bucket.data_type, DataType::Btree | DataType::User)
                    && bucket.live_fraction(dev.layout.bucket_size) < threshold
                {
                    out.push((dev.dev.idx(), b, bucket));
                }
            }
        }
        out.sort_by_key(|(dev, b, bucket)| (bucket.live_bytes, *dev, *b));
        out
    }

    /// Generation of every bucket on `dev`.
    pub fn gens(&self, dev: u32) -> Vec<u32> {
        self.devices
            .get(dev as usize)
            .map(|d| d.inner.lock().buckets.iter().map(|b| b.gen).collect())
            .unwrap_or_default()
    }

    /// Installs a generation table read from disk.
    pub fn load_gens(&self, dev: u32, gens: &[u32]) -> EngineResult<()> {
        let d = self.device(dev)?;
        let mut inner = d.inner.lock();
        if gens.len() != inner.buckets.len() {
            return Err(EngineError::Inconsistent {
                subsystem: Subsystem::Allocator,
                detail: format!(
                    "generation table of device {dev} has {} entries, device has {} buckets",
                    gens.len(),
                    inner.buckets.len()
                ),
            });
        }
        for (bucket, gen) in inner.buckets.iter_mut().zip(gens) {
            bucket.gen = *gen;
        }
        Ok(())
    }

    /// Usage of every device.
    pub fn usage(&self) -> Vec<DeviceUsage> {
        self.devices
            .iter()
            .map(|d| {
                let inner = d.inner.lock();
                DeviceUsage {
                    dev: d.dev.idx(),
                    tier: d.dev.tier(),
                    health: d.dev.health(),
                    data_buckets: d.layout.data_buckets(),
                    free_buckets: inner.free.len() as u64,
                    live_bytes: inner.buckets.iter().map(|b| u64::from(b.live_bytes)).sum(),
                }
            })
            .collect()
    }

    /// Free buckets on online devices of `tier`.
    pub fn free_buckets(&self, tier: Tier) -> u64 {
        self.usage()
            .iter()
            .filter(|u| u.tier == tier && u.health != DeviceHealth::Failed)
            .map(|u| u.free_buckets)
            .sum()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AllocatorStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("devices", &self.devices.len())
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    const BUCKET: u32 = 65536;

    fn setup(tiers: &[Tier], nbuckets: u64) -> (Vec<Arc<Device>>, Allocator) {
        let devs: Vec<Arc<Device>> = tiers
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mem = Arc::new(MemDevice::new(format!("mem{i}"), nbuckets * u64::from(BUCKET)));
                Arc::new(Device::new(i as u32, *t, mem, BUCKET, 3))
            })
            .collect();
        let layouts: Vec<DeviceLayout> = devs
            .iter()
            .map(|_| DeviceLayout::new(nbuckets, BUCKET, 2).unwrap())
            .collect();
        let alloc = Allocator::new(&devs, &layouts, 4096);
        (devs, alloc)
    }

    #[test]
    fn test_allocate_rounds_and_appends() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let a = alloc.allocate(Tier::Fast, 100, 1, DataType::User).unwrap();
        let b = alloc.allocate(Tier::Fast, 5000, 1, DataType::User).unwrap();
        assert_eq!(a[0].bucket, b[0].bucket);
        assert_eq!(a[0].offset, 0);
        assert_eq!(b[0].offset, 4096);
        let bucket = alloc.bucket(0, a[0].bucket).unwrap();
        assert_eq!(bucket.live_bytes, 4096 + 8192);
        assert_eq!(bucket.data_type, DataType::User);
    }

    #[test]
    fn test_btree_and_user_use_separate_buckets() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let a = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap();
        let b = alloc.allocate(Tier::Fast, 4096, 1, DataType::Btree).unwrap();
        assert_ne!(a[0].bucket, b[0].bucket);
    }

    #[test]
    fn test_replicas_on_distinct_devices() {
        let (_devs, alloc) = setup(&[Tier::Fast, Tier::Fast, Tier::Capacity], 16);
        let ptrs = alloc.allocate(Tier::Fast, 4096, 2, DataType::User).unwrap();
        assert_eq!(ptrs.len(), 2);
        assert_ne!(ptrs[0].dev, ptrs[1].dev);
        assert!(ptrs.iter().all(|p| p.dev < 2));
        assert!(matches!(
            alloc.allocate(Tier::Fast, 4096, 3, DataType::User),
            Err(EngineError::OutOfSpace { replicas: 3, .. })
        ));
        let mixed = alloc
            .allocate_with_fallback(Tier::Fast, 4096, 3, DataType::User)
            .unwrap();
        assert_eq!(mixed.len(), 3);
    }

    #[test]
    fn test_balances_by_free_fraction() {
        let (_devs, alloc) = setup(&[Tier::Fast, Tier::Fast], 16);
        let first = alloc.allocate(Tier::Fast, BUCKET, 1, DataType::User).unwrap();
        let second = alloc.allocate(Tier::Fast, BUCKET, 1, DataType::User).unwrap();
        assert_ne!(first[0].dev, second[0].dev);
    }

    #[test]
    fn test_out_of_space_then_free_and_retry() {
        let (_devs, alloc) = setup(&[Tier::Fast], 8);
        let data_buckets = DeviceLayout::new(8, BUCKET, 2).unwrap().data_buckets();
        let mut held = Vec::new();
        for _ in 0..data_buckets {
            held.push(alloc.allocate(Tier::Fast, BUCKET, 1, DataType::User).unwrap()[0]);
        }
        let err = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap_err();
        assert!(matches!(err, EngineError::OutOfSpace { .. }));
        assert_eq!(alloc.stats().out_of_space, 1);

        let victim = held[0];
        assert!(alloc.free(&victim, BUCKET).unwrap());
        let again = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap();
        assert_eq!(again[0].bucket, victim.bucket);
        assert_eq!(again[0].gen, victim.gen + 1);
    }

    #[test]
    fn test_stale_pointer_rejected() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let p = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap()[0];
        alloc.check_ptr(&p).unwrap();
        assert!(alloc.free(&p, 4096).unwrap());
        assert!(matches!(
            alloc.check_ptr(&p),
            Err(EngineError::StalePointer { ptr_gen: 0, bucket_gen: 1, .. })
        ));
        assert!(matches!(alloc.free(&p, 4096), Err(EngineError::StalePointer { .. })));
    }

    #[test]
    fn test_reserved_bucket_pointer_rejected() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let sb = BucketPtr {
            dev: 0,
            bucket: 0,
            offset: 0,
            gen: 0,
        };
        assert!(matches!(alloc.check_ptr(&sb), Err(EngineError::Inconsistent { .. })));
        assert!(alloc.free(&sb, 4096).is_err());
        assert_eq!(alloc.mark(&sb, 4096, DataType::User), MarkOutcome::OutOfRange);
    }

    #[test]
    fn test_partial_free_keeps_bucket() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let a = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap()[0];
        let _b = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap()[0];
        assert!(!alloc.free(&a, 4096).unwrap());
        assert_eq!(alloc.bucket(0, a.bucket).unwrap().gen, a.gen);
    }

    #[test]
    fn test_mark_pass() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let kept = alloc.allocate(Tier::Fast, BUCKET, 1, DataType::Btree).unwrap()[0];
        let dropped = alloc.allocate(Tier::Fast, BUCKET, 1, DataType::User).unwrap()[0];

        alloc.begin_mark();
        assert_eq!(alloc.mark(&kept, 4096, DataType::Btree), MarkOutcome::Marked);
        let ahead = BucketPtr { gen: 4, ..kept };
        assert_eq!(alloc.mark(&ahead, 4096, DataType::Btree), MarkOutcome::GenAhead { bucket_gen: 0 });
        let reserved = BucketPtr { bucket: 0, ..kept };
        assert_eq!(alloc.mark(&reserved, 4096, DataType::Btree), MarkOutcome::OutOfRange);
        alloc.finish_mark();

        assert_eq!(alloc.bucket(0, kept.bucket).unwrap().live_bytes, 4096);
        let d = alloc.bucket(0, dropped.bucket).unwrap();
        assert!(d.is_free());
        assert_eq!(d.gen, dropped.gen);
        assert_eq!(alloc.usage()[0].free_buckets, alloc.usage()[0].data_buckets - 1);

        alloc.raise_gen(&ahead).unwrap();
        assert_eq!(alloc.bucket(0, kept.bucket).unwrap().gen, 4);
    }

    #[test]
    fn test_generation_order_survives_wraparound() {
        assert_eq!(gen_cmp(0, u32::MAX), Ordering::Greater);
        assert_eq!(gen_cmp(u32::MAX, 0), Ordering::Less);
        assert_eq!(gen_cmp(5, 5), Ordering::Equal);

        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let p = alloc.allocate(Tier::Fast, BUCKET, 1, DataType::User).unwrap()[0];
        let mut gens = alloc.gens(0);
        gens[p.bucket as usize] = u32::MAX;
        alloc.load_gens(0, &gens).unwrap();
        let old = BucketPtr { gen: u32::MAX, ..p };
        assert!(alloc.free(&old, BUCKET).unwrap());
        assert_eq!(alloc.bucket(0, p.bucket).unwrap().gen, 0);

        alloc.begin_mark();
        assert_eq!(
            alloc.mark(&old, 4096, DataType::User),
            MarkOutcome::Stale { bucket_gen: 0 }
        );
        alloc.raise_gen(&old).unwrap();
        assert_eq!(alloc.bucket(0, p.bucket).unwrap().gen, 0);
        let fresh = BucketPtr { gen: 0, ..p };
        assert_eq!(alloc.mark(&fresh, 4096, DataType::User), MarkOutcome::Marked);
    }

    #[test]
    fn test_failed_device_skipped() {
        let (devs, alloc) = setup(&[Tier::Fast, Tier::Fast], 16);
        devs[0].set_health(DeviceHealth::Failed);
        for _ in 0..4 {
            let p = alloc.allocate(Tier::Fast, BUCKET, 1, DataType::User).unwrap();
            assert_eq!(p[0].dev, 1);
        }
    }

    #[test]
    fn test_gc_candidates_and_needs_gc() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let a = alloc.allocate(Tier::Fast, 8192, 1, DataType::User).unwrap()[0];
        // force the bucket closed by filling the rest of it
        let rest = alloc.allocate(Tier::Fast, BUCKET - 8192, 1, DataType::User).unwrap();
        alloc.free(&rest[0], BUCKET - 8192).unwrap();
        let _next = alloc.allocate(Tier::Fast, 4096, 1, DataType::User).unwrap();

        let c = alloc.gc_candidates(0.5);
        assert_eq!(c.len(), 1);
        assert_eq!((c[0].0, c[0].1), (0, a.bucket));

        alloc.set_needs_gc(0, a.bucket, true);
        assert!(alloc.bucket(0, a.bucket).unwrap().needs_gc);
    }

    #[test]
    fn test_gens_roundtrip_through_table() {
        let (_devs, alloc) = setup(&[Tier::Fast], 16);
        let mut gens = alloc.gens(0);
        assert_eq!(gens.len(), 16);
        gens[9] = 7;
        alloc.load_gens(0, &gens).unwrap();
        assert_eq!(alloc.bucket(0, 9).unwrap().gen, 7);
        assert!(alloc.load_gens(0, &gens[..3]).is_err());
    }
}
