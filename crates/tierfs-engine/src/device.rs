//! Block device boundary and per-device health tracking.
//!
//! The engine talks to storage only through [`BlockDevice`]. Two backends
//! ship with the crate: [`MemDevice`], an in-memory image with fault
//! injection used by tests and tools, and [`FileDevice`], a regular file or
//! block special file. [`Device`] wraps a backend with the engine's index,
//! tier and health state.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Storage contract the engine expects from a device.
pub trait BlockDevice: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &str;
    /// Size in bytes.
    fn capacity(&self) -> u64;
    /// Reads `len` bytes at `offset`.
    fn read_block(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    /// Writes `data` at `offset`.
    fn write_block(&self, offset: u64, data: &[u8]) -> io::Result<()>;
    /// Makes previous writes durable.
    fn flush(&self) -> io::Result<()>;
}

/// Decides whether a write at (offset, len) reaches the medium.
pub type WriteFilter = Box<dyn Fn(u64, usize) -> bool + Send + Sync>;

/// In-memory device with fault injection.
pub struct MemDevice {
    name: String,
    data: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_filter: Mutex<Option<WriteFilter>>,
    writes: AtomicU64,
    dropped_writes: AtomicU64,
}

impl MemDevice {
    /// Zero-filled device of `capacity` bytes.
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self::from_image(name, vec![0u8; capacity as usize])
    }

    /// Device backed by an existing image.
    pub fn from_image(name: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(image),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_filter: Mutex::new(None),
            writes: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        }
    }

    /// Copy of the current image, as a crash would leave it.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Flips every byte in `offset..offset + len`.
    pub fn corrupt(&self, offset: u64, len: usize) {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = (start + len).min(data.len());
        for b in &mut data[start..end] {
            *b ^= 0xff;
        }
    }

    /// Makes every read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Silently drops writes the filter rejects.
    pub fn set_write_filter(&self, filter: WriteFilter) {
        *self.write_filter.lock() = Some(filter);
    }

    /// Removes the write filter.
    pub fn clear_write_filter(&self) {
        *self.write_filter.lock() = None;
    }

    /// Writes that reached the image.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Writes dropped by the filter.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDevice")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl BlockDevice for MemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_block(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure"));
        }
        let data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device"))?;
        Ok(data[start..end].to_vec())
    }

    fn write_block(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        if let Some(filter) = self.write_filter.lock().as_ref() {
            if !filter(offset, buf.len()) {
                self.dropped_writes.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "write past end of device"))?;
        data[start..end].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected flush failure"));
        }
        Ok(())
    }
}

/// Device backed by a file or block special file.
#[derive(Debug)]
pub struct FileDevice {
    name: String,
    file: File,
    capacity: u64,
}

impl FileDevice {
    /// Opens an existing file; its length is the capacity.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();
        info!(path = %path.display(), capacity, "opened device");
        Ok(Self {
            name: path.display().to_string(),
            file,
            capacity,
        })
    }

    /// Creates (or truncates) a file of `capacity` bytes.
    pub fn create(path: &Path, capacity: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(Self {
            name: path.display().to_string(),
            file,
            capacity,
        })
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_block(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_block(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Performance class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Low-latency devices; metadata and hot data.
    #[default]
    Fast,
    /// Large, slower devices; cold data.
    Capacity,
}

impl Tier {
    /// The other tier.
    pub fn other(self) -> Tier {
        match self {
            Tier::Fast => Tier::Capacity,
            Tier::Capacity => Tier::Fast,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Fast => "fast",
            Tier::Capacity => "capacity",
        })
    }
}

/// Health of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceHealth {
    /// Fully operational.
    Rw,
    /// Had I/O errors; still used, replicas elsewhere preferred.
    Degraded,
    /// Out of service.
    Failed,
}

impl DeviceHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DeviceHealth::Rw,
            1 => DeviceHealth::Degraded,
            _ => DeviceHealth::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DeviceHealth::Rw => 0,
            DeviceHealth::Degraded => 1,
            DeviceHealth::Failed => 2,
        }
    }
}

/// Device I/O counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Bytes read.
    pub bytes_read: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Read failures.
    pub read_errors: u64,
    /// Write failures.
    pub write_errors: u64,
}

/// A device as managed by a mounted engine.
pub struct Device {
    idx: u32,
    tier: Tier,
    backend: Arc<dyn BlockDevice>,
    bucket_size: u32,
    max_write_errors: u32,
    health: AtomicU8,
    consecutive_write_errors: AtomicU32,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

impl Device {
    /// Wraps `backend` as device `idx`.
    pub fn new(
        idx: u32,
        tier: Tier,
        backend: Arc<dyn BlockDevice>,
        bucket_size: u32,
        max_write_errors: u32,
    ) -> Self {
        Self {
            idx,
            tier,
            backend,
            bucket_size,
            max_write_errors: max_write_errors.max(1),
            health: AtomicU8::new(DeviceHealth::Rw.as_u8()),
            consecutive_write_errors: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Index within the filesystem.
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Tier assignment.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Bucket size in bytes.
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    /// Number of whole buckets on the device.
    pub fn nbuckets(&self) -> u64 {
        self.backend.capacity() / u64::from(self.bucket_size)
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Current health.
    pub fn health(&self) -> DeviceHealth {
        DeviceHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Overrides the health state.
    pub fn set_health(&self, health: DeviceHealth) {
        let old = DeviceHealth::from_u8(self.health.swap(health.as_u8(), Ordering::AcqRel));
        if old != health {
            warn!(device = self.idx, ?old, new = ?health, "device health changed");
        }
    }

    fn degrade(&self) {
        let _ = self.health.compare_exchange(
            DeviceHealth::Rw.as_u8(),
            DeviceHealth::Degraded.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the device still accepts I/O.
    pub fn is_online(&self) -> bool {
        self.health() != DeviceHealth::Failed
    }

    /// Reads `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        if !self.is_online() {
            return Err(EngineError::DeviceFailed { device: self.idx });
        }
        match self.backend.read_block(offset, len) {
            Ok(buf) => {
                self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
                Ok(buf)
            }
            Err(source) => {
                self.read_errors.fetch_add(1, Ordering::Relaxed);
                self.degrade();
                Err(EngineError::Io {
                    device: self.idx,
                    source,
                })
            }
        }
    }

    /// Writes `data` at `offset`. Repeated failures take the device out of
    /// service.
    pub fn write(&self, offset: u64, data: &[u8]) -> EngineResult<()> {
        if !self.is_online() {
            return Err(EngineError::DeviceFailed { device: self.idx });
        }
        match self.backend.write_block(offset, data) {
            Ok(()) => {
                self.consecutive_write_errors.store(0, Ordering::Relaxed);
                self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                debug!(device = self.idx, offset, len = data.len(), "device write");
                Ok(())
            }
            Err(source) => self.write_failed(source),
        }
    }

    /// Flushes the device cache.
    pub fn flush(&self) -> EngineResult<()> {
        if !self.is_online() {
            return Err(EngineError::DeviceFailed { device: self.idx });
        }
        self.backend.flush().or_else(|source| self.write_failed(source))
    }

    fn write_failed(&self, source: io::Error) -> EngineResult<()> {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        let n = self.consecutive_write_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if n >= self.max_write_errors {
            self.set_health(DeviceHealth::Failed);
            return Err(EngineError::DeviceFailed { device: self.idx });
        }
        self.degrade();
        Err(EngineError::Io {
            device: self.idx,
            source,
        })
    }

    /// I/O counters.
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("idx", &self.idx)
            .field("name", &self.name())
            .field("tier", &self.tier)
            .field("health", &self.health())
            .finish()
    }
}
