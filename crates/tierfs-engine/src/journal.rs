//! Write-ahead journal.
//!
//! Every btree commit appends one entry holding the net set of records it
//! applied to one btree. An entry is written to the journal region of every
//! online device and flushed before the commit writes its nodes, so any
//! node that reached disk can be reconstructed by replaying the journal on
//! top of the last checkpointed roots.
//!
//! Entry layout, padded to the block size:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | magic `TJNL`                            |
//! | 4      | 2    | format version                          |
//! | 6      | 2    | flags                                   |
//! | 8      | 8    | sequence                                |
//! | 16     | 4    | payload length                          |
//! | 20     | 4    | epoch (low bits of the checkpoint count) |
//! | 24     | 8    | xxh3 over sequence, length, epoch, payload |
//!
//! The epoch changes at every checkpoint, which makes entries left over
//! from before the last checkpoint unreadable as current ones.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{self, ChecksumAlgorithm};
use crate::device::Device;
use crate::error::{EngineError, EngineResult};
use crate::fault::{FaultHandler, Subsystem};
use crate::key::{BtreeId, Record};

/// Entry magic.
pub const JOURNAL_MAGIC: [u8; 4] = *b"TJNL";
/// Entry format version.
pub const JOURNAL_VERSION: u16 = 1;
/// Entry header length.
pub const JOURNAL_HEADER_LEN: usize = 32;

/// A decoded journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Sequence number.
    pub seq: u64,
    /// Btree the records belong to.
    pub btree: BtreeId,
    /// Net records of the commit, in key order.
    pub records: Vec<Record>,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    btree: BtreeId,
    records: &'a [Record],
}

#[derive(Deserialize)]
struct Payload {
    btree: BtreeId,
    records: Vec<Record>,
}

/// Journal counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalStats {
    /// Entries appended.
    pub entries_written: u64,
    /// Bytes appended per device, including padding.
    pub bytes_written: u64,
    /// Resets after checkpoints.
    pub resets: u64,
    /// Reservations refused because the journal was full.
    pub full_events: u64,
}

/// Journal region of one device.
#[derive(Debug, Clone)]
pub struct JournalRegion {
    /// Device holding the region.
    pub dev: Arc<Device>,
    /// Byte offset of the region.
    pub offset: u64,
    /// Region length in bytes.
    pub len: u64,
}

/// Where a scan stopped because an entry failed verification everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalDamage {
    /// Offset of the bad entry within the region.
    pub offset: u64,
    /// Sequence the entry claimed.
    pub seq: u64,
}

/// Result of scanning the journal.
#[derive(Debug, Clone, Default)]
pub struct JournalScan {
    /// Entries after the requested sequence, in order.
    pub entries: Vec<JournalEntry>,
    /// Offset just past the last good entry.
    pub end_offset: u64,
    /// Set if scanning stopped at a damaged entry.
    pub damage: Option<JournalDamage>,
}

#[derive(Debug)]
struct JournalInner {
    write_offset: u64,
    reserved: u64,
    next_seq: u64,
    epoch: u32,
    stats: JournalStats,
}

/// Space held for one entry until it is appended or dropped.
#[must_use]
pub struct JournalReservation<'a> {
    journal: &'a Journal,
    bytes: u64,
}

impl JournalReservation<'_> {
    /// Reserved bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for JournalReservation<'_> {
    fn drop(&mut self) {
        if self.bytes > 0 {
            let mut inner = self.journal.inner.lock();
            inner.reserved = inner.reserved.saturating_sub(self.bytes);
        }
    }
}

/// The journal.
pub struct Journal {
    regions: Vec<JournalRegion>,
    capacity: u64,
    block_size: u32,
    faults: Arc<FaultHandler>,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Journal over `regions`; all regions have the same length.
    pub fn new(regions: Vec<JournalRegion>, block_size: u32, faults: Arc<FaultHandler>) -> Self {
        let capacity = regions.iter().map(|r| r.len).min().unwrap_or(0);
        Self {
            regions,
            capacity,
            block_size,
            faults,
            inner: Mutex::new(JournalInner {
                write_offset: 0,
                reserved: 0,
                next_seq: 1,
                epoch: 0,
                stats: JournalStats::default(),
            }),
        }
    }

    /// Bytes per device region.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Largest entry the journal accepts.
    pub fn max_entry_size(&self) -> u64 {
        self.capacity / 2
    }

    /// Padded on-disk size of an entry with `payload_len` payload bytes.
    pub fn entry_size(&self, payload_len: usize) -> u64 {
        let raw = (JOURNAL_HEADER_LEN + payload_len) as u64;
        raw.div_ceil(u64::from(self.block_size)) * u64::from(self.block_size)
    }

    /// Encodes the payload for an entry.
    pub fn encode_payload(btree: BtreeId, records: &[Record]) -> EngineResult<Vec<u8>> {
        Ok(bincode::serialize(&PayloadRef { btree, records })?)
    }

    /// Reserves room for an entry of `payload_len` bytes.
    pub fn reserve(&self, payload_len: usize) -> EngineResult<JournalReservation<'_>> {
        let bytes = self.entry_size(payload_len);
        if bytes > self.max_entry_size() {
            return Err(EngineError::JournalEntryTooLarge {
                size: bytes,
                max: self.max_entry_size(),
            });
        }
        let mut inner = self.inner.lock();
        let used = inner.write_offset + inner.reserved;
        if used + bytes > self.capacity {
            inner.stats.full_events += 1;
            return Err(EngineError::JournalFull {
                needed: bytes,
                available: self.capacity.saturating_sub(used),
            });
        }
        inner.reserved += bytes;
        Ok(JournalReservation {
            journal: self,
            bytes,
        })
    }

    /// Appends an entry using `res` and waits until it is durable on at
    /// least one device. Returns the entry's sequence.
    pub fn append(&self, mut res: JournalReservation<'_>, payload: &[u8]) -> EngineResult<u64> {
        let size = self.entry_size(payload.len());
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(res.bytes);
        res.bytes = 0;
        if inner.write_offset + size > self.capacity {
            return Err(EngineError::JournalFull {
                needed: size,
                available: self.capacity.saturating_sub(inner.write_offset),
            });
        }

        let seq = inner.next_seq;
        let block = encode_entry(seq, inner.epoch, payload, size as usize);
        let offset = inner.write_offset;

        let mut durable = 0usize;
        for region in &self.regions {
            if !region.dev.is_online() {
                continue;
            }
            let res = region
                .dev
                .write(region.offset + offset, &block)
                .and_then(|()| region.dev.flush());
            match res {
                Ok(()) => durable += 1,
                Err(e) => self.faults.nonfatal_io(
                    Subsystem::Journal,
                    region.dev.idx(),
                    format!("journal write of seq {seq} failed: {e}"),
                ),
            }
        }
        if durable == 0 {
            return Err(self.faults.fatal_io(
                Subsystem::Journal,
                None,
                format!("journal entry {seq} reached no device"),
            ));
        }

        inner.next_seq += 1;
        inner.write_offset += size;
        inner.stats.entries_written += 1;
        inner.stats.bytes_written += size;
        debug!(seq, offset, size, copies = durable, "journal entry durable");
        Ok(seq)
    }

    /// Reads entries following `after_seq` written under `epoch`.
    pub fn scan(&self, after_seq: u64, epoch: u32) -> EngineResult<JournalScan> {
        let mut scan = JournalScan::default();
        let mut offset = 0u64;
        let mut expected = after_seq + 1;
        let block = u64::from(self.block_size);

        while offset + block <= self.capacity {
            let mut damaged = false;
            let mut found = None;
            for region in self.regions.iter().filter(|r| r.dev.is_online()) {
                match self.read_entry(region, offset, expected, epoch) {
                    Ok(Some(entry)) => {
                        found = Some(entry);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(dev = region.dev.idx(), offset, seq = expected, error = %e, "bad journal entry copy");
                        damaged = true;
                    }
                }
            }
            match found {
                Some((entry, size)) => {
                    scan.entries.push(entry);
                    offset += size;
                    expected += 1;
                }
                None => {
                    if damaged {
                        scan.damage = Some(JournalDamage {
                            offset,
                            seq: expected,
                        });
                    }
                    break;
                }
            }
        }
        scan.end_offset = offset;
        info!(
            after_seq,
            entries = scan.entries.len(),
            end_offset = offset,
            damaged = scan.damage.is_some(),
            "journal scanned"
        );
        Ok(scan)
    }

    /// Reads one entry copy. `Ok(None)` means the slot does not hold the
    /// expected entry, which ends the journal.
    fn read_entry(
        &self,
        region: &JournalRegion,
        offset: u64,
        expected: u64,
        epoch: u32,
    ) -> EngineResult<Option<(JournalEntry, u64)>> {
        let header = region.dev.read(region.offset + offset, JOURNAL_HEADER_LEN)?;
        if header[0..4] != JOURNAL_MAGIC {
            return Ok(None);
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        let seq = read_u64(&header[8..16]);
        let len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        let entry_epoch = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        if seq != expected || entry_epoch != epoch {
            return Ok(None);
        }
        let location = format!("journal dev{} +{offset}", region.dev.idx());
        if version != JOURNAL_VERSION {
            return Err(EngineError::ReadError {
                location,
                reason: format!("journal entry version {version}"),
            });
        }
        let size = self.entry_size(len);
        if offset + size > self.capacity {
            return Err(EngineError::ReadError {
                location,
                reason: format!("journal entry of {len} bytes overruns the region"),
            });
        }
        let payload = region
            .dev
            .read(region.offset + offset + JOURNAL_HEADER_LEN as u64, len)?;
        let stored = read_u64(&header[24..32]);
        let actual = entry_checksum(seq, len as u32, entry_epoch, &payload);
        if stored != actual {
            return Err(EngineError::ChecksumMismatch {
                location,
                expected: stored,
                actual,
            });
        }
        let body: Payload = bincode::deserialize(&payload).map_err(|e| EngineError::ReadError {
            location,
            reason: format!("bad journal payload: {e}"),
        })?;
        Ok(Some((
            JournalEntry {
                seq,
                btree: body.btree,
                records: body.records,
            },
            size,
        )))
    }

    /// Continues writing after a scan.
    pub fn set_position(&self, end_offset: u64, next_seq: u64, epoch: u32) {
        let mut inner = self.inner.lock();
        inner.write_offset = end_offset;
        inner.next_seq = next_seq;
        inner.epoch = epoch;
    }

    /// Starts over at the beginning of the region after a checkpoint has
    /// made every entry redundant. Sequences keep increasing.
    pub fn reset(&self, epoch: u32) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.reserved, 0, "journal reset with outstanding reservations");
        inner.write_offset = 0;
        inner.epoch = epoch;
        inner.stats.resets += 1;
    }

    /// Sequence the next entry will get.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Sequence of the last appended entry, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Bytes used or reserved.
    pub fn used(&self) -> u64 {
        let inner = self.inner.lock();
        inner.write_offset + inner.reserved
    }

    /// Counter snapshot.
    pub fn stats(&self) -> JournalStats {
        self.inner.lock().stats.clone()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("regions", &self.regions.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn read_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

fn entry_checksum(seq: u64, len: u32, epoch: u32, payload: &[u8]) -> u64 {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&epoch.to_le_bytes());
    buf.extend_from_slice(payload);
    checksum::compute(ChecksumAlgorithm::Xxh3, &buf).value
}

fn encode_entry(seq: u64, epoch: u32, payload: &[u8], padded: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(padded);
    out.extend_from_slice(&JOURNAL_MAGIC);
    out.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&epoch.to_le_bytes());
    out.extend_from_slice(&entry_checksum(seq, payload.len() as u32, epoch, payload).to_le_bytes());
    out.extend_from_slice(payload);
    out.resize(padded, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemDevice, Tier};
    use crate::fault::{ErrorAction, FaultClass};
    use crate::key::{Bpos, Value};

    const REGION: u64 = 64 * 1024;

    fn setup(ndev: usize) -> (Vec<Arc<MemDevice>>, Journal, Arc<FaultHandler>) {
        let mems: Vec<Arc<MemDevice>> = (0..ndev)
            .map(|i| Arc::new(MemDevice::new(format!("mem{i}"), 4 * REGION)))
            .collect();
        let regions = mems
            .iter()
            .enumerate()
            .map(|(i, m)| JournalRegion {
                dev: Arc::new(Device::new(i as u32, Tier::Fast, m.clone(), 65536, 3)),
                offset: REGION,
                len: REGION,
            })
            .collect();
        let faults = Arc::new(FaultHandler::new(ErrorAction::ReadOnly));
        (mems, Journal::new(regions, 4096, faults.clone()), faults)
    }

    fn payload(n: u64) -> Vec<u8> {
        let records = vec![Record::new(Bpos::new(n, 0), Value::Blob(vec![n as u8; 8]))];
        Journal::encode_payload(BtreeId::Xattrs, &records).unwrap()
    }

    fn append(j: &Journal, n: u64) -> u64 {
        let p = payload(n);
        let res = j.reserve(p.len()).unwrap();
        j.append(res, &p).unwrap()
    }

    #[test]
    fn test_append_and_scan() {
        let (_mems, j, _) = setup(2);
        assert_eq!(append(&j, 1), 1);
        assert_eq!(append(&j, 2), 2);
        assert_eq!(append(&j, 3), 3);

        let scan = j.scan(0, 0).unwrap();
        assert_eq!(scan.entries.len(), 3);
        assert_eq!(scan.entries[2].seq, 3);
        assert_eq!(scan.entries[1].records[0].pos, Bpos::new(2, 0));
        assert_eq!(scan.end_offset, 3 * 4096);
        assert!(scan.damage.is_none());

        let tail = j.scan(2, 0).unwrap();
        assert!(tail.entries.is_empty());
    }

    #[test]
    fn test_scan_after_checkpointed_prefix() {
        let (_mems, j, _) = setup(1);
        append(&j, 1);
        append(&j, 2);
        j.reset(1);
        assert_eq!(append(&j, 3), 3);
        // the old entries are invisible under the new epoch
        let scan = j.scan(2, 1).unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.entries[0].seq, 3);
        assert!(j.scan(0, 1).unwrap().entries.is_empty());
    }

    #[test]
    fn test_full_and_too_large() {
        let (_mems, j, _) = setup(1);
        let held: Vec<_> = (0..16).map(|_| j.reserve(10).unwrap()).collect();
        assert!(matches!(j.reserve(10), Err(EngineError::JournalFull { .. })));
        drop(held);
        assert_eq!(j.used(), 0);
        assert!(matches!(
            j.reserve(REGION as usize),
            Err(EngineError::JournalEntryTooLarge { .. })
        ));
        assert_eq!(j.stats().full_events, 1);
    }

    #[test]
    fn test_damaged_copy_uses_other_device() {
        let (mems, j, _) = setup(2);
        append(&j, 1);
        append(&j, 2);
        mems[0].corrupt(REGION + 4096 + JOURNAL_HEADER_LEN as u64, 4);
        let scan = j.scan(0, 0).unwrap();
        assert_eq!(scan.entries.len(), 2);
        assert!(scan.damage.is_none());
    }

    #[test]
    fn test_damaged_everywhere_truncates() {
        let (mems, j, _) = setup(1);
        append(&j, 1);
        append(&j, 2);
        append(&j, 3);
        mems[0].corrupt(REGION + 4096 + JOURNAL_HEADER_LEN as u64, 4);
        let scan = j.scan(0, 0).unwrap();
        assert_eq!(scan.entries.len(), 1);
        assert_eq!(
            scan.damage,
            Some(JournalDamage {
                offset: 4096,
                seq: 2
            })
        );
        assert_eq!(scan.end_offset, 4096);
    }

    #[test]
    fn test_write_failure_on_one_device_is_nonfatal() {
        let (mems, j, faults) = setup(2);
        mems[1].set_fail_writes(true);
        assert_eq!(append(&j, 1), 1);
        assert_eq!(faults.count(FaultClass::NonfatalIo), 1);
        assert!(!faults.is_read_only());

        mems[0].set_fail_writes(true);
        let p = payload(2);
        let res = j.reserve(p.len()).unwrap();
        assert!(matches!(j.append(res, &p), Err(EngineError::ReadOnly)));
        assert!(faults.is_read_only());
    }
}
