//! Buckets, generation tables and the per-device region layout.
//!
//! Every device is divided into fixed-size buckets:
//!
//! | buckets                         | content                           |
//! |---------------------------------|-----------------------------------|
//! | 0                               | superblock                        |
//! | 1 ..= journal_buckets           | journal                           |
//! | next 2 x gens_buckets           | two alternating generation tables |
//! | remainder                       | btree nodes and extent data       |

use serde::{Deserialize, Serialize};

use crate::checksum::{self, ChecksumAlgorithm};
use crate::error::{EngineError, EngineResult};

/// Generation table magic.
pub const GENS_MAGIC: [u8; 4] = *b"TGEN";
/// Generation table header length: magic, entry count, write sequence,
/// checksum.
pub const GENS_HEADER_LEN: usize = 4 + 4 + 8 + 8;

/// What a bucket holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    /// Unused.
    #[default]
    Free,
    /// Superblock region.
    Superblock,
    /// Journal region.
    Journal,
    /// Generation tables.
    Gens,
    /// Btree nodes.
    Btree,
    /// Extent data.
    User,
}

impl DataType {
    /// Whether the bucket belongs to a fixed metadata region.
    pub fn is_reserved(self) -> bool {
        matches!(self, DataType::Superblock | DataType::Journal | DataType::Gens)
    }
}

/// In-memory state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bucket {
    /// Reuse generation; pointers carry the generation they were made under.
    pub gen: u32,
    /// Content type.
    pub data_type: DataType,
    /// Bytes still referenced.
    pub live_bytes: u32,
    /// Bytes handed out since the bucket was opened.
    pub fill: u32,
    /// Excluded from new allocations while the reclaimer works on it.
    pub needs_gc: bool,
}

impl Bucket {
    /// Whether the bucket can be handed out.
    pub fn is_free(&self) -> bool {
        self.data_type == DataType::Free
    }

    /// Live bytes as a fraction of `bucket_size`.
    pub fn live_fraction(&self, bucket_size: u32) -> f64 {
        f64::from(self.live_bytes) / f64::from(bucket_size)
    }
}

/// Region layout of one device, fixed at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLayout {
    /// Bucket size in bytes.
    pub bucket_size: u32,
    /// Total buckets.
    pub nbuckets: u64,
    /// First journal bucket.
    pub journal_start: u64,
    /// Journal buckets.
    pub journal_buckets: u64,
    /// First bucket of generation slot 0.
    pub gens_start: u64,
    /// Buckets per generation slot.
    pub gens_buckets: u64,
    /// First bucket available to the allocator.
    pub first_data_bucket: u64,
}

impl DeviceLayout {
    /// Computes the layout of a device with `nbuckets` buckets.
    pub fn new(nbuckets: u64, bucket_size: u32, journal_buckets: u64) -> EngineResult<Self> {
        let table_bytes = GENS_HEADER_LEN as u64 + 4 * nbuckets;
        let gens_buckets = table_bytes.div_ceil(u64::from(bucket_size));
        let journal_start = 1;
        let gens_start = journal_start + journal_buckets;
        let first_data_bucket = gens_start + 2 * gens_buckets;
        if journal_buckets == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "journal needs at least one bucket".to_string(),
            });
        }
        if first_data_bucket + 2 > nbuckets {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "device of {nbuckets} buckets has no room for data after {first_data_bucket} metadata buckets"
                ),
            });
        }
        Ok(Self {
            bucket_size,
            nbuckets,
            journal_start,
            journal_buckets,
            gens_start,
            gens_buckets,
            first_data_bucket,
        })
    }

    /// Byte offset of bucket `b`.
    pub fn bucket_offset(&self, b: u64) -> u64 {
        b * u64::from(self.bucket_size)
    }

    /// Byte offset and length of the journal region.
    pub fn journal_region(&self) -> (u64, u64) {
        (
            self.bucket_offset(self.journal_start),
            self.journal_buckets * u64::from(self.bucket_size),
        )
    }

    /// Byte offset and length of generation slot `slot` (0 or 1).
    pub fn gens_slot(&self, slot: u64) -> (u64, u64) {
        let start = self.gens_start + (slot % 2) * self.gens_buckets;
        (
            self.bucket_offset(start),
            self.gens_buckets * u64::from(self.bucket_size),
        )
    }

    /// Type of the fixed region holding bucket `b`, if any.
    pub fn reserved_type(&self, b: u64) -> Option<DataType> {
        if b == 0 {
            Some(DataType::Superblock)
        } else if b < self.gens_start {
            Some(DataType::Journal)
        } else if b < self.first_data_bucket {
            Some(DataType::Gens)
        } else {
            None
        }
    }

    /// Buckets available to the allocator.
    pub fn data_buckets(&self) -> u64 {
        self.nbuckets - self.first_data_bucket
    }
}

/// Serializes a generation table.
pub fn encode_gens(gens: &[u32], write_seq: u64) -> Vec<u8> {
    let mut body = Vec::with_capacity(gens.len() * 4);
    for g in gens {
        body.extend_from_slice(&g.to_le_bytes());
    }
    let mut seed = write_seq.to_le_bytes().to_vec();
    seed.extend_from_slice(&body);
    let csum = checksum::compute(ChecksumAlgorithm::Xxh3, &seed);

    let mut out = Vec::with_capacity(GENS_HEADER_LEN + body.len());
    out.extend_from_slice(&GENS_MAGIC);
    out.extend_from_slice(&(gens.len() as u32).to_le_bytes());
    out.extend_from_slice(&write_seq.to_le_bytes());
    out.extend_from_slice(&csum.value.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Parses a generation table written under `write_seq`.
pub fn decode_gens(bytes: &[u8], write_seq: u64, location: &str) -> EngineResult<Vec<u32>> {
    let read_err = |reason: String| EngineError::ReadError {
        location: location.to_string(),
        reason,
    };
    if bytes.len() < GENS_HEADER_LEN || bytes[0..4] != GENS_MAGIC {
        return Err(read_err("bad generation table magic".to_string()));
    }
    let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&bytes[8..16]);
    let seq = u64::from_le_bytes(seq);
    if seq != write_seq {
        return Err(read_err(format!(
            "generation table from write {seq}, expected {write_seq}"
        )));
    }
    let mut stored = [0u8; 8];
    stored.copy_from_slice(&bytes[16..24]);
    let stored = u64::from_le_bytes(stored);

    let body = bytes
        .get(GENS_HEADER_LEN..GENS_HEADER_LEN + count * 4)
        .ok_or_else(|| read_err(format!("generation table of {count} entries is truncated")))?;
    let mut seed = seq.to_le_bytes().to_vec();
    seed.extend_from_slice(body);
    let actual = checksum::compute(ChecksumAlgorithm::Xxh3, &seed);
    if actual.value != stored {
        return Err(EngineError::ChecksumMismatch {
            location: location.to_string(),
            expected: stored,
            actual: actual.value,
        });
    }
    Ok(body
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_regions() {
        let l = DeviceLayout::new(64, 65536, 4).unwrap();
        assert_eq!(l.journal_start, 1);
        assert_eq!(l.gens_start, 5);
        assert_eq!(l.gens_buckets, 1);
        assert_eq!(l.first_data_bucket, 7);
        assert_eq!(l.data_buckets(), 57);
        assert_eq!(l.journal_region(), (65536, 4 * 65536));
        assert_eq!(l.gens_slot(1).0, 6 * 65536);
        assert_eq!(l.gens_slot(2), l.gens_slot(0));
        assert_eq!(l.reserved_type(0), Some(DataType::Superblock));
        assert_eq!(l.reserved_type(4), Some(DataType::Journal));
        assert_eq!(l.reserved_type(6), Some(DataType::Gens));
        assert_eq!(l.reserved_type(7), None);
    }

    #[test]
    fn test_layout_rejects_tiny_device() {
        assert!(DeviceLayout::new(6, 65536, 4).is_err());
        assert!(DeviceLayout::new(64, 65536, 0).is_err());
    }

    #[test]
    fn test_gens_table() {
        let gens = vec![0, 3, 7, u32::MAX];
        let bytes = encode_gens(&gens, 12);
        assert_eq!(decode_gens(&bytes, 12, "t").unwrap(), gens);
        assert!(matches!(
            decode_gens(&bytes, 13, "t"),
            Err(EngineError::ReadError { .. })
        ));

        let mut bad = bytes.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(matches!(
            decode_gens(&bad, 12, "t"),
            Err(EngineError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_live_fraction() {
        let b = Bucket {
            live_bytes: 16384,
            data_type: DataType::User,
            ..Bucket::default()
        };
        assert!((b.live_fraction(65536) - 0.25).abs() < f64::EPSILON);
        assert!(!b.is_free());
        assert!(DataType::Journal.is_reserved());
        assert!(!DataType::Btree.is_reserved());
    }
}
