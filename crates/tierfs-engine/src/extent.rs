//! Extent and replica pointer model.
//!
//! An extent record in the extents btree is keyed at the end of the logical
//! range it covers and holds one pointer per replica. Every replica stores
//! the same bytes, so checksum, compression and nonce are shared.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::compress::CompressionType;
use crate::crypt::NONCE_LEN;
use crate::node::BucketPtr;

/// Most replicas a single extent may carry.
pub const MAX_EXTENT_REPLICAS: usize = 4;

/// A logical data range backed by one or more replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// One pointer per replica; the index is the replica number.
    pub ptrs: Vec<BucketPtr>,
    /// Logical length in bytes.
    pub len: u32,
    /// Stored length in bytes (after compression and encryption).
    pub stored_len: u32,
    /// Checksum of the stored bytes.
    pub csum: Checksum,
    /// Compression of the stored bytes.
    pub compression: CompressionType,
    /// Nonce if the extent is encrypted.
    pub nonce: Option<[u8; NONCE_LEN]>,
}

/// One replica of an extent, as seen by the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentPtr {
    /// Physical location.
    pub ptr: BucketPtr,
    /// Replica index within the extent.
    pub replica: u8,
    /// Stored length in bytes.
    pub len: u32,
    /// Checksum of the stored bytes.
    pub csum: Checksum,
    /// Compression of the stored bytes.
    pub compression: CompressionType,
}

impl Extent {
    /// Structural checks independent of the allocator state.
    pub fn validate(&self) -> Result<(), String> {
        if self.ptrs.is_empty() {
            return Err("extent without pointers".to_string());
        }
        if self.ptrs.len() > MAX_EXTENT_REPLICAS {
            return Err(format!(
                "extent with {} pointers exceeds {}",
                self.ptrs.len(),
                MAX_EXTENT_REPLICAS
            ));
        }
        let mut devs = HashSet::new();
        if !self.ptrs.iter().all(|p| devs.insert(p.dev)) {
            return Err("extent replicas share a device".to_string());
        }
        if self.len == 0 || self.stored_len == 0 {
            return Err("zero-length extent".to_string());
        }
        Ok(())
    }

    /// Logical start offset for an extent keyed at `end`.
    pub fn start(&self, end: u64) -> u64 {
        end.saturating_sub(u64::from(self.len))
    }

    /// Bytes the extent occupies in each bucket, rounded to `block_size`.
    pub fn alloc_bytes(&self, block_size: u32) -> u32 {
        self.stored_len.div_ceil(block_size) * block_size
    }

    /// Iterates over replicas in pointer order.
    pub fn replicas(&self) -> impl Iterator<Item = ExtentPtr> + '_ {
        self.ptrs.iter().enumerate().map(move |(i, ptr)| ExtentPtr {
            ptr: *ptr,
            replica: i as u8,
            len: self.stored_len,
            csum: self.csum,
            compression: self.compression,
        })
    }

    /// Whether any replica lives on `dev`.
    pub fn has_device(&self, dev: u32) -> bool {
        self.ptrs.iter().any(|p| p.dev == dev)
    }

    /// Copy of this extent without the replica on `dev`.
    pub fn without_device(&self, dev: u32) -> Extent {
        Extent {
            ptrs: self.ptrs.iter().copied().filter(|p| p.dev != dev).collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;

    fn ptr(dev: u32) -> BucketPtr {
        BucketPtr {
            dev,
            bucket: 3,
            offset: 4096,
            gen: 1,
        }
    }

    fn extent(devs: &[u32]) -> Extent {
        Extent {
            ptrs: devs.iter().map(|&d| ptr(d)).collect(),
            len: 8192,
            stored_len: 5000,
            csum: Checksum::new(ChecksumAlgorithm::Xxh3, 42),
            compression: CompressionType::Lz4,
            nonce: None,
        }
    }

    #[test]
    fn test_validate() {
        assert!(extent(&[0, 1]).validate().is_ok());
        assert!(extent(&[]).validate().is_err());
        assert!(extent(&[0, 0]).validate().is_err());
        assert!(extent(&[0, 1, 2, 3, 4]).validate().is_err());
    }

    #[test]
    fn test_start_and_alloc_bytes() {
        let e = extent(&[0]);
        assert_eq!(e.start(16384), 8192);
        assert_eq!(e.alloc_bytes(4096), 8192);
    }

    #[test]
    fn test_replicas_carry_index() {
        let e = extent(&[2, 5]);
        let reps: Vec<_> = e.replicas().collect();
        assert_eq!(reps.len(), 2);
        assert_eq!(reps[1].replica, 1);
        assert_eq!(reps[1].ptr.dev, 5);
        assert_eq!(reps[0].len, 5000);
    }

    #[test]
    fn test_without_device() {
        let e = extent(&[0, 1]).without_device(0);
        assert_eq!(e.ptrs.len(), 1);
        assert!(!e.has_device(0));
        assert!(e.has_device(1));
    }
}
