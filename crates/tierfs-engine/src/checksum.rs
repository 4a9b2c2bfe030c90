//! Checksums for nodes, journal entries and extents.
//!
//! The checksum always covers the bytes as stored on the device, i.e. after
//! compression and encryption.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC-32 (IEEE).
    Crc32,
    /// CRC-64 (ECMA-182).
    Crc64,
    /// XXH3 64-bit; the default for all structures.
    #[default]
    Xxh3,
    /// No checksum.
    None,
}

impl ChecksumAlgorithm {
    /// On-disk code used in node and journal headers.
    pub fn code(self) -> u8 {
        match self {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Crc32 => 1,
            ChecksumAlgorithm::Crc64 => 2,
            ChecksumAlgorithm::Xxh3 => 3,
        }
    }

    /// Inverse of [`Self::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChecksumAlgorithm::None),
            1 => Some(ChecksumAlgorithm::Crc32),
            2 => Some(ChecksumAlgorithm::Crc64),
            3 => Some(ChecksumAlgorithm::Xxh3),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Crc32 => write!(f, "crc32"),
            ChecksumAlgorithm::Crc64 => write!(f, "crc64"),
            ChecksumAlgorithm::Xxh3 => write!(f, "xxh3"),
            ChecksumAlgorithm::None => write!(f, "none"),
        }
    }
}

/// A computed checksum value with its algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    /// The algorithm used to compute this checksum.
    pub algorithm: ChecksumAlgorithm,
    /// The checksum value.
    pub value: u64,
}

impl Checksum {
    /// Creates a new checksum with the given algorithm and value.
    pub fn new(algorithm: ChecksumAlgorithm, value: u64) -> Self {
        Self { algorithm, value }
    }
}

/// Computes the checksum of `data`.
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Checksum {
    let value = match algorithm {
        ChecksumAlgorithm::Crc32 => u64::from(crc32fast::hash(data)),
        ChecksumAlgorithm::Crc64 => {
            let mut digest = crc64fast::Digest::new();
            digest.write(data);
            digest.sum64()
        }
        ChecksumAlgorithm::Xxh3 => xxhash_rust::xxh3::xxh3_64(data),
        ChecksumAlgorithm::None => 0,
    };
    trace!(algorithm = %algorithm, value, size = data.len(), "computed checksum");
    Checksum { algorithm, value }
}

/// Whether `data` matches `checksum`.
pub fn verify(checksum: &Checksum, data: &[u8]) -> bool {
    compute(checksum.algorithm, data).value == checksum.value
}
