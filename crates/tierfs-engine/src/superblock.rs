//! Superblock: filesystem identity, device descriptors and btree roots.
//!
//! A copy lives at the start of every device. The header is fixed:
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic `TFS!`     |
//! | 4      | 4    | format version   |
//! | 8      | 4    | body length      |
//! | 12     | 4    | reserved         |
//! | 16     | 8    | xxh3 of the body |
//!
//! The version is checked before the body is decoded so that a newer
//! format is reported as such instead of as corruption.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bucket::DeviceLayout;
use crate::checksum::{self, ChecksumAlgorithm};
use crate::device::{Device, Tier};
use crate::error::{EngineError, EngineResult};
use crate::key::BtreeId;
use crate::node::NodePtr;

/// Superblock magic.
pub const SB_MAGIC: [u8; 4] = *b"TFS!";
/// Current format version.
pub const SB_VERSION: u32 = 1;
/// Header length in bytes.
pub const SB_HEADER_LEN: usize = 24;
/// Largest encoded superblock.
pub const SB_MAX_LEN: usize = 16384;

/// Extent payloads are encrypted.
pub const FEATURE_ENCRYPTION: u64 = 1 << 0;
/// Extents may carry more than one replica.
pub const FEATURE_REPLICATION: u64 = 1 << 1;
/// Feature bits this build understands.
pub const KNOWN_FEATURES: u64 = FEATURE_ENCRYPTION | FEATURE_REPLICATION;

/// One member device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Index within the filesystem.
    pub idx: u32,
    /// Device identity.
    pub uuid: Uuid,
    /// Tier assignment.
    pub tier: Tier,
    /// Region layout.
    pub layout: DeviceLayout,
}

/// Persisted root of one btree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeRootPtr {
    /// Which btree.
    pub btree: BtreeId,
    /// Level of the root node.
    pub level: u8,
    /// Where the root lives.
    pub ptr: NodePtr,
}

/// The superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    /// Filesystem identity.
    pub uuid: Uuid,
    /// Human-readable label.
    pub label: String,
    /// I/O granularity.
    pub block_size: u32,
    /// Allocation unit.
    pub bucket_size: u32,
    /// Bytes reserved per btree node.
    pub node_size: u32,
    /// Feature bits.
    pub features: u64,
    /// Cleanly unmounted.
    pub clean: bool,
    /// Inconsistencies were seen and not repaired.
    pub errors: bool,
    /// A repair pass fixed problems.
    pub fsck_fixed: bool,
    /// Incremented at every checkpoint; selects the newest copy and the
    /// generation table slot.
    pub write_seq: u64,
    /// Last journal sequence reflected in `roots`.
    pub journal_seq: u64,
    /// Root of every btree.
    pub roots: Vec<BtreeRootPtr>,
    /// Replicas per btree node.
    pub metadata_replicas: u8,
    /// Replicas per extent.
    pub data_replicas: u8,
    /// Encryption key check, if encrypted.
    pub key_check: Option<[u8; 32]>,
    /// Member devices, by index.
    pub devices: Vec<DeviceDescriptor>,
    /// Number of mounts.
    pub mount_count: u64,
    /// Creation time, seconds since the epoch.
    pub created_at_secs: u64,
    /// Last checkpoint time, seconds since the epoch.
    pub updated_at_secs: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Superblock {
    /// Fresh superblock for a filesystem being formatted.
    pub fn new(label: &str, block_size: u32, bucket_size: u32, node_size: u32) -> Self {
        let now = now_secs();
        Self {
            uuid: Uuid::new_v4(),
            label: label.to_string(),
            block_size,
            bucket_size,
            node_size,
            features: 0,
            clean: true,
            errors: false,
            fsck_fixed: false,
            write_seq: 0,
            journal_seq: 0,
            roots: Vec::new(),
            metadata_replicas: 1,
            data_replicas: 1,
            key_check: None,
            devices: Vec::new(),
            mount_count: 0,
            created_at_secs: now,
            updated_at_secs: now,
        }
    }

    /// Root of `btree`, if recorded.
    pub fn root(&self, btree: BtreeId) -> Option<&BtreeRootPtr> {
        self.roots.iter().find(|r| r.btree == btree)
    }

    /// Feature bits this build does not know.
    pub fn unknown_features(&self) -> u64 {
        self.features & !KNOWN_FEATURES
    }

    /// Stamps the update time.
    pub fn touch(&mut self) {
        self.updated_at_secs = now_secs();
    }

    /// Serializes the superblock.
    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        let body = bincode::serialize(self)?;
        if SB_HEADER_LEN + body.len() > SB_MAX_LEN {
            return Err(EngineError::CorruptedSuperblock {
                reason: format!("superblock of {} bytes exceeds {SB_MAX_LEN}", body.len()),
            });
        }
        let csum = checksum::compute(ChecksumAlgorithm::Xxh3, &body);
        let mut out = Vec::with_capacity(SB_HEADER_LEN + body.len());
        out.extend_from_slice(&SB_MAGIC);
        out.extend_from_slice(&SB_VERSION.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&csum.value.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses the fixed header, returning the body length.
    pub fn decode_header(header: &[u8]) -> EngineResult<usize> {
        if header.len() < SB_HEADER_LEN || header[0..4] != SB_MAGIC {
            return Err(EngineError::CorruptedSuperblock {
                reason: "bad superblock magic".to_string(),
            });
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != SB_VERSION {
            return Err(EngineError::UnknownVersion { version });
        }
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if SB_HEADER_LEN + len > SB_MAX_LEN {
            return Err(EngineError::CorruptedSuperblock {
                reason: format!("superblock body length {len} too large"),
            });
        }
        Ok(len)
    }

    /// Parses a full superblock.
    pub fn decode(bytes: &[u8]) -> EngineResult<Superblock> {
        let len = Self::decode_header(bytes)?;
        let body = bytes
            .get(SB_HEADER_LEN..SB_HEADER_LEN + len)
            .ok_or_else(|| EngineError::CorruptedSuperblock {
                reason: "truncated superblock".to_string(),
            })?;
        let mut stored = [0u8; 8];
        stored.copy_from_slice(&bytes[16..24]);
        let stored = u64::from_le_bytes(stored);
        let actual = checksum::compute(ChecksumAlgorithm::Xxh3, body);
        if actual.value != stored {
            return Err(EngineError::CorruptedSuperblock {
                reason: format!(
                    "superblock checksum mismatch: expected {stored:#x}, got {:#x}",
                    actual.value
                ),
            });
        }
        bincode::deserialize(body).map_err(|e| EngineError::CorruptedSuperblock {
            reason: format!("bad superblock body: {e}"),
        })
    }

    /// Writes this superblock to the start of `dev`.
    pub fn write_to(&self, dev: &Device) -> EngineResult<()> {
        dev.write(0, &self.encode()?)
    }

    /// Reads the superblock copy on `dev`.
    pub fn read_from(dev: &Device) -> EngineResult<Superblock> {
        let header = dev.read(0, SB_HEADER_LEN)?;
        let len = Self::decode_header(&header)?;
        let bytes = dev.read(0, SB_HEADER_LEN + len)?;
        Self::decode(&bytes)
    }
}

/// Picks the newest valid superblock among per-device read results. A copy
/// of an unknown version wins over everything, since a newer format may
/// have been written after the others.
pub fn pick_newest(copies: Vec<EngineResult<Superblock>>) -> EngineResult<Superblock> {
    let mut best: Option<Superblock> = None;
    let mut last_err = None;
    for (idx, copy) in copies.into_iter().enumerate() {
        match copy {
            Ok(sb) => {
                if best.as_ref().is_none_or(|b| sb.write_seq > b.write_seq) {
                    best = Some(sb);
                }
            }
            Err(EngineError::UnknownVersion { version }) => {
                return Err(EngineError::UnknownVersion { version });
            }
            Err(e) => {
                warn!(device = idx, error = %e, "skipping unreadable superblock");
                last_err = Some(e);
            }
        }
    }
    match best {
        Some(sb) => {
            debug!(uuid = %sb.uuid, write_seq = sb.write_seq, "selected superblock");
            Ok(sb)
        }
        None => Err(last_err.unwrap_or_else(|| EngineError::CorruptedSuperblock {
            reason: "no devices".to_string(),
        })),
    }
}
