//! On-disk btree node format.
//!
//! A node is written once to a slot inside a bucket and never modified. The
//! encoding is a fixed 24-byte header followed by a bincode body:
//!
//! | offset | size | field                 |
//! |--------|------|-----------------------|
//! | 0      | 4    | magic `TNOD`          |
//! | 4      | 2    | format version        |
//! | 6      | 1    | checksum algorithm    |
//! | 7      | 1    | reserved              |
//! | 8      | 4    | body length           |
//! | 12     | 8    | body checksum         |
//! | 20     | 4    | reserved              |
//!
//! The body keeps the node's batches separate so that appending a batch does
//! not require re-sorting what is already on disk.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bset::{Bset, SortedNode};
use crate::checksum::{self, Checksum, ChecksumAlgorithm};
use crate::error::{EngineError, EngineResult};
use crate::key::{BtreeId, Bpos, Record};

/// Node magic.
pub const NODE_MAGIC: [u8; 4] = *b"TNOD";
/// Node format version.
pub const NODE_VERSION: u16 = 1;
/// Header length in bytes.
pub const NODE_HEADER_LEN: usize = 24;
/// Body bytes besides the records themselves: id, level, key range, seqs,
/// batch count.
const BODY_FIXED_LEN: usize = 4 + 1 + 20 + 20 + 8 + 8 + 8;
/// Per-batch length prefix.
const BSET_PREFIX_LEN: usize = 8;

/// Location of one replica inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketPtr {
    /// Device index.
    pub dev: u32,
    /// Bucket index on the device.
    pub bucket: u64,
    /// Byte offset within the bucket.
    pub offset: u32,
    /// Bucket generation when the space was allocated.
    pub gen: u32,
}

impl BucketPtr {
    /// Byte offset on the device.
    pub fn device_offset(&self, bucket_size: u32) -> u64 {
        self.bucket * u64::from(bucket_size) + u64::from(self.offset)
    }
}

impl fmt::Display for BucketPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}:{}+{} gen {}", self.dev, self.bucket, self.offset, self.gen)
    }
}

/// Parent-held pointer to a child node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePtr {
    /// Replicas of the node, on distinct devices.
    pub replicas: Vec<BucketPtr>,
    /// Sequence number the node must carry.
    pub seq: u64,
    /// Bytes reserved for the node in each bucket.
    pub len: u32,
}

impl NodePtr {
    /// Structural checks.
    pub fn validate(&self) -> Result<(), String> {
        if self.replicas.is_empty() {
            return Err("node pointer without replicas".to_string());
        }
        for (i, a) in self.replicas.iter().enumerate() {
            if self.replicas[i + 1..].iter().any(|b| b.dev == a.dev) {
                return Err(format!("node replicas share device {}", a.dev));
            }
        }
        if self.len == 0 {
            return Err("zero-length node pointer".to_string());
        }
        Ok(())
    }

    /// Identity of the node in the cache.
    pub fn key(&self) -> NodeKey {
        let primary = self.replicas.first().copied().unwrap_or(BucketPtr {
            dev: u32::MAX,
            bucket: 0,
            offset: 0,
            gen: 0,
        });
        NodeKey {
            dev: primary.dev,
            bucket: primary.bucket,
            offset: primary.offset,
            seq: self.seq,
        }
    }
}

/// Cache key: primary replica location plus node sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Device of the primary replica.
    pub dev: u32,
    /// Bucket of the primary replica.
    pub bucket: u64,
    /// Offset of the primary replica.
    pub offset: u32,
    /// Node sequence.
    pub seq: u64,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}:{}+{} seq {:#x}", self.dev, self.bucket, self.offset, self.seq)
    }
}

/// An immutable btree node.
#[derive(Debug, Clone)]
pub struct BtreeNode {
    /// Btree the node belongs to.
    pub btree_id: BtreeId,
    /// 0 for leaves.
    pub level: u8,
    /// Smallest key the node covers.
    pub min_key: Bpos,
    /// Largest key the node covers; the parent keys the node by it.
    pub max_key: Bpos,
    /// Random sequence identifying this node version.
    pub seq: u64,
    /// Journal entry this node write depends on.
    pub journal_seq: u64,
    /// Records.
    pub data: SortedNode,
}

#[derive(Serialize)]
struct NodeBodyRef<'a> {
    btree_id: BtreeId,
    level: u8,
    min_key: Bpos,
    max_key: Bpos,
    seq: u64,
    journal_seq: u64,
    bsets: Vec<&'a [Record]>,
}

#[derive(Deserialize)]
struct NodeBody {
    btree_id: BtreeId,
    level: u8,
    min_key: Bpos,
    max_key: Bpos,
    seq: u64,
    journal_seq: u64,
    bsets: Vec<Vec<Record>>,
}

/// Encoded size of a node holding `data`.
pub fn encoded_len_for(data: &SortedNode) -> usize {
    NODE_HEADER_LEN
        + BODY_FIXED_LEN
        + data
            .bsets()
            .iter()
            .map(|b| BSET_PREFIX_LEN + b.bytes())
            .sum::<usize>()
}

/// Encoded size of a single-batch node holding records totalling `bytes`.
pub fn encoded_len_single(bytes: usize) -> usize {
    NODE_HEADER_LEN + BODY_FIXED_LEN + BSET_PREFIX_LEN + bytes
}

impl BtreeNode {
    /// Empty leaf covering the whole key space.
    pub fn empty_root(btree_id: BtreeId, seq: u64) -> Self {
        Self {
            btree_id,
            level: 0,
            min_key: Bpos::MIN,
            max_key: Bpos::MAX,
            seq,
            journal_seq: 0,
            data: SortedNode::new(),
        }
    }

    /// Whether this is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        encoded_len_for(&self.data)
    }

    /// Serializes the node with a checksum over the body.
    pub fn encode(&self, algorithm: ChecksumAlgorithm) -> EngineResult<Vec<u8>> {
        let body = bincode::serialize(&NodeBodyRef {
            btree_id: self.btree_id,
            level: self.level,
            min_key: self.min_key,
            max_key: self.max_key,
            seq: self.seq,
            journal_seq: self.journal_seq,
            bsets: self.data.bsets().iter().map(|b| b.records()).collect(),
        })?;
        let csum = checksum::compute(algorithm, &body);

        let mut out = Vec::with_capacity(NODE_HEADER_LEN + body.len());
        out.extend_from_slice(&NODE_MAGIC);
        out.extend_from_slice(&NODE_VERSION.to_le_bytes());
        out.push(algorithm.code());
        out.push(0);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&csum.value.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses and verifies a node read from `location`.
    pub fn decode(bytes: &[u8], location: &str) -> EngineResult<BtreeNode> {
        let read_err = |reason: String| EngineError::ReadError {
            location: location.to_string(),
            reason,
        };

        if bytes.len() < NODE_HEADER_LEN {
            return Err(read_err(format!("short node read of {} bytes", bytes.len())));
        }
        if bytes[0..4] != NODE_MAGIC {
            return Err(read_err("bad node magic".to_string()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != NODE_VERSION {
            return Err(read_err(format!("unsupported node version {version}")));
        }
        let algorithm = ChecksumAlgorithm::from_code(bytes[6])
            .ok_or_else(|| read_err(format!("unknown checksum type {}", bytes[6])))?;
        let body_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut csum_bytes = [0u8; 8];
        csum_bytes.copy_from_slice(&bytes[12..20]);
        let expected = Checksum::new(algorithm, u64::from_le_bytes(csum_bytes));

        let body = bytes
            .get(NODE_HEADER_LEN..NODE_HEADER_LEN + body_len)
            .ok_or_else(|| read_err(format!("body length {body_len} exceeds read")))?;
        if !checksum::verify(&expected, body) {
            return Err(EngineError::ChecksumMismatch {
                location: location.to_string(),
                expected: expected.value,
                actual: checksum::compute(algorithm, body).value,
            });
        }

        let body: NodeBody =
            bincode::deserialize(body).map_err(|e| read_err(format!("bad node body: {e}")))?;
        if body.min_key > body.max_key {
            return Err(read_err(format!(
                "node range {}..={} is empty",
                body.min_key, body.max_key
            )));
        }
        let mut bsets = Vec::with_capacity(body.bsets.len());
        for records in body.bsets {
            let bset = Bset::from_sorted_checked(records)
                .map_err(|pos| read_err(format!("keys out of order at {pos}")))?;
            if let Some(r) = bset
                .records()
                .iter()
                .find(|r| r.pos < body.min_key || r.pos > body.max_key)
            {
                return Err(read_err(format!(
                    "key {} outside node range {}..={}",
                    r.pos, body.min_key, body.max_key
                )));
            }
            bsets.push(bset);
        }

        Ok(BtreeNode {
            btree_id: body.btree_id,
            level: body.level,
            min_key: body.min_key,
            max_key: body.max_key,
            seq: body.seq,
            journal_seq: body.journal_seq,
            data: SortedNode::from_bsets(bsets),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Value;

    fn sample() -> BtreeNode {
        let base = SortedNode::from_records(
            (1..=20)
                .map(|k| Record::new(Bpos::new(k, 0), Value::Blob(vec![k as u8; 8])))
                .collect(),
        );
        BtreeNode {
            btree_id: BtreeId::Inodes,
            level: 0,
            min_key: Bpos::MIN,
            max_key: Bpos::MAX,
            seq: 0xfeed,
            journal_seq: 7,
            data: base.with_batch(Bset::from_sorted(vec![Record::tombstone(Bpos::new(5, 0))])),
        }
    }

    #[test]
    fn test_encode_decode_keeps_batches() {
        let node = sample();
        let bytes = node.encode(ChecksumAlgorithm::Xxh3).unwrap();
        let back = BtreeNode::decode(&bytes, "test").unwrap();
        assert_eq!(back.seq, 0xfeed);
        assert_eq!(back.journal_seq, 7);
        assert_eq!(back.data.bset_count(), 2);
        assert_eq!(back.data.live_count(), 19);
        assert!(back.data.lookup(Bpos::new(5, 0)).is_none());
    }

    #[test]
    fn test_encoded_len_is_exact() {
        let node = sample();
        let bytes = node.encode(ChecksumAlgorithm::Crc32).unwrap();
        assert_eq!(bytes.len(), node.encoded_len());
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let node = sample();
        let mut bytes = node.encode(ChecksumAlgorithm::Xxh3).unwrap();
        bytes.resize(8192, 0);
        assert!(BtreeNode::decode(&bytes, "padded").is_ok());
    }

    #[test]
    fn test_corruption_is_checksum_mismatch() {
        let mut bytes = sample().encode(ChecksumAlgorithm::Xxh3).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        let err = BtreeNode::decode(&bytes, "dev0:5+0").unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_bad_magic_is_read_error() {
        let err = BtreeNode::decode(&[0u8; 64], "zeroes").unwrap_err();
        assert!(matches!(err, EngineError::ReadError { .. }));
    }

    #[test]
    fn test_node_ptr_validate() {
        let p = BucketPtr {
            dev: 0,
            bucket: 9,
            offset: 0,
            gen: 2,
        };
        let ok = NodePtr {
            replicas: vec![p, BucketPtr { dev: 1, ..p }],
            seq: 1,
            len: 4096,
        };
        assert!(ok.validate().is_ok());
        let dup = NodePtr {
            replicas: vec![p, p],
            seq: 1,
            len: 4096,
        };
        assert!(dup.validate().is_err());
        assert_eq!(ok.key().bucket, 9);
    }

    #[test]
    fn test_device_offset() {
        let p = BucketPtr {
            dev: 0,
            bucket: 3,
            offset: 512,
            gen: 0,
        };
        assert_eq!(p.device_offset(65536), 3 * 65536 + 512);
    }
}
