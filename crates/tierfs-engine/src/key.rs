//! Keys and records stored in btree nodes.
//!
//! A key is a [`Bpos`]: inode number, offset and snapshot, ordered
//! lexicographically. The value is a closed [`Value`] enum; the btree a record
//! lives in and the node level decide which variants are legal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::extent::Extent;
use crate::node::NodePtr;

/// Largest blob or xattr payload stored inline in a record.
pub const MAX_INLINE_BYTES: usize = 256;

/// Longest directory entry or xattr name.
pub const MAX_NAME_LEN: usize = 255;

/// Btree position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Bpos {
    /// Inode number.
    pub inode: u64,
    /// Offset within the inode; for extents, the end of the extent.
    pub offset: u64,
    /// Snapshot id.
    pub snapshot: u32,
}

impl Bpos {
    /// Smallest position.
    pub const MIN: Bpos = Bpos {
        inode: 0,
        offset: 0,
        snapshot: 0,
    };

    /// Largest position.
    pub const MAX: Bpos = Bpos {
        inode: u64::MAX,
        offset: u64::MAX,
        snapshot: u32::MAX,
    };

    /// Position in snapshot 0.
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self {
            inode,
            offset,
            snapshot: 0,
        }
    }

    /// Same position in another snapshot.
    pub const fn with_snapshot(self, snapshot: u32) -> Self {
        Self { snapshot, ..self }
    }

    /// Next position in key order, or `None` at [`Bpos::MAX`].
    pub fn successor(self) -> Option<Bpos> {
        if let Some(snapshot) = self.snapshot.checked_add(1) {
            return Some(Bpos { snapshot, ..self });
        }
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Bpos {
                inode: self.inode,
                offset,
                snapshot: 0,
            });
        }
        self.inode.checked_add(1).map(|inode| Bpos {
            inode,
            offset: 0,
            snapshot: 0,
        })
    }

    /// Previous position in key order, or `None` at [`Bpos::MIN`].
    pub fn predecessor(self) -> Option<Bpos> {
        if let Some(snapshot) = self.snapshot.checked_sub(1) {
            return Some(Bpos { snapshot, ..self });
        }
        if let Some(offset) = self.offset.checked_sub(1) {
            return Some(Bpos {
                inode: self.inode,
                offset,
                snapshot: u32::MAX,
            });
        }
        self.inode.checked_sub(1).map(|inode| Bpos {
            inode,
            offset: u64::MAX,
            snapshot: u32::MAX,
        })
    }
}

impl fmt::Display for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

/// Identifies one of the engine's btrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BtreeId {
    /// File data extents.
    Extents,
    /// Inodes.
    Inodes,
    /// Directory entries.
    Dirents,
    /// Extended attributes.
    Xattrs,
}

impl BtreeId {
    /// Every btree, in root-table order.
    pub const ALL: [BtreeId; 4] = [
        BtreeId::Extents,
        BtreeId::Inodes,
        BtreeId::Dirents,
        BtreeId::Xattrs,
    ];

    /// Index into per-btree tables.
    pub fn index(self) -> usize {
        match self {
            BtreeId::Extents => 0,
            BtreeId::Inodes => 1,
            BtreeId::Dirents => 2,
            BtreeId::Xattrs => 3,
        }
    }

    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            BtreeId::Extents => "extents",
            BtreeId::Inodes => "inodes",
            BtreeId::Dirents => "dirents",
            BtreeId::Xattrs => "xattrs",
        }
    }
}

impl fmt::Display for BtreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inode attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InodeValue {
    /// File type and permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Link count.
    pub nlink: u32,
    /// Modification time, nanoseconds since the epoch.
    pub mtime_ns: u64,
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirentValue {
    /// Inode the entry points at.
    pub target: u64,
    /// File type of the target.
    pub kind: u8,
    /// Entry name.
    pub name: String,
}

/// Extended attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrValue {
    /// Attribute name.
    pub name: String,
    /// Attribute value.
    pub value: Vec<u8>,
}

/// Record payload, one variant per record kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Tombstone hiding any older record at the same position.
    Deleted,
    /// Small opaque payload.
    Blob(Vec<u8>),
    /// Inode attributes.
    Inode(InodeValue),
    /// Directory entry.
    Dirent(DirentValue),
    /// Extended attribute.
    Xattr(XattrValue),
    /// File data extent.
    Extent(Extent),
    /// Pointer to a child node; interior nodes only.
    BtreePtr(NodePtr),
}

impl Value {
    /// Short name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Deleted => "deleted",
            Value::Blob(_) => "blob",
            Value::Inode(_) => "inode",
            Value::Dirent(_) => "dirent",
            Value::Xattr(_) => "xattr",
            Value::Extent(_) => "extent",
            Value::BtreePtr(_) => "btree_ptr",
        }
    }
}

/// A key-value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Position.
    pub pos: Bpos,
    /// Payload.
    pub value: Value,
}

impl Record {
    /// Creates a record.
    pub fn new(pos: Bpos, value: Value) -> Self {
        Self { pos, value }
    }

    /// Tombstone at `pos`.
    pub fn tombstone(pos: Bpos) -> Self {
        Self {
            pos,
            value: Value::Deleted,
        }
    }

    /// Whether this record hides an older one without carrying data.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, Value::Deleted)
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        // serializing an in-memory record cannot fail
        bincode::serialized_size(self).map_or(0, |n| n as usize)
    }
}

/// Checks that `rec` is legal in `btree` at node `level`.
pub fn validate(btree: BtreeId, level: u8, rec: &Record) -> Result<(), String> {
    if level > 0 {
        return match &rec.value {
            Value::BtreePtr(ptr) => ptr.validate(),
            other => Err(format!("{} record in interior node", other.kind())),
        };
    }

    match (&rec.value, btree) {
        (Value::Deleted, _) => Ok(()),
        (Value::BtreePtr(_), _) => Err("btree pointer in leaf node".to_string()),
        (Value::Blob(data), _) if data.len() > MAX_INLINE_BYTES => {
            Err(format!("blob of {} bytes exceeds {}", data.len(), MAX_INLINE_BYTES))
        }
        (Value::Blob(_), _) => Ok(()),
        (Value::Extent(e), BtreeId::Extents) => {
            if rec.pos.snapshot != 0 {
                return Err("extent in non-zero snapshot".to_string());
            }
            if u64::from(e.len) > rec.pos.offset {
                return Err(format!("extent of {} bytes ends at offset {}", e.len, rec.pos.offset));
            }
            e.validate()
        }
        (Value::Inode(_), BtreeId::Inodes) => {
            if rec.pos.offset != 0 {
                Err("inode record with non-zero offset".to_string())
            } else {
                Ok(())
            }
        }
        (Value::Dirent(d), BtreeId::Dirents) => validate_name(&d.name),
        (Value::Xattr(x), BtreeId::Xattrs) => {
            validate_name(&x.name)?;
            if x.value.len() > MAX_INLINE_BYTES {
                Err(format!("xattr value of {} bytes exceeds {}", x.value.len(), MAX_INLINE_BYTES))
            } else {
                Ok(())
            }
        }
        (value, btree) => Err(format!("{} record in {} btree", value.kind(), btree)),
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name of {} bytes exceeds {}", name.len(), MAX_NAME_LEN));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(format!("invalid character in name {name:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{Checksum, ChecksumAlgorithm};
    use crate::compress::CompressionType;
    use crate::node::BucketPtr;

    fn extent(len: u32, devs: &[u32]) -> Extent {
        Extent {
            ptrs: devs
                .iter()
                .map(|&dev| BucketPtr {
                    dev,
                    bucket: 10,
                    offset: 0,
                    gen: 0,
                })
                .collect(),
            len,
            stored_len: len,
            csum: Checksum {
                algorithm: ChecksumAlgorithm::None,
                value: 0,
            },
            compression: CompressionType::None,
            nonce: None,
        }
    }

    #[test]
    fn test_bpos_order() {
        let a = Bpos::new(1, 5);
        let b = Bpos::new(1, 6);
        let c = Bpos::new(2, 0);
        assert!(a < b && b < c);
        assert!(a < a.with_snapshot(1));
        assert!(Bpos::MIN < a && c < Bpos::MAX);
    }

    #[test]
    fn test_successor_predecessor() {
        let p = Bpos::new(3, 9);
        assert_eq!(p.successor().unwrap().predecessor().unwrap(), p);
        assert_eq!(Bpos::MAX.successor(), None);
        assert_eq!(Bpos::MIN.predecessor(), None);

        let end = Bpos {
            inode: 1,
            offset: u64::MAX,
            snapshot: u32::MAX,
        };
        assert_eq!(end.successor(), Some(Bpos::new(2, 0)));
        assert_eq!(Bpos::new(2, 0).predecessor(), Some(end));
    }

    #[test]
    fn test_display() {
        assert_eq!(Bpos::new(7, 8).with_snapshot(1).to_string(), "7:8:1");
        assert_eq!(BtreeId::Dirents.to_string(), "dirents");
    }

    #[test]
    fn test_validate_leaf_rejects_btree_ptr() {
        let rec = Record::new(
            Bpos::new(1, 0),
            Value::BtreePtr(NodePtr {
                replicas: vec![],
                seq: 1,
                len: 4096,
            }),
        );
        assert!(validate(BtreeId::Inodes, 0, &rec).is_err());
    }

    #[test]
    fn test_validate_interior_rejects_data() {
        let rec = Record::new(Bpos::new(1, 0), Value::Blob(vec![1]));
        assert!(validate(BtreeId::Inodes, 1, &rec).is_err());
    }

    #[test]
    fn test_validate_dirent_name() {
        let ok = Record::new(
            Bpos::new(1, 42),
            Value::Dirent(DirentValue {
                target: 2,
                kind: 1,
                name: "file.txt".to_string(),
            }),
        );
        assert!(validate(BtreeId::Dirents, 0, &ok).is_ok());

        let bad = Record::new(
            Bpos::new(1, 42),
            Value::Dirent(DirentValue {
                target: 2,
                kind: 1,
                name: "a/b".to_string(),
            }),
        );
        assert!(validate(BtreeId::Dirents, 0, &bad).is_err());
    }

    #[test]
    fn test_validate_wrong_btree() {
        let rec = Record::new(Bpos::new(1, 0), Value::Inode(InodeValue::default()));
        assert!(validate(BtreeId::Inodes, 0, &rec).is_ok());
        assert!(validate(BtreeId::Dirents, 0, &rec).is_err());
    }

    #[test]
    fn test_validate_extent() {
        let ok = Record::new(Bpos::new(5, 8192), Value::Extent(extent(4096, &[0, 1])));
        assert!(validate(BtreeId::Extents, 0, &ok).is_ok());

        let too_long = Record::new(Bpos::new(5, 100), Value::Extent(extent(4096, &[0])));
        assert!(validate(BtreeId::Extents, 0, &too_long).is_err());

        let same_dev = Record::new(Bpos::new(5, 8192), Value::Extent(extent(4096, &[1, 1])));
        assert!(validate(BtreeId::Extents, 0, &same_dev).is_err());
    }

    #[test]
    fn test_blob_size_limit() {
        let rec = Record::new(Bpos::new(1, 1), Value::Blob(vec![0; MAX_INLINE_BYTES + 1]));
        assert!(validate(BtreeId::Xattrs, 0, &rec).is_err());
    }

    #[test]
    fn test_encoded_len_tracks_payload() {
        let small = Record::new(Bpos::new(1, 1), Value::Blob(vec![0; 4]));
        let big = Record::new(Bpos::new(1, 1), Value::Blob(vec![0; 40]));
        assert_eq!(big.encoded_len() - small.encoded_len(), 36);
    }
}
