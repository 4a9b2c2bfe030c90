#![warn(missing_docs)]

//! tierfs storage engine: copy-on-write btrees over checksummed, tiered,
//! multi-device bucket storage.
//!
//! All filesystem state lives in btrees of keyed records. Nodes are written
//! once and replaced copy-on-write; every commit is logged to a journal
//! first so a crash loses nothing acknowledged. Space is handed out in
//! buckets whose generation numbers make stale pointers detectable, file
//! data is compressed, optionally encrypted and checksummed, and background
//! movers reclaim fragmented buckets and migrate data between tiers.

pub mod allocator;
pub mod background;
pub mod bset;
pub mod btree;
pub mod bucket;
pub mod checksum;
pub mod compress;
pub mod config;
pub mod crypt;
pub mod device;
pub mod engine;
pub mod error;
pub mod extent;
mod extent_io;
pub mod fault;
pub mod fsck;
pub mod gc;
pub mod journal;
pub mod key;
pub mod node;
pub mod node_cache;
pub mod recovery;
pub mod six;
pub mod superblock;
pub mod tiering;

pub use allocator::{AllocatorStats, DeviceUsage};
pub use background::{BackgroundConfig, BackgroundHandle, BackgroundStats, BackgroundTask};
pub use btree::{BtreeIter, CommitOptions, CommitResult, Mutation, NodeInfo, RewriteTarget};
pub use bucket::DataType;
pub use checksum::ChecksumAlgorithm;
pub use compress::CompressionAlgorithm;
pub use config::{BtreeConfig, DataConfig, EngineConfig, FormatOptions};
pub use crypt::{EncryptionKey, KeyProvider, NoKeyProvider, StaticKeyProvider};
pub use device::{BlockDevice, DeviceHealth, FileDevice, MemDevice, Tier};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, EngineResult};
pub use extent::Extent;
pub use fault::{ErrorAction, FaultClass, FaultHandler, Subsystem};
pub use fsck::{DeclinePrompt, FixPolicy, FixPrompt, FsckExit, FsckFinding, FsckReport};
pub use gc::{GcConfig, GcReport, MoveState};
pub use key::{Bpos, BtreeId, DirentValue, InodeValue, Record, Value, XattrValue};
pub use node::BucketPtr;
pub use recovery::{format, fsck};
pub use six::LockOrderTracker;
pub use superblock::Superblock;
pub use tiering::{TieringConfig, TieringReport};
