//! Error types for the storage engine.
//!
//! Every variant maps onto one of the fault classes in [`crate::fault`], which
//! decides whether the engine keeps going, degrades a device, turns read-only
//! or halts.

use thiserror::Error;

use crate::fault::{FaultClass, Subsystem};
use crate::fsck::FsckExit;
use crate::key::Bpos;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Error variants for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O failure reported by a specific device.
    #[error("I/O error on device {device}: {source}")]
    Io {
        /// Index of the device that failed.
        device: u32,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Wraps standard I/O errors not tied to a device (config files, images).
    #[error("I/O error: {0}")]
    RawIo(#[from] std::io::Error),

    /// A structure could not be read from any replica.
    #[error("Read error at {location}: {reason}")]
    ReadError {
        /// Where the read was attempted.
        location: String,
        /// Description of the failure.
        reason: String,
    },

    /// Stored bytes do not match their recorded checksum.
    #[error("Checksum mismatch at {location}: expected {expected:#x}, actual {actual:#x}")]
    ChecksumMismatch {
        /// Where the mismatch was found.
        location: String,
        /// The recorded checksum.
        expected: u64,
        /// The checksum of the bytes read.
        actual: u64,
    },

    /// No tier/device combination can satisfy an allocation.
    #[error("Out of space: cannot allocate {bytes} bytes x{replicas} in {tier} tier")]
    OutOfSpace {
        /// Requested tier name.
        tier: String,
        /// Requested size per replica.
        bytes: u64,
        /// Requested replica count.
        replicas: u8,
    },

    /// A pointer's generation no longer matches its bucket.
    #[error("Stale pointer to device {device} bucket {bucket}: pointer gen {ptr_gen}, bucket gen {bucket_gen}")]
    StalePointer {
        /// Device index.
        device: u32,
        /// Bucket index on the device.
        bucket: u64,
        /// Generation embedded in the pointer.
        ptr_gen: u32,
        /// Current generation of the bucket.
        bucket_gen: u32,
    },

    /// On-disk data violates an invariant.
    #[error("Inconsistency in {subsystem}: {detail}")]
    Inconsistent {
        /// Subsystem that detected the problem.
        subsystem: Subsystem,
        /// Description of the violated invariant.
        detail: String,
    },

    /// The filesystem went read-only after a fatal fault.
    #[error("Filesystem is read-only")]
    ReadOnly,

    /// A record failed validation for its btree and level.
    #[error("Invalid record at {pos}: {reason}")]
    InvalidRecord {
        /// Position of the record.
        pos: Bpos,
        /// Why the record was rejected.
        reason: String,
    },

    /// A compare-and-swap precondition did not hold.
    #[error("Conflicting update at {pos}")]
    Conflict {
        /// Position whose current value differed.
        pos: Bpos,
    },

    /// A non-blocking lock attempt failed.
    #[error("Lock contended on {what}")]
    LockContended {
        /// Lock that could not be taken.
        what: String,
    },

    /// The journal region has no room until the next checkpoint.
    #[error("Journal full: {needed} bytes needed, {available} available")]
    JournalFull {
        /// Bytes the entry needs.
        needed: u64,
        /// Bytes left in the journal region.
        available: u64,
    },

    /// A single journal entry cannot fit the journal region.
    #[error("Journal entry too large: {size} bytes, max {max}")]
    JournalEntryTooLarge {
        /// Size of the entry.
        size: u64,
        /// Largest entry the journal accepts.
        max: u64,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },

    /// No valid superblock was found or it failed validation.
    #[error("Corrupted superblock: {reason}")]
    CorruptedSuperblock {
        /// Description of the corruption.
        reason: String,
    },

    /// The on-disk format version is not understood.
    #[error("Unknown on-disk version {version}")]
    UnknownVersion {
        /// Version found on disk.
        version: u32,
    },

    /// A device refused or failed an operation.
    #[error("Device error on {device}: {reason}")]
    DeviceError {
        /// Device index.
        device: u32,
        /// Description of the error.
        reason: String,
    },

    /// A device has been taken out of service.
    #[error("Device {device} has failed")]
    DeviceFailed {
        /// Device index.
        device: u32,
    },

    /// The key provider refused to unlock the filesystem.
    #[error("Key denied: {reason}")]
    KeyDenied {
        /// Why the key was refused.
        reason: String,
    },

    /// Encryption or decryption failed.
    #[error("Crypto error: {reason}")]
    Crypto {
        /// Description of the failure.
        reason: String,
    },

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression {
        /// Description of the failure.
        reason: String,
    },

    /// Configuration failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// A background operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// An fsck pass stopped on a fault it was not allowed to skip.
    #[error("Fsck halted: {0}")]
    FsckHalted(FsckExit),
}

impl EngineError {
    /// Fault class this error belongs to, if it is a fault at all.
    ///
    /// Resource conditions (out of space, contention, conflicts) are not
    /// faults and return `None`.
    pub fn fault_class(&self) -> Option<FaultClass> {
        match self {
            EngineError::Io { .. }
            | EngineError::RawIo(_)
            | EngineError::ReadError { .. }
            | EngineError::DeviceError { .. } => Some(FaultClass::NonfatalIo),
            EngineError::DeviceFailed { .. } | EngineError::ReadOnly => Some(FaultClass::FatalIo),
            EngineError::ChecksumMismatch { .. }
            | EngineError::StalePointer { .. }
            | EngineError::Inconsistent { .. }
            | EngineError::InvalidRecord { .. }
            | EngineError::CorruptedSuperblock { .. }
            | EngineError::UnknownVersion { .. } => Some(FaultClass::Inconsistency),
            EngineError::FsckHalted(_) => Some(FaultClass::FsckFixable),
            EngineError::OutOfSpace { .. }
            | EngineError::Conflict { .. }
            | EngineError::LockContended { .. }
            | EngineError::JournalFull { .. }
            | EngineError::JournalEntryTooLarge { .. }
            | EngineError::SerializationError { .. }
            | EngineError::KeyDenied { .. }
            | EngineError::Crypto { .. }
            | EngineError::Compression { .. }
            | EngineError::InvalidConfig { .. }
            | EngineError::Cancelled => None,
        }
    }

    /// True for contention-style errors a background mover should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockContended { .. } | EngineError::Conflict { .. }
        )
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::InvalidConfig {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_result_alias() {
        let ok: EngineResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: EngineResult<i32> = Err(EngineError::Cancelled);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "image missing");
        let err: EngineError = std_err.into();
        assert!(matches!(err, EngineError::RawIo(_)));
        assert_eq!(err.fault_class(), Some(FaultClass::NonfatalIo));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = EngineError::ChecksumMismatch {
            location: "dev0:12+4096".to_string(),
            expected: 0xabc,
            actual: 0xdef,
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch at dev0:12+4096: expected 0xabc, actual 0xdef"
        );
        assert_eq!(err.fault_class(), Some(FaultClass::Inconsistency));
    }

    #[test]
    fn test_stale_pointer_display() {
        let err = EngineError::StalePointer {
            device: 1,
            bucket: 7,
            ptr_gen: 2,
            bucket_gen: 3,
        };
        assert!(err.to_string().contains("pointer gen 2, bucket gen 3"));
    }

    #[test]
    fn test_out_of_space_is_not_a_fault() {
        let err = EngineError::OutOfSpace {
            tier: "fast".to_string(),
            bytes: 4096,
            replicas: 2,
        };
        assert_eq!(err.fault_class(), None);
        assert!(err.to_string().contains("fast tier"));
    }

    #[test]
    fn test_fatal_classes() {
        assert_eq!(EngineError::ReadOnly.fault_class(), Some(FaultClass::FatalIo));
        assert_eq!(
            EngineError::DeviceFailed { device: 0 }.fault_class(),
            Some(FaultClass::FatalIo)
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EngineError::LockContended {
            what: "root".to_string()
        }
        .is_retryable());
        assert!(EngineError::Conflict { pos: Bpos::new(1, 2) }.is_retryable());
        assert!(!EngineError::ReadOnly.is_retryable());
    }

    #[test]
    fn test_fsck_halted_display() {
        let err = EngineError::FsckHalted(FsckExit::ErrorsNotFixed);
        assert_eq!(err.to_string(), "Fsck halted: errors not fixed (exit 1)");
    }
}
