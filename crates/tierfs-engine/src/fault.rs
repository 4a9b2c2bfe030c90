//! Fault classification and the runtime repair-or-halt policy.
//!
//! Every detected fault falls into one of four classes. Logic faults halt the
//! process, inconsistencies mark the filesystem as containing errors,
//! fatal I/O turns the filesystem read-only and nonfatal I/O degrades a
//! single device. Fsck-time faults are handled by [`crate::fsck`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{EngineError, EngineResult};

/// Fault classes, each with its own handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultClass {
    /// Running code violated an internal invariant.
    Logic,
    /// On-disk data violates an invariant.
    Inconsistency,
    /// A device can no longer accept writes.
    FatalIo,
    /// A single I/O failed on a device that still has healthy replicas.
    NonfatalIo,
    /// An inconsistency found by fsck, subject to the fix policy.
    FsckFixable,
}

impl FaultClass {
    /// All classes, in counter order.
    pub const ALL: [FaultClass; 5] = [
        FaultClass::Logic,
        FaultClass::Inconsistency,
        FaultClass::FatalIo,
        FaultClass::NonfatalIo,
        FaultClass::FsckFixable,
    ];

    fn index(self) -> usize {
        match self {
            FaultClass::Logic => 0,
            FaultClass::Inconsistency => 1,
            FaultClass::FatalIo => 2,
            FaultClass::NonfatalIo => 3,
            FaultClass::FsckFixable => 4,
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultClass::Logic => "logic fault",
            FaultClass::Inconsistency => "inconsistency",
            FaultClass::FatalIo => "fatal I/O",
            FaultClass::NonfatalIo => "nonfatal I/O",
            FaultClass::FsckFixable => "fsck-fixable",
        };
        f.write_str(s)
    }
}

/// Engine subsystem a fault was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    /// Btree structure and records.
    Btree,
    /// Node cache and node I/O.
    NodeCache,
    /// Journal region.
    Journal,
    /// Bucket allocator.
    Allocator,
    /// Extent read/write pipeline.
    Extent,
    /// Superblock.
    Superblock,
    /// Block device.
    Device,
    /// Moving garbage collector.
    Gc,
    /// Tiering mover.
    Tiering,
    /// Mount-time recovery.
    Recovery,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Subsystem::Btree => "btree",
            Subsystem::NodeCache => "node cache",
            Subsystem::Journal => "journal",
            Subsystem::Allocator => "allocator",
            Subsystem::Extent => "extent",
            Subsystem::Superblock => "superblock",
            Subsystem::Device => "device",
            Subsystem::Gc => "gc",
            Subsystem::Tiering => "tiering",
            Subsystem::Recovery => "recovery",
        };
        f.write_str(s)
    }
}

/// What was done about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultDecision {
    /// Logged and the operation continued.
    Continued,
    /// The operation was failed back to the caller.
    Failed,
    /// The filesystem went read-only.
    ReadOnly,
    /// A device was marked degraded.
    Degraded,
    /// Fsck repaired the problem.
    Fixed,
    /// Fsck left the problem in place.
    NotFixed,
}

/// One observed fault. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Fault class.
    pub class: FaultClass,
    /// Where it was detected.
    pub subsystem: Subsystem,
    /// Device involved, if any.
    pub device: Option<u32>,
    /// Human-readable description.
    pub detail: String,
    /// What the engine did.
    pub decision: FaultDecision,
}

/// What an inconsistency does at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorAction {
    /// Mark the filesystem as containing errors and keep going.
    Continue,
    /// Mark errors and go read-only.
    #[default]
    #[serde(rename = "ro")]
    ReadOnly,
    /// Halt.
    Panic,
}

const MAX_RECENT_FAULTS: usize = 64;

/// Per-mount fault bookkeeping.
pub struct FaultHandler {
    action: ErrorAction,
    read_only: AtomicBool,
    errors: AtomicBool,
    fsck_fixed: AtomicBool,
    counts: [AtomicU64; 5],
    recent: Mutex<VecDeque<FaultRecord>>,
}

impl FaultHandler {
    /// Creates a handler applying `action` to runtime inconsistencies.
    pub fn new(action: ErrorAction) -> Self {
        Self {
            action,
            read_only: AtomicBool::new(false),
            errors: AtomicBool::new(false),
            fsck_fixed: AtomicBool::new(false),
            counts: Default::default(),
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT_FAULTS)),
        }
    }

    /// Configured inconsistency action.
    pub fn action(&self) -> ErrorAction {
        self.action
    }

    fn record(&self, rec: FaultRecord) {
        self.counts[rec.class.index()].fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent.lock();
        if recent.len() == MAX_RECENT_FAULTS {
            recent.pop_front();
        }
        recent.push_back(rec);
    }

    /// Logic fault: logs and halts. Never returns.
    pub fn bug(&self, subsystem: Subsystem, detail: impl Into<String>) -> ! {
        let detail = detail.into();
        error!(%subsystem, %detail, "internal invariant violated, halting");
        self.record(FaultRecord {
            class: FaultClass::Logic,
            subsystem,
            device: None,
            detail: detail.clone(),
            decision: FaultDecision::Failed,
        });
        panic!("{subsystem}: {detail}");
    }

    /// On-disk inconsistency. Marks the filesystem as containing errors and
    /// applies the configured action; returns the error for the caller to
    /// propagate or tolerate.
    pub fn inconsistent(&self, subsystem: Subsystem, detail: impl Into<String>) -> EngineError {
        let detail = detail.into();
        self.errors.store(true, Ordering::Release);
        let decision = match self.action {
            ErrorAction::Continue => FaultDecision::Continued,
            ErrorAction::ReadOnly => {
                self.read_only.store(true, Ordering::Release);
                FaultDecision::ReadOnly
            }
            ErrorAction::Panic => {
                self.bug(subsystem, format!("inconsistency with errors=panic: {detail}"))
            }
        };
        error!(%subsystem, %detail, ?decision, "filesystem inconsistency");
        self.record(FaultRecord {
            class: FaultClass::Inconsistency,
            subsystem,
            device: None,
            detail: detail.clone(),
            decision,
        });
        EngineError::Inconsistent { subsystem, detail }
    }

    /// Converts an error already classified as an inconsistency.
    pub fn inconsistent_err(&self, subsystem: Subsystem, err: &EngineError) -> EngineError {
        self.inconsistent(subsystem, err.to_string())
    }

    /// Fatal I/O: the filesystem goes read-only.
    pub fn fatal_io(
        &self,
        subsystem: Subsystem,
        device: Option<u32>,
        detail: impl Into<String>,
    ) -> EngineError {
        let detail = detail.into();
        let was_ro = self.read_only.swap(true, Ordering::AcqRel);
        if !was_ro {
            error!(%subsystem, ?device, %detail, "fatal I/O error, going read-only");
        }
        self.record(FaultRecord {
            class: FaultClass::FatalIo,
            subsystem,
            device,
            detail,
            decision: FaultDecision::ReadOnly,
        });
        EngineError::ReadOnly
    }

    /// Nonfatal I/O on one device; recovered locally.
    pub fn nonfatal_io(&self, subsystem: Subsystem, device: u32, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(%subsystem, device, %detail, "I/O error, device degraded");
        self.record(FaultRecord {
            class: FaultClass::NonfatalIo,
            subsystem,
            device: Some(device),
            detail,
            decision: FaultDecision::Degraded,
        });
    }

    /// Records an fsck finding and its outcome.
    pub fn fsck_finding(&self, subsystem: Subsystem, detail: impl Into<String>, fixed: bool) {
        if fixed {
            self.fsck_fixed.store(true, Ordering::Release);
        } else {
            self.errors.store(true, Ordering::Release);
        }
        self.record(FaultRecord {
            class: FaultClass::FsckFixable,
            subsystem,
            device: None,
            detail: detail.into(),
            decision: if fixed {
                FaultDecision::Fixed
            } else {
                FaultDecision::NotFixed
            },
        });
    }

    /// Fails mutating operations once the filesystem is read-only.
    pub fn check_writable(&self) -> EngineResult<()> {
        if self.read_only.load(Ordering::Acquire) {
            Err(EngineError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Forces the read-only state, e.g. for a read-only mount.
    pub fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    /// Whether mutations are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Whether the filesystem is known to contain errors.
    pub fn has_errors(&self) -> bool {
        self.errors.load(Ordering::Acquire)
    }

    /// Restores the persisted error flag at mount.
    pub fn set_errors(&self, errors: bool) {
        self.errors.store(errors, Ordering::Release);
    }

    /// Whether fsck repaired anything during this mount.
    pub fn fsck_fixed(&self) -> bool {
        self.fsck_fixed.load(Ordering::Acquire)
    }

    /// Restores the persisted fsck-fixed flag at mount.
    pub fn set_fsck_fixed(&self, fixed: bool) {
        self.fsck_fixed.store(fixed, Ordering::Release);
    }

    /// Number of faults of `class` observed so far.
    pub fn count(&self, class: FaultClass) -> u64 {
        self.counts[class.index()].load(Ordering::Relaxed)
    }

    /// Snapshot of the most recent faults, oldest first.
    pub fn recent(&self) -> Vec<FaultRecord> {
        self.recent.lock().iter().cloned().collect()
    }
}

impl fmt::Debug for FaultHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultHandler")
            .field("action", &self.action)
            .field("read_only", &self.is_read_only())
            .field("errors", &self.has_errors())
            .field("fsck_fixed", &self.fsck_fixed())
            .finish()
    }
}
