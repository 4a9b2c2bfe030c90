//! Tiering mover.
//!
//! Reads are counted per extent over a sliding window. Extents on the
//! capacity tier that are read often enough move to the fast tier, and
//! extents on the fast tier that have not been read for a while move to
//! the capacity tier. Moves go through the same relocation path as the
//! garbage collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::Tier;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::gc::MoveState;
use crate::key::{BtreeId, Bpos, Value};

/// Tiering mover settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Reads within the window that make an extent hot.
    pub promote_min_hits: u32,
    /// Length of the read counting window.
    pub window_secs: u64,
    /// Fast tier extents unread for this long are demoted.
    pub demote_after_secs: u64,
    /// Most extents examined by one pass.
    pub max_extents_per_pass: usize,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            promote_min_hits: 3,
            window_secs: 60,
            demote_after_secs: 3600,
            max_extents_per_pass: 256,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Access {
    window_start: Instant,
    hits: u32,
    last: Instant,
}

/// Per-extent read counters. Forgotten on restart; everything then looks
/// cold since the mount.
#[derive(Debug)]
pub(crate) struct AccessTracker {
    window: Duration,
    created: Instant,
    entries: DashMap<Bpos, Access>,
}

impl AccessTracker {
    pub(crate) fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            created: Instant::now(),
            entries: DashMap::new(),
        }
    }

    pub(crate) fn record(&self, pos: Bpos) {
        let now = Instant::now();
        let mut entry = self.entries.entry(pos).or_insert(Access {
            window_start: now,
            hits: 0,
            last: now,
        });
        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.hits = 0;
        }
        entry.hits = entry.hits.saturating_add(1);
        entry.last = now;
    }

    /// Reads of `pos` in the current window.
    pub(crate) fn hits(&self, pos: Bpos) -> u32 {
        match self.entries.get(&pos) {
            Some(a) if a.window_start.elapsed() <= self.window => a.hits,
            _ => 0,
        }
    }

    /// Time since `pos` was last read, or since the tracker started.
    pub(crate) fn idle_for(&self, pos: Bpos) -> Duration {
        match self.entries.get(&pos) {
            Some(a) => a.last.elapsed(),
            None => self.created.elapsed(),
        }
    }

    pub(crate) fn forget(&self, pos: Bpos) {
        self.entries.remove(&pos);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of one tiering pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieringReport {
    /// Extents examined.
    pub scanned: usize,
    /// Extents moved to the fast tier.
    pub promoted: usize,
    /// Extents moved to the capacity tier.
    pub demoted: usize,
    /// Moves abandoned because a foreground write changed the record.
    pub conflicts: usize,
    /// Moves skipped because the target tier is full.
    pub skipped_no_space: usize,
    /// Moves that failed for other reasons.
    pub failed: usize,
}

impl Engine {
    /// Phase of the tiering mover.
    pub fn tiering_state(&self) -> MoveState {
        self.tiering_state.get()
    }

    /// Runs one tiering pass.
    pub fn run_tiering(&self, cancel: &AtomicBool) -> EngineResult<TieringReport> {
        self.check_writable()?;
        let Some(run) = self.tiering_state.try_start() else {
            return Err(EngineError::LockContended {
                what: "tiering".to_string(),
            });
        };
        let cfg = &self.config.tiering;
        let mut report = TieringReport::default();

        let mut moves: Vec<(Bpos, Tier)> = Vec::new();
        {
            let _gate = self.commit_gate.read();
            for rec in self.iter(BtreeId::Extents, ..) {
                if report.scanned >= cfg.max_extents_per_pass {
                    break;
                }
                let rec = rec?;
                let Value::Extent(e) = &rec.value else {
                    continue;
                };
                report.scanned += 1;
                let on = |tier: Tier| {
                    e.ptrs
                        .iter()
                        .all(|p| self.devices[p.dev as usize].tier() == tier)
                };
                if on(Tier::Capacity) && self.access.hits(rec.pos) >= cfg.promote_min_hits {
                    moves.push((rec.pos, Tier::Fast));
                } else if on(Tier::Fast)
                    && self.access.idle_for(rec.pos) >= Duration::from_secs(cfg.demote_after_secs)
                {
                    moves.push((rec.pos, Tier::Capacity));
                }
            }
        }
        debug!(
            scanned = report.scanned,
            moves = moves.len(),
            tracked = self.access.len(),
            "tiering scan"
        );

        run.set(MoveState::Relocating);
        let retries = self.config.gc.max_retries;
        let backoff = Duration::from_millis(self.config.gc.backoff_ms);
        for (pos, tier) in moves {
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::Cancelled);
            }
            match self.relocate_extent(pos, tier, false, retries, backoff) {
                Ok(true) => {
                    self.access.forget(pos);
                    match tier {
                        Tier::Fast => report.promoted += 1,
                        Tier::Capacity => report.demoted += 1,
                    }
                }
                Ok(false) => report.conflicts += 1,
                Err(EngineError::OutOfSpace { .. }) => report.skipped_no_space += 1,
                Err(EngineError::ReadOnly) => return Err(EngineError::ReadOnly),
                Err(e) => {
                    warn!(%pos, %tier, error = %e, "tiering could not move extent");
                    report.failed += 1;
                }
            }
        }

        run.set(MoveState::Done);
        info!(
            scanned = report.scanned,
            promoted = report.promoted,
            demoted = report.demoted,
            conflicts = report.conflicts,
            skipped_no_space = report.skipped_no_space,
            failed = report.failed,
            "tiering pass"
        );
        Ok(report)
    }
}
