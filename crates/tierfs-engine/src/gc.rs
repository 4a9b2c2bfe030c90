//! Moving garbage collector.
//!
//! Buckets whose live fraction fell below a threshold are emptied by
//! moving their live extents and btree nodes elsewhere. Candidates are
//! excluded from allocation while the pass runs. Moved data is released at
//! the checkpoint that ends the pass, which is when the candidates return
//! to the free list.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::btree::{CommitOptions, RewriteTarget};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::key::{BtreeId, Bpos, Value};

/// Garbage collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Buckets with a smaller live fraction are emptied.
    pub live_threshold: f64,
    /// Most buckets emptied by one pass.
    pub max_buckets_per_pass: usize,
    /// Attempts per move when the btree is contended.
    pub max_retries: u32,
    /// First backoff between attempts; doubles each time.
    pub backoff_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            live_threshold: 0.5,
            max_buckets_per_pass: 16,
            max_retries: 8,
            backoff_ms: 1,
        }
    }
}

/// Phase of a background mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MoveState {
    /// Not running.
    #[default]
    Idle,
    /// Choosing what to move.
    Scanning,
    /// Moving.
    Relocating,
    /// Last pass completed.
    Done,
}

/// Run state shared by the garbage collector and the tiering mover. At
/// most one pass of each runs at a time.
#[derive(Debug, Default)]
pub(crate) struct MoverState {
    running: AtomicBool,
    state: Mutex<MoveState>,
}

impl MoverState {
    pub(crate) fn try_start(&self) -> Option<MoverRun<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        *self.state.lock() = MoveState::Scanning;
        Some(MoverRun { owner: self })
    }

    pub(crate) fn get(&self) -> MoveState {
        *self.state.lock()
    }
}

/// A pass in progress. An interrupted pass leaves the mover idle.
pub(crate) struct MoverRun<'a> {
    owner: &'a MoverState,
}

impl MoverRun<'_> {
    pub(crate) fn set(&self, state: MoveState) {
        *self.owner.state.lock() = state;
    }
}

impl Drop for MoverRun<'_> {
    fn drop(&mut self) {
        let mut state = self.owner.state.lock();
        if *state != MoveState::Done {
            *state = MoveState::Idle;
        }
        drop(state);
        self.owner.running.store(false, Ordering::Release);
    }
}

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Candidate buckets.
    pub buckets_scanned: usize,
    /// Extents moved out of candidates.
    pub extents_moved: usize,
    /// Btree nodes rewritten out of candidates.
    pub nodes_rewritten: usize,
    /// Candidates that ended up free.
    pub buckets_freed: usize,
    /// Moves abandoned because a foreground write changed the record.
    pub conflicts: usize,
    /// Moves that failed for other reasons.
    pub failed: usize,
}

impl Engine {
    /// Phase of the garbage collector.
    pub fn gc_state(&self) -> MoveState {
        self.gc_state.get()
    }

    /// Runs one garbage collection pass.
    ///
    /// Fails with `LockContended` if a pass is already running and with
    /// `Cancelled` once `cancel` is set; work done up to then is kept.
    pub fn run_gc(&self, cancel: &AtomicBool) -> EngineResult<GcReport> {
        self.check_writable()?;
        let Some(run) = self.gc_state.try_start() else {
            return Err(EngineError::LockContended {
                what: "gc".to_string(),
            });
        };
        let started = Instant::now();
        let cfg = &self.config.gc;
        let mut report = GcReport::default();

        let candidates: Vec<(u32, u64)> = self
            .alloc
            .gc_candidates(cfg.live_threshold)
            .into_iter()
            .take(cfg.max_buckets_per_pass)
            .map(|(dev, b, _)| (dev, b))
            .collect();
        report.buckets_scanned = candidates.len();
        if candidates.is_empty() {
            run.set(MoveState::Done);
            return Ok(report);
        }
        for &(dev, b) in &candidates {
            self.alloc.set_needs_gc(dev, b, true);
        }
        let targets: HashSet<(u32, u64)> = candidates.iter().copied().collect();

        let res = self
            .gc_move(&targets, cancel, &run, &mut report)
            .and_then(|()| self.checkpoint());
        for &(dev, b) in &candidates {
            match self.alloc.bucket(dev, b) {
                Some(bucket) if bucket.is_free() => report.buckets_freed += 1,
                _ => self.alloc.set_needs_gc(dev, b, false),
            }
        }
        res?;

        run.set(MoveState::Done);
        info!(
            buckets = report.buckets_scanned,
            extents_moved = report.extents_moved,
            nodes_rewritten = report.nodes_rewritten,
            buckets_freed = report.buckets_freed,
            conflicts = report.conflicts,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gc pass"
        );
        Ok(report)
    }

    fn gc_move(
        &self,
        targets: &HashSet<(u32, u64)>,
        cancel: &AtomicBool,
        run: &MoverRun<'_>,
        report: &mut GcReport,
    ) -> EngineResult<()> {
        let in_target = |dev: u32, bucket: u64| targets.contains(&(dev, bucket));

        let mut extents: Vec<Bpos> = Vec::new();
        {
            let _gate = self.commit_gate.read();
            for rec in self.iter(BtreeId::Extents, ..) {
                let rec = rec?;
                if let Value::Extent(e) = &rec.value {
                    if e.ptrs.iter().any(|p| in_target(p.dev, p.bucket)) {
                        extents.push(rec.pos);
                    }
                }
            }
        }
        let mut nodes: Vec<(BtreeId, RewriteTarget)> = Vec::new();
        for btree in BtreeId::ALL {
            self.for_each_node(btree, |n| {
                if n.ptr.replicas.iter().any(|p| in_target(p.dev, p.bucket)) {
                    nodes.push((
                        btree,
                        RewriteTarget {
                            level: n.node.level,
                            pos: n.node.min_key,
                        },
                    ));
                }
                Ok(())
            })?;
        }
        debug!(extents = extents.len(), nodes = nodes.len(), "gc scan");

        run.set(MoveState::Relocating);
        let retries = self.config.gc.max_retries;
        let backoff = Duration::from_millis(self.config.gc.backoff_ms);
        for pos in extents {
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::Cancelled);
            }
            let tier = match self.lookup(BtreeId::Extents, pos)? {
                Some(Value::Extent(e)) => match e.ptrs.first() {
                    Some(p) => self.devices[p.dev as usize].tier(),
                    None => continue,
                },
                _ => continue,
            };
            match self.relocate_extent(pos, tier, true, retries, backoff) {
                Ok(true) => report.extents_moved += 1,
                Ok(false) => report.conflicts += 1,
                Err(e @ (EngineError::ReadOnly | EngineError::OutOfSpace { .. })) => return Err(e),
                Err(e) => {
                    warn!(%pos, error = %e, "gc could not move extent");
                    report.failed += 1;
                }
            }
        }

        for (btree, target) in nodes {
            if cancel.load(Ordering::Acquire) {
                return Err(EngineError::Cancelled);
            }
            let opts = CommitOptions {
                nonblocking: true,
                rewrite: Some(target),
            };
            let mut attempt = 0;
            loop {
                match self.commit(btree, Vec::new(), opts.clone()) {
                    Ok(res) => {
                        report.nodes_rewritten += res.nodes_written;
                        break;
                    }
                    Err(EngineError::LockContended { .. }) if attempt < retries => {
                        thread::sleep(backoff * 2u32.saturating_pow(attempt.min(16)));
                        attempt += 1;
                    }
                    Err(e @ (EngineError::ReadOnly | EngineError::OutOfSpace { .. })) => return Err(e),
                    Err(e) => {
                        warn!(%btree, level = target.level, pos = %target.pos, error = %e, "gc could not rewrite node");
                        report.failed += 1;
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mover_state_single_run() {
        let state = MoverState::default();
        assert_eq!(state.get(), MoveState::Idle);
        let run = state.try_start().unwrap();
        assert_eq!(state.get(), MoveState::Scanning);
        assert!(state.try_start().is_none());
        run.set(MoveState::Relocating);
        drop(run);
        assert_eq!(state.get(), MoveState::Idle);

        let run = state.try_start().unwrap();
        run.set(MoveState::Done);
        drop(run);
        assert_eq!(state.get(), MoveState::Done);
    }

    #[test]
    fn test_gc_config_defaults() {
        let cfg: GcConfig = serde_json::from_str(r#"{"live_threshold": 0.25}"#).unwrap();
        assert_eq!(cfg.live_threshold, 0.25);
        assert_eq!(cfg.max_buckets_per_pass, 16);
    }
}
