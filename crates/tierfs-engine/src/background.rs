//! Async worker driving the garbage collector, the tiering mover and
//! periodic checkpoints.
//!
//! Tasks arrive over a channel or from interval timers. Engine work is
//! blocking, so each task runs on the blocking pool while the worker waits
//! for it; tasks therefore never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::gc::GcReport;
use crate::tiering::TieringReport;

/// Work for the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    /// One garbage collection pass.
    RunGc,
    /// One tiering pass.
    RunTiering,
    /// Checkpoint the engine.
    Checkpoint,
    /// Stop the worker.
    Shutdown,
}

/// Background worker settings. An interval of 0 disables the timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Channel capacity for submitted tasks.
    pub channel_capacity: usize,
    /// Seconds between garbage collection passes.
    pub gc_interval_secs: u64,
    /// Seconds between tiering passes.
    pub tiering_interval_secs: u64,
    /// Seconds between checkpoints.
    pub checkpoint_interval_secs: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            gc_interval_secs: 30,
            tiering_interval_secs: 60,
            checkpoint_interval_secs: 10,
        }
    }
}

/// Counters published after every task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackgroundStats {
    /// Garbage collection passes completed.
    pub gc_passes: u64,
    /// Tiering passes completed.
    pub tiering_passes: u64,
    /// Checkpoints completed.
    pub checkpoints: u64,
    /// Tasks that returned an error.
    pub errors: u64,
    /// Tasks stopped by cancellation.
    pub cancelled: u64,
    /// Report of the last garbage collection pass.
    pub last_gc: Option<GcReport>,
    /// Report of the last tiering pass.
    pub last_tiering: Option<TieringReport>,
    /// Message of the last error.
    pub last_error: Option<String>,
}

enum Outcome {
    Gc(GcReport),
    Tiering(TieringReport),
    Checkpoint,
}

/// Handle to a running background worker.
pub struct BackgroundHandle {
    sender: mpsc::Sender<BackgroundTask>,
    stats: watch::Receiver<BackgroundStats>,
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Starts a worker for `engine` on the current tokio runtime.
    pub fn spawn(engine: Arc<Engine>, config: BackgroundConfig) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (stats_tx, stats_rx) = watch::channel(BackgroundStats::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            engine,
            config,
            cancel: cancel.clone(),
            stats_tx,
            stats: BackgroundStats::default(),
        };
        let join = tokio::spawn(worker.run(task_rx));
        Self {
            sender: task_tx,
            stats: stats_rx,
            cancel,
            join: Some(join),
        }
    }

    /// Queues a task. Fails once the worker has stopped.
    pub async fn submit(&self, task: BackgroundTask) -> EngineResult<()> {
        self.sender
            .send(task)
            .await
            .map_err(|_| EngineError::RawIo(std::io::Error::other("background worker stopped")))
    }

    /// Latest published stats.
    pub fn stats(&self) -> BackgroundStats {
        self.stats.borrow().clone()
    }

    /// Receiver notified whenever a task finishes.
    pub fn subscribe(&self) -> watch::Receiver<BackgroundStats> {
        self.stats.clone()
    }

    /// Asks the running task to stop at its next check.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Whether the worker still accepts tasks.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Cancels the running task, stops the worker and waits for it.
    pub async fn shutdown(mut self) {
        self.cancel();
        let _ = self.sender.send(BackgroundTask::Shutdown).await;
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "background worker panicked");
            }
        }
    }
}

struct Worker {
    engine: Arc<Engine>,
    config: BackgroundConfig,
    cancel: Arc<AtomicBool>,
    stats_tx: watch::Sender<BackgroundStats>,
    stats: BackgroundStats,
}

fn timer(secs: u64) -> Option<Interval> {
    if secs == 0 {
        return None;
    }
    let period = Duration::from_secs(secs);
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<BackgroundTask>) {
        let mut gc_timer = timer(self.config.gc_interval_secs);
        let mut tiering_timer = timer(self.config.tiering_interval_secs);
        let mut checkpoint_timer = timer(self.config.checkpoint_interval_secs);
        debug!(config = ?self.config, "background worker started");

        loop {
            let task = tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = tick(&mut gc_timer), if gc_timer.is_some() => BackgroundTask::RunGc,
                _ = tick(&mut tiering_timer), if tiering_timer.is_some() => BackgroundTask::RunTiering,
                _ = tick(&mut checkpoint_timer), if checkpoint_timer.is_some() => BackgroundTask::Checkpoint,
            };
            if task == BackgroundTask::Shutdown {
                break;
            }
            if self.engine.is_read_only() {
                debug!(?task, "skipping background task on read-only engine");
                continue;
            }
            self.cancel.store(false, Ordering::Release);
            let engine = self.engine.clone();
            let cancel = self.cancel.clone();
            let result = tokio::task::spawn_blocking(move || execute(&engine, task, &cancel)).await;
            match result {
                Ok(Ok(outcome)) => self.record(outcome),
                Ok(Err(EngineError::Cancelled)) => {
                    debug!(?task, "background task cancelled");
                    self.stats.cancelled += 1;
                }
                Ok(Err(EngineError::LockContended { what })) => {
                    debug!(?task, %what, "background task already running");
                }
                Ok(Err(e)) => {
                    warn!(?task, error = %e, "background task failed");
                    self.stats.errors += 1;
                    self.stats.last_error = Some(e.to_string());
                }
                Err(e) => {
                    warn!(?task, error = %e, "background task panicked");
                    self.stats.errors += 1;
                    self.stats.last_error = Some(e.to_string());
                }
            }
            let _ = self.stats_tx.send(self.stats.clone());
        }
        info!("background worker stopped");
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Gc(report) => {
                self.stats.gc_passes += 1;
                self.stats.last_gc = Some(report);
            }
            Outcome::Tiering(report) => {
                self.stats.tiering_passes += 1;
                self.stats.last_tiering = Some(report);
            }
            Outcome::Checkpoint => self.stats.checkpoints += 1,
        }
    }
}

fn execute(engine: &Engine, task: BackgroundTask, cancel: &AtomicBool) -> EngineResult<Outcome> {
    match task {
        BackgroundTask::RunGc => engine.run_gc(cancel).map(Outcome::Gc),
        BackgroundTask::RunTiering => engine.run_tiering(cancel).map(Outcome::Tiering),
        BackgroundTask::Checkpoint => engine.checkpoint().map(|()| Outcome::Checkpoint),
        BackgroundTask::Shutdown => Err(EngineError::Cancelled),
    }
}
