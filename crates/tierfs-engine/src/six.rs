//! Six-state lock for btree nodes.
//!
//! Modes:
//! - read: any number of holders, blocked only by a writer;
//! - intent: at most one holder, compatible with readers, excludes other
//!   intent holders and writers;
//! - write: taken by the intent holder once all readers are gone.
//!
//! Deadlock freedom relies on blocking acquisitions following a global
//! order: btree, then node start key, then level from the root down. The
//! per-thread [`LockOrderTracker`] records every acquisition and counts
//! violations; try-lock acquisitions are exempt because they cannot wait.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::key::{Bpos, BtreeId};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SixMode {
    /// Shared.
    Read,
    /// Exclusive among writers, shared with readers.
    Intent,
    /// Exclusive.
    Write,
}

#[derive(Debug, Default)]
struct SixState {
    readers: u32,
    intent: bool,
    write: bool,
    seq: u64,
}

/// The lock itself.
#[derive(Debug, Default)]
pub struct SixLock {
    state: Mutex<SixState>,
    cond: Condvar,
}

impl SixLock {
    /// Unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a read lock is held.
    pub fn lock_read(&self) {
        let mut s = self.state.lock();
        while s.write {
            self.cond.wait(&mut s);
        }
        s.readers += 1;
    }

    /// Takes a read lock if no writer holds the lock.
    pub fn try_lock_read(&self) -> bool {
        let mut s = self.state.lock();
        if s.write {
            return false;
        }
        s.readers += 1;
        true
    }

    /// Releases a read lock.
    pub fn unlock_read(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.readers > 0, "unlock_read without readers");
        s.readers = s.readers.saturating_sub(1);
        if s.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until the intent lock is held.
    pub fn lock_intent(&self) {
        let mut s = self.state.lock();
        while s.intent || s.write {
            self.cond.wait(&mut s);
        }
        s.intent = true;
    }

    /// Takes the intent lock if it is free.
    pub fn try_lock_intent(&self) -> bool {
        let mut s = self.state.lock();
        if s.intent || s.write {
            return false;
        }
        s.intent = true;
        true
    }

    /// Releases the intent lock.
    pub fn unlock_intent(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.intent, "unlock_intent without intent");
        s.intent = false;
        self.cond.notify_all();
    }

    /// Read to intent upgrade; fails if another intent or write holder exists.
    pub fn try_upgrade(&self) -> bool {
        let mut s = self.state.lock();
        if s.intent || s.write {
            return false;
        }
        s.readers = s.readers.saturating_sub(1);
        s.intent = true;
        if s.readers == 0 {
            self.cond.notify_all();
        }
        true
    }

    /// Intent to write upgrade; waits for readers to drain. The caller must
    /// hold the intent lock.
    pub fn lock_write(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.intent, "lock_write without intent");
        while s.readers > 0 {
            self.cond.wait(&mut s);
        }
        s.write = true;
        s.seq += 1;
    }

    /// Intent to write upgrade without waiting.
    pub fn try_lock_write(&self) -> bool {
        let mut s = self.state.lock();
        debug_assert!(s.intent, "try_lock_write without intent");
        if s.readers > 0 {
            return false;
        }
        s.write = true;
        s.seq += 1;
        true
    }

    /// Write back to intent.
    pub fn unlock_write(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.write, "unlock_write without write");
        s.write = false;
        s.seq += 1;
        self.cond.notify_all();
    }

    /// Incremented on every write lock and unlock; odd while write-held.
    pub fn seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// Current holders: (readers, intent, write).
    pub fn holders(&self) -> (u32, bool, bool) {
        let s = self.state.lock();
        (s.readers, s.intent, s.write)
    }
}

/// Position of a node in the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockOrderKey {
    btree: BtreeId,
    min_key: Bpos,
    depth: u8,
}

impl LockOrderKey {
    /// Key for a node of `btree` at `level` starting at `min_key`.
    pub fn new(btree: BtreeId, min_key: Bpos, level: u8) -> Self {
        Self {
            btree,
            min_key,
            depth: u8::MAX - level,
        }
    }
}

static LOCK_ORDER_VIOLATIONS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static HELD: RefCell<Vec<LockOrderKey>> = const { RefCell::new(Vec::new()) };
}

/// Per-thread record of held node locks.
pub struct LockOrderTracker;

impl LockOrderTracker {
    /// Records an acquisition. A blocking acquisition must order after every
    /// lock the thread already holds.
    pub fn acquire(key: LockOrderKey, blocking: bool) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if blocking {
                if let Some(max) = held.iter().max() {
                    if key <= *max {
                        LOCK_ORDER_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
                        error!(?key, held = ?*max, "node lock acquired out of order");
                    }
                }
            }
            held.push(key);
        });
    }

    /// Records a release.
    pub fn release(key: LockOrderKey) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(i) = held.iter().rposition(|k| *k == key) {
                held.swap_remove(i);
            }
        });
    }

    /// Number of locks the current thread holds.
    pub fn held_count() -> usize {
        HELD.with(|held| held.borrow().len())
    }

    /// Total ordering violations observed by any thread.
    pub fn violations() -> u64 {
        LOCK_ORDER_VIOLATIONS.load(Ordering::Relaxed)
    }
}
