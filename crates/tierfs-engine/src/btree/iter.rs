//! Ordered cursor over one btree.

use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::btree::Mutation;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::key::{BtreeId, Bpos, Record};
use crate::node_cache::CachedNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Between records: `next` returns the first record at or after the key.
    At(Bpos),
    /// Past the last possible key.
    End,
}

/// Lazy cursor over a key range.
///
/// The cursor sits between records. `next` returns the record after it and
/// moves past it; `prev` returns the record before it and moves in front
/// of it, so `prev` followed by `next` yields the same record twice.
///
/// No node lock is held between calls. The current leaf is kept pinned and
/// reused while it is still live; once a commit replaces it, the next call
/// descends from the root again. Records inserted ahead of the cursor are
/// therefore seen, those behind it are not.
pub struct BtreeIter<'a> {
    engine: &'a Engine,
    btree: BtreeId,
    cursor: Cursor,
    start: Bpos,
    end: Bound<Bpos>,
    leaf: Option<Arc<CachedNode>>,
    failed: bool,
}

impl<'a> BtreeIter<'a> {
    pub(crate) fn new(engine: &'a Engine, btree: BtreeId, range: impl RangeBounds<Bpos>) -> Self {
        let start = match range.start_bound() {
            Bound::Included(p) => Some(*p),
            Bound::Excluded(p) => p.successor(),
            Bound::Unbounded => Some(Bpos::MIN),
        };
        let end = range.end_bound().cloned();
        Self {
            engine,
            btree,
            cursor: start.map_or(Cursor::End, Cursor::At),
            start: start.unwrap_or(Bpos::MAX),
            end,
            leaf: None,
            failed: false,
        }
    }

    /// Btree being iterated.
    pub fn btree(&self) -> BtreeId {
        self.btree
    }

    fn in_end_bound(&self, pos: Bpos) -> bool {
        match self.end {
            Bound::Included(e) => pos <= e,
            Bound::Excluded(e) => pos < e,
            Bound::Unbounded => true,
        }
    }

    /// Live leaf covering `pos`, reusing the pinned one when possible.
    fn leaf_for(&mut self, pos: Bpos) -> EngineResult<Arc<CachedNode>> {
        if let Some(leaf) = &self.leaf {
            if !leaf.is_dead() && leaf.node.min_key <= pos && pos <= leaf.node.max_key {
                return Ok(leaf.clone());
            }
        }
        let guard = self.engine.find_leaf(self.btree, pos)?;
        let leaf = guard.node().clone();
        drop(guard);
        self.leaf = Some(leaf.clone());
        Ok(leaf)
    }

    /// Moves the cursor in front of the first record at or after `pos`,
    /// clamped to the start of the range.
    pub fn seek(&mut self, pos: Bpos) {
        self.cursor = Cursor::At(pos.max(self.start));
        self.failed = false;
    }

    /// Record `next` would return, without moving.
    pub fn peek(&mut self) -> EngineResult<Option<Record>> {
        let saved = self.cursor;
        let res = self.next_record();
        self.cursor = saved;
        res
    }

    fn next_record(&mut self) -> EngineResult<Option<Record>> {
        loop {
            let pos = match self.cursor {
                Cursor::At(pos) => pos,
                Cursor::End => return Ok(None),
            };
            if !self.in_end_bound(pos) {
                return Ok(None);
            }
            let leaf = self.leaf_for(pos)?;
            if let Some(rec) = leaf.node.data.first_live_at_or_after(pos) {
                if !self.in_end_bound(rec.pos) {
                    return Ok(None);
                }
                self.cursor = rec.pos.successor().map_or(Cursor::End, Cursor::At);
                return Ok(Some(rec.clone()));
            }
            self.cursor = leaf.node.max_key.successor().map_or(Cursor::End, Cursor::At);
        }
    }

    /// Returns the record before the cursor and moves in front of it.
    pub fn prev(&mut self) -> EngineResult<Option<Record>> {
        // `bound` is exclusive; `None` means everything up to Bpos::MAX
        let mut bound = match self.cursor {
            Cursor::At(pos) => Some(pos),
            Cursor::End => None,
        };
        loop {
            let seek_to = match bound {
                Some(b) => match b.predecessor() {
                    Some(p) => p,
                    None => return Ok(None),
                },
                None => Bpos::MAX,
            };
            if seek_to < self.start {
                return Ok(None);
            }
            let leaf = self.leaf_for(seek_to)?;
            let found = match bound {
                Some(b) => leaf.node.data.last_live_before(b),
                None => leaf.node.data.iter_rev().find(|r| !r.is_tombstone()),
            };
            if let Some(rec) = found {
                if rec.pos < self.start {
                    return Ok(None);
                }
                self.cursor = Cursor::At(rec.pos);
                return Ok(Some(rec.clone()));
            }
            bound = Some(leaf.node.min_key);
        }
    }

    /// Applies `mutations` through the copy-on-write updater. The cursor
    /// keeps its position and sees the result on the next call.
    pub fn update(&mut self, mutations: Vec<Mutation>) -> EngineResult<()> {
        self.leaf = None;
        self.engine.mutate(self.btree, mutations).map(|_| ())
    }
}

impl Iterator for BtreeIter<'_> {
    type Item = EngineResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(rec) => rec.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl Engine {
    /// Lazy iterator over the live records of `btree` within `range`.
    pub fn iter(&self, btree: BtreeId, range: impl RangeBounds<Bpos>) -> BtreeIter<'_> {
        BtreeIter::new(self, btree, range)
    }
}
