//! Sorted record batches and the merged view of a node.
//!
//! A node's content is a stack of [`Bset`]s, each sorted and free of
//! duplicates. Updates append a new batch instead of re-sorting the node;
//! readers merge the batches on the fly, with the newest batch winning on
//! equal keys. Once the stack grows past a threshold it is compacted into a
//! single batch, which is also where tombstones are dropped.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::key::{Bpos, Record};

/// A sorted batch of records with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bset {
    records: Vec<Record>,
    bytes: usize,
}

impl Bset {
    /// Wraps records already sorted by key without duplicates.
    pub fn from_sorted(records: Vec<Record>) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].pos < w[1].pos));
        let bytes = records.iter().map(Record::encoded_len).sum();
        Self { records, bytes }
    }

    /// Like [`Self::from_sorted`] for untrusted input; returns the first key
    /// that breaks strict ordering.
    pub fn from_sorted_checked(records: Vec<Record>) -> Result<Self, Bpos> {
        if let Some(w) = records.windows(2).find(|w| w[0].pos >= w[1].pos) {
            return Err(w[1].pos);
        }
        Ok(Self::from_sorted(records))
    }

    /// Sorts `records`; among equal keys the one appearing last wins.
    pub fn from_unsorted(mut records: Vec<Record>) -> Self {
        records.sort_by(|a, b| a.pos.cmp(&b.pos));
        let mut out: Vec<Record> = Vec::with_capacity(records.len());
        for rec in records {
            match out.last_mut() {
                Some(last) if last.pos == rec.pos => *last = rec,
                _ => out.push(rec),
            }
        }
        Self::from_sorted(out)
    }

    /// Records in key order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encoded size of the records.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn get(&self, pos: Bpos) -> Option<&Record> {
        self.records
            .binary_search_by(|r| r.pos.cmp(&pos))
            .ok()
            .map(|i| &self.records[i])
    }

    fn lower_bound(&self, pos: Bpos) -> usize {
        self.records.partition_point(|r| r.pos < pos)
    }
}

/// Merged, ordered view over a node's batches.
#[derive(Debug, Clone, Default)]
pub struct SortedNode {
    bsets: Vec<Arc<Bset>>,
}

impl SortedNode {
    /// Empty content.
    pub fn new() -> Self {
        Self::default()
    }

    /// Content made of one batch.
    pub fn from_records(records: Vec<Record>) -> Self {
        Self::from_bsets(vec![Bset::from_sorted(records)])
    }

    /// Content made of the given batches, oldest first.
    pub fn from_bsets(bsets: Vec<Bset>) -> Self {
        Self {
            bsets: bsets
                .into_iter()
                .filter(|b| !b.is_empty())
                .map(Arc::new)
                .collect(),
        }
    }

    /// New content with `batch` appended on top; existing batches are shared.
    pub fn with_batch(&self, batch: Bset) -> SortedNode {
        let mut bsets = self.bsets.clone();
        if !batch.is_empty() {
            bsets.push(Arc::new(batch));
        }
        SortedNode { bsets }
    }

    /// Batches, oldest first.
    pub fn bsets(&self) -> &[Arc<Bset>] {
        &self.bsets
    }

    /// Number of batches.
    pub fn bset_count(&self) -> usize {
        self.bsets.len()
    }

    /// Encoded size of all batches, including shadowed records.
    pub fn bytes(&self) -> usize {
        self.bsets.iter().map(|b| b.bytes()).sum()
    }

    /// Newest record at `pos`, tombstones included.
    pub fn get(&self, pos: Bpos) -> Option<&Record> {
        self.bsets.iter().rev().find_map(|b| b.get(pos))
    }

    /// Live record at `pos`.
    pub fn lookup(&self, pos: Bpos) -> Option<&Record> {
        self.get(pos).filter(|r| !r.is_tombstone())
    }

    /// Merged records in key order, tombstones included.
    pub fn iter(&self) -> MergeIter<'_> {
        MergeIter::forward(&self.bsets, Bpos::MIN)
    }

    /// Merged records with key `>= pos`, ascending.
    pub fn iter_from(&self, pos: Bpos) -> MergeIter<'_> {
        MergeIter::forward(&self.bsets, pos)
    }

    /// Merged records with key `< pos`, descending.
    pub fn iter_rev_before(&self, pos: Bpos) -> MergeIter<'_> {
        MergeIter::backward(&self.bsets, Some(pos))
    }

    /// Merged records, descending.
    pub fn iter_rev(&self) -> MergeIter<'_> {
        MergeIter::backward(&self.bsets, None)
    }

    /// First live record with key `>= pos`.
    pub fn first_live_at_or_after(&self, pos: Bpos) -> Option<&Record> {
        self.iter_from(pos).find(|r| !r.is_tombstone())
    }

    /// Last live record with key `< pos`.
    pub fn last_live_before(&self, pos: Bpos) -> Option<&Record> {
        self.iter_rev_before(pos).find(|r| !r.is_tombstone())
    }

    /// Live records in key order.
    pub fn live_records(&self) -> Vec<Record> {
        self.iter().filter(|r| !r.is_tombstone()).cloned().collect()
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.iter().filter(|r| !r.is_tombstone()).count()
    }

    /// Merges every batch into one. Dropping tombstones is only correct when
    /// this node holds every older version of its keys, which is always true
    /// for a whole node.
    pub fn compact(&self, drop_tombstones: bool) -> SortedNode {
        let records: Vec<Record> = self
            .iter()
            .filter(|r| !(drop_tombstones && r.is_tombstone()))
            .cloned()
            .collect();
        SortedNode::from_records(records)
    }
}

/// K-way merge over a node's batches.
pub struct MergeIter<'a> {
    bsets: &'a [Arc<Bset>],
    /// Forward: next index to yield. Backward: one past the next index.
    idx: Vec<usize>,
    forward: bool,
}

impl<'a> MergeIter<'a> {
    fn forward(bsets: &'a [Arc<Bset>], from: Bpos) -> Self {
        Self {
            bsets,
            idx: bsets.iter().map(|b| b.lower_bound(from)).collect(),
            forward: true,
        }
    }

    fn backward(bsets: &'a [Arc<Bset>], before: Option<Bpos>) -> Self {
        Self {
            bsets,
            idx: bsets
                .iter()
                .map(|b| before.map_or(b.len(), |p| b.lower_bound(p)))
                .collect(),
            forward: false,
        }
    }

    fn head(&self, i: usize) -> Option<&'a Record> {
        let bsets: &'a [Arc<Bset>] = self.bsets;
        let bset = &bsets[i];
        if self.forward {
            bset.records.get(self.idx[i])
        } else {
            self.idx[i].checked_sub(1).map(|j| &bset.records[j])
        }
    }
}

impl<'a> Iterator for MergeIter<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<&'a Record> {
        let mut best: Option<(usize, &'a Record)> = None;
        for i in 0..self.bsets.len() {
            let Some(rec) = self.head(i) else { continue };
            best = match best {
                None => Some((i, rec)),
                Some((_, cur)) => {
                    let ord = rec.pos.cmp(&cur.pos);
                    let better = if self.forward {
                        ord != Ordering::Greater
                    } else {
                        ord != Ordering::Less
                    };
                    // later batches are newer, so ties go to the higher index
                    if better {
                        Some((i, rec))
                    } else {
                        best
                    }
                }
            };
        }

        let (_, rec) = best?;
        for i in 0..self.bsets.len() {
            if self.head(i).is_some_and(|r| r.pos == rec.pos) {
                if self.forward {
                    self.idx[i] += 1;
                } else {
                    self.idx[i] -= 1;
                }
            }
        }
        Some(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Value;

    fn rec(k: u64, v: u8) -> Record {
        Record::new(Bpos::new(k, 0), Value::Blob(vec![v]))
    }

    fn keys<'a>(it: impl Iterator<Item = &'a Record>) -> Vec<u64> {
        it.map(|r| r.pos.inode).collect()
    }

    #[test]
    fn test_from_unsorted_last_wins() {
        let b = Bset::from_unsorted(vec![rec(3, 1), rec(1, 1), rec(3, 2), rec(2, 1)]);
        assert_eq!(b.len(), 3);
        assert_eq!(b.records()[2], rec(3, 2));
        assert!(Bset::from_sorted_checked(b.records().to_vec()).is_ok());
        assert_eq!(
            Bset::from_sorted_checked(vec![rec(2, 1), rec(1, 1)]).unwrap_err(),
            Bpos::new(1, 0)
        );
    }

    #[test]
    fn test_newest_batch_wins() {
        let node = SortedNode::from_records(vec![rec(1, 1), rec(2, 1)])
            .with_batch(Bset::from_sorted(vec![rec(2, 9)]));
        assert_eq!(node.bset_count(), 2);
        assert_eq!(node.get(Bpos::new(2, 0)), Some(&rec(2, 9)));
        let merged: Vec<_> = node.iter().cloned().collect();
        assert_eq!(merged, vec![rec(1, 1), rec(2, 9)]);
    }

    #[test]
    fn test_tombstone_hides_older_value() {
        let node = SortedNode::from_records(vec![rec(1, 1), rec(2, 2), rec(3, 3)])
            .with_batch(Bset::from_sorted(vec![Record::tombstone(Bpos::new(2, 0))]));
        assert!(node.lookup(Bpos::new(2, 0)).is_none());
        assert!(node.get(Bpos::new(2, 0)).unwrap().is_tombstone());
        // range scans still see the tombstone
        assert_eq!(keys(node.iter()), vec![1, 2, 3]);
        assert_eq!(node.live_count(), 2);
    }

    #[test]
    fn test_compact_drops_tombstones_without_resurrection() {
        let node = SortedNode::from_records(vec![rec(1, 1), rec(2, 2)])
            .with_batch(Bset::from_sorted(vec![Record::tombstone(Bpos::new(2, 0))]))
            .with_batch(Bset::from_sorted(vec![rec(4, 4)]));
        let compacted = node.compact(true);
        assert_eq!(compacted.bset_count(), 1);
        assert_eq!(keys(compacted.iter()), vec![1, 4]);
        assert!(compacted.get(Bpos::new(2, 0)).is_none());

        let kept = node.compact(false);
        assert_eq!(keys(kept.iter()), vec![1, 2, 4]);
    }

    #[test]
    fn test_iter_from_and_rev() {
        let node = SortedNode::from_records(vec![rec(1, 1), rec(5, 5)])
            .with_batch(Bset::from_sorted(vec![rec(3, 3), rec(7, 7)]));
        assert_eq!(keys(node.iter_from(Bpos::new(3, 0))), vec![3, 5, 7]);
        assert_eq!(keys(node.iter_from(Bpos::new(4, 0))), vec![5, 7]);
        assert_eq!(keys(node.iter_rev_before(Bpos::new(5, 0))), vec![3, 1]);
        assert_eq!(keys(node.iter_rev()), vec![7, 5, 3, 1]);
    }

    #[test]
    fn test_live_neighbours_skip_tombstones() {
        let node = SortedNode::from_records(vec![rec(1, 1), rec(2, 2), rec(3, 3)])
            .with_batch(Bset::from_sorted(vec![Record::tombstone(Bpos::new(2, 0))]));
        assert_eq!(node.first_live_at_or_after(Bpos::new(2, 0)).unwrap().pos.inode, 3);
        assert_eq!(node.last_live_before(Bpos::new(3, 0)).unwrap().pos.inode, 1);
    }

    #[test]
    fn test_empty_batches_are_not_stacked() {
        let node = SortedNode::new().with_batch(Bset::default());
        assert_eq!(node.bset_count(), 0);
        assert!(node.iter().next().is_none());
    }

    #[test]
    fn test_bytes_accumulate() {
        let a = SortedNode::from_records(vec![rec(1, 1)]);
        let b = a.with_batch(Bset::from_sorted(vec![rec(1, 2)]));
        assert_eq!(b.bytes(), 2 * a.bytes());
    }
}
