//! # Interval bookkeeping
//!
//! [`RangeSet`] tracks which half-open `[start, end)` byte ranges of a file
//! are present. The set keeps its invariant at every step: ranges are
//! disjoint, non-adjacent (touching ranges merge) and sorted ascending.
//!
//! [`SharedRangeSet`] wraps a set in a reader-writer lock for concurrent
//! use; reads proceed in parallel and iteration returns a snapshot.

use std::sync::RwLock;

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// An ordered set of disjoint, non-adjacent half-open ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `[start, end)`, merging with overlapping or touching ranges.
    /// Empty input ranges are ignored.
    pub fn add(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }

        let mut new_start = start;
        let mut new_end = end;

        // Everything that overlaps or touches [start, end) collapses into it.
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;
        for r in &self.ranges {
            if r.end < new_start || r.start > new_end {
                if !inserted && r.start > new_end {
                    merged.push(ByteRange::new(new_start, new_end));
                    inserted = true;
                }
                merged.push(*r);
            } else {
                new_start = new_start.min(r.start);
                new_end = new_end.max(r.end);
            }
        }
        if !inserted {
            merged.push(ByteRange::new(new_start, new_end));
        }
        merged.sort();
        self.ranges = merged;
    }

    /// Removes the interior of `[start, end)`, splitting ranges as needed.
    pub fn subtract(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }

        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for r in &self.ranges {
            if r.end <= start || r.start >= end {
                result.push(*r);
                continue;
            }
            if r.start < start {
                result.push(ByteRange::new(r.start, start));
            }
            if r.end > end {
                result.push(ByteRange::new(end, r.end));
            }
        }
        self.ranges = result;
    }

    /// True if `pos` falls inside some range.
    pub fn contains(&self, pos: u64) -> bool {
        self.ranges.iter().any(|r| r.start <= pos && pos < r.end)
    }

    /// Bytes available starting at `pos`: `end - pos` of the covering range,
    /// or zero when `pos` is uncovered.
    pub fn contained_length_from(&self, pos: u64) -> u64 {
        self.ranges
            .iter()
            .find(|r| r.start <= pos && pos < r.end)
            .map(|r| r.end - pos)
            .unwrap_or(0)
    }

    /// True if `[start, end)` is entirely inside one existing range.
    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if end <= start {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| r.start <= start && end <= r.end)
    }

    /// Ordered sub-ranges of `[start, end)` missing from the set.
    pub fn gaps(&self, start: u64, end: u64) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        if end <= start {
            return gaps;
        }

        let mut cursor = start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= end {
                break;
            }
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start.min(end)));
            }
            cursor = cursor.max(r.end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push(ByteRange::new(cursor, end));
        }
        gaps
    }

    /// The first missing sub-range of `[start, end)`, if any.
    pub fn first_gap(&self, start: u64, end: u64) -> Option<ByteRange> {
        self.gaps(start, end).into_iter().next()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn to_vec(&self) -> Vec<ByteRange> {
        self.ranges.clone()
    }

    /// Total covered length.
    pub fn total_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Number of disjoint ranges.
    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds every range of `other` to this set.
    pub fn union_with(&mut self, other: &RangeSet) {
        for r in &other.ranges {
            self.add(r.start, r.end);
        }
    }
}

/// A [`RangeSet`] behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct SharedRangeSet {
    inner: RwLock<RangeSet>,
}

impl SharedRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, start: u64, end: u64) {
        self.inner.write().unwrap().add(start, end);
    }

    pub fn subtract(&self, start: u64, end: u64) {
        self.inner.write().unwrap().subtract(start, end);
    }

    pub fn contains(&self, pos: u64) -> bool {
        self.inner.read().unwrap().contains(pos)
    }

    pub fn contained_length_from(&self, pos: u64) -> u64 {
        self.inner.read().unwrap().contained_length_from(pos)
    }

    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        self.inner.read().unwrap().contains_range(start, end)
    }

    pub fn gaps(&self, start: u64, end: u64) -> Vec<ByteRange> {
        self.inner.read().unwrap().gaps(start, end)
    }

    pub fn first_gap(&self, start: u64, end: u64) -> Option<ByteRange> {
        self.inner.read().unwrap().first_gap(start, end)
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }

    /// Snapshot of the current ranges.
    pub fn to_vec(&self) -> Vec<ByteRange> {
        self.inner.read().unwrap().to_vec()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.read().unwrap().total_bytes()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().count()
    }

    /// Snapshot of the whole set.
    pub fn snapshot(&self) -> RangeSet {
        self.inner.read().unwrap().clone()
    }

    /// Replaces the contents with `set`.
    pub fn replace(&self, set: RangeSet) {
        *self.inner.write().unwrap() = set;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(set: &RangeSet) {
        let v = set.to_vec();
        for w in v.windows(2) {
            assert!(w[0].end < w[1].start, "ranges must stay disjoint and non-adjacent: {v:?}");
        }
        assert_eq!(set.total_bytes(), v.iter().map(ByteRange::len).sum::<u64>());
    }

    #[test]
    fn add_merges_overlapping_and_touching() {
        let mut set = RangeSet::new();
        set.add(0, 10);
        set.add(20, 30);
        assert_eq!(set.count(), 2);

        // Touching merges.
        set.add(10, 20);
        assert_eq!(set.count(), 1);
        assert_eq!(set.to_vec(), vec![ByteRange::new(0, 30)]);

        // Overlap merges.
        set.add(25, 40);
        assert_eq!(set.to_vec(), vec![ByteRange::new(0, 40)]);
        assert_invariant(&set);
    }

    #[test]
    fn add_ignores_empty_and_is_idempotent() {
        let mut set = RangeSet::new();
        set.add(5, 5);
        set.add(7, 3);
        assert!(set.is_empty());

        set.add(10, 20);
        let before = set.clone();
        set.add(10, 20);
        assert_eq!(set, before);
    }

    #[test]
    fn subtract_splits_ranges() {
        let mut set = RangeSet::new();
        set.add(0, 100);
        set.subtract(40, 60);

        assert_eq!(set.count(), 2);
        assert_eq!(set.total_bytes(), 80);
        assert!(set.contains(39));
        assert!(!set.contains(40));
        assert!(!set.contains(59));
        assert!(set.contains(60));
        assert_eq!(set.gaps(0, 100), vec![ByteRange::new(40, 60)]);
        assert_invariant(&set);
    }

    #[test]
    fn add_then_subtract_empties_region() {
        let mut set = RangeSet::new();
        set.add(128, 512);
        set.subtract(128, 512);
        assert!(set.is_empty());
        assert_eq!(set.total_bytes(), 0);
    }

    #[test]
    fn contained_length_from_reports_tail() {
        let mut set = RangeSet::new();
        set.add(10, 50);
        assert_eq!(set.contained_length_from(10), 40);
        assert_eq!(set.contained_length_from(49), 1);
        assert_eq!(set.contained_length_from(50), 0);
        assert_eq!(set.contained_length_from(0), 0);
    }

    #[test]
    fn contains_range_needs_single_cover() {
        let mut set = RangeSet::new();
        set.add(0, 10);
        set.add(20, 30);
        assert!(set.contains_range(2, 8));
        assert!(set.contains_range(0, 10));
        // Spans the hole.
        assert!(!set.contains_range(5, 25));
        assert!(!set.contains_range(9, 11));
    }

    #[test]
    fn gaps_and_first_gap() {
        let mut set = RangeSet::new();
        set.add(10, 20);
        set.add(30, 40);

        assert_eq!(
            set.gaps(0, 50),
            vec![
                ByteRange::new(0, 10),
                ByteRange::new(20, 30),
                ByteRange::new(40, 50),
            ]
        );
        assert_eq!(set.first_gap(0, 50), Some(ByteRange::new(0, 10)));
        assert_eq!(set.first_gap(10, 20), None);
        assert_eq!(set.gaps(12, 18), vec![]);
    }

    #[test]
    fn random_walk_preserves_invariant() {
        // Deterministic pseudo-random add/subtract sequence.
        let mut set = RangeSet::new();
        let mut x: u64 = 0x2545f491;
        for i in 0..500 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let a = x % 1000;
            let b = a + (x >> 32) % 100;
            if i % 3 == 0 {
                set.subtract(a, b);
            } else {
                set.add(a, b);
            }
            assert_invariant(&set);

            // contains must agree with whether some range covers the point.
            let probe = (x >> 16) % 1100;
            let covered = set.to_vec().iter().any(|r| r.start <= probe && probe < r.end);
            assert_eq!(set.contains(probe), covered);
        }
    }

    #[test]
    fn shared_set_snapshots() {
        let shared = SharedRangeSet::new();
        shared.add(0, 10);
        let snapshot = shared.to_vec();
        shared.add(100, 200);
        assert_eq!(snapshot, vec![ByteRange::new(0, 10)]);
        assert_eq!(shared.count(), 2);
    }
}
