use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// Closed, non-overlapping, non-adjacent byte intervals keyed by their start.
///
/// Adjacent or overlapping insertions are always merged, so two stored
/// intervals are separated by at least one uncovered byte.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `[begin, begin + length - 1]`, merging with touching intervals.
    ///
    /// Returns `false` when the range is already covered by a single
    /// interval (or is empty).
    pub fn add_interval(&mut self, begin: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = begin + length - 1;

        if let Some((&start, &stop)) = self.intervals.range(..=begin).next_back() {
            if start <= begin && stop >= end {
                return false;
            }
        }

        // Every interval starting at or before end + 1 and reaching begin - 1
        // touches the new one; they are contiguous in key order.
        let mut merged_begin = begin;
        let mut merged_end = end;
        let mut absorbed = Vec::new();
        for (&start, &stop) in self.intervals.range(..=end.saturating_add(1)).rev() {
            if stop.saturating_add(1) < begin {
                break;
            }
            merged_begin = merged_begin.min(start);
            merged_end = merged_end.max(stop);
            absorbed.push(start);
        }

        for start in absorbed {
            self.intervals.remove(&start);
        }
        self.intervals.insert(merged_begin, merged_end);
        true
    }

    /// Removes `[begin, begin + length - 1]` from the set.
    ///
    /// Intervals straddling either edge are shrunk. Returns `false` if
    /// nothing intersected the range.
    pub fn remove_intervals(&mut self, begin: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = begin + length - 1;

        let hit: Vec<(u64, u64)> = self
            .intervals
            .range(..=end)
            .rev()
            .take_while(|(_, &stop)| stop >= begin)
            .map(|(&start, &stop)| (start, stop))
            .collect();

        if hit.is_empty() {
            return false;
        }

        for (start, stop) in hit {
            self.intervals.remove(&start);
            if start < begin {
                self.intervals.insert(start, begin - 1);
            }
            if stop > end {
                self.intervals.insert(end + 1, stop);
            }
        }
        true
    }

    /// Smallest offset `>= point` not covered by any interval.
    pub fn next_free_point(&self, point: u64) -> u64 {
        match self.intervals.range(..=point).next_back() {
            Some((_, &stop)) if stop >= point => stop + 1,
            _ => point,
        }
    }

    /// True iff `[begin, begin + length - 1]` lies inside one stored interval.
    ///
    /// An empty range is always contained.
    pub fn contains_interval(&self, begin: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        let end = begin + length - 1;
        matches!(self.intervals.range(..=begin).next_back(), Some((_, &stop)) if stop >= end)
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Total number of covered bytes.
    pub fn covered_bytes(&self) -> u64 {
        self.intervals.iter().map(|(start, stop)| stop - start + 1).sum()
    }

    /// Copy of the stored intervals as `(begin, end)` pairs, in order.
    pub fn to_vec(&self) -> Vec<(u64, u64)> {
        self.intervals.iter().map(|(&s, &e)| (s, e)).collect()
    }
}

/// Thread-safe allocator recording which byte ranges of a torrent are written.
///
/// Each call takes the instance lock once. Use [`ByteRangeAllocator::lock`]
/// when several calls have to run in the same critical section.
#[derive(Debug, Default)]
pub struct ByteRangeAllocator {
    inner: Mutex<IntervalSet>,
}

impl ByteRangeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interval(&self, begin: u64, length: u64) -> bool {
        self.inner.lock().add_interval(begin, length)
    }

    pub fn remove_intervals(&self, begin: u64, length: u64) -> bool {
        self.inner.lock().remove_intervals(begin, length)
    }

    pub fn next_free_point(&self, point: u64) -> u64 {
        self.inner.lock().next_free_point(point)
    }

    pub fn contains_interval(&self, begin: u64, length: u64) -> bool {
        self.inner.lock().contains_interval(begin, length)
    }

    pub fn covered_bytes(&self) -> u64 {
        self.inner.lock().covered_bytes()
    }

    /// Copy of the stored intervals.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        self.inner.lock().to_vec()
    }

    /// Holds the allocator lock until the guard is dropped.
    pub fn lock(&self) -> AllocatorGuard<'_> {
        AllocatorGuard(self.inner.lock())
    }
}

/// Exclusive access to an allocator across several operations.
pub struct AllocatorGuard<'a>(MutexGuard<'a, IntervalSet>);

impl Deref for AllocatorGuard<'_> {
    type Target = IntervalSet;

    fn deref(&self) -> &IntervalSet {
        &self.0
    }
}

impl DerefMut for AllocatorGuard<'_> {
    fn deref_mut(&mut self) -> &mut IntervalSet {
        &mut self.0
    }
}
