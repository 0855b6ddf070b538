//! Free-space index
//!
//! [`RangeTree`] is the ordered, coalescing range set used both as each block
//! group's free-extent index ([`FreeSpaceCtl`]) and as the pinned/excluded
//! extent bitmaps. [`FreeCluster`] reserves a window of a group's free space
//! for one allocation class so that consecutive allocations land together.

use super::{BtrfsError, Result};
use std::collections::BTreeMap;

/// Rounds `value` up to a multiple of `align` (a power of two, or 0/1)
#[inline]
pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

/// Ordered set of disjoint `[start, end)` byte ranges
///
/// Adjacent and overlapping insertions coalesce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeTree {
    // start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
    total: u64,
}

impl RangeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes covered
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.total = 0;
    }

    /// Marks `[start, start + len)`, merging with whatever it touches
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + len;

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
                self.ranges.remove(&s);
                self.total -= e - s;
            }
        }
        loop {
            let next = self
                .ranges
                .range(new_start..)
                .next()
                .map(|(&s, &e)| (s, e));
            match next {
                Some((s, e)) if s <= new_end => {
                    new_end = new_end.max(e);
                    self.ranges.remove(&s);
                    self.total -= e - s;
                }
                _ => break,
            }
        }
        self.ranges.insert(new_start, new_end);
        self.total += new_end - new_start;
    }

    /// Clears `[start, start + len)`, returning the number of bytes removed
    pub fn remove(&mut self, start: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let end = start + len;
        let mut removed = 0;

        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            self.total -= e - s;
            if s < start {
                self.ranges.insert(s, start);
                self.total += start - s;
            }
            if e > end {
                self.ranges.insert(end, e);
                self.total += e - end;
            }
            removed += e.min(end) - s.max(start);
        }
        removed
    }

    /// True if every byte of the range is covered
    pub fn contains(&self, start: u64, len: u64) -> bool {
        match self.ranges.range(..=start).next_back() {
            Some((_, &e)) => e >= start + len,
            None => false,
        }
    }

    /// True if any byte of the range is covered
    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start + len;
        self.ranges
            .range(..end)
            .next_back()
            .is_some_and(|(_, &e)| e > start)
    }

    /// First range that ends after `pos`, clipped to start no earlier than `pos`
    pub fn first_from(&self, pos: u64) -> Option<(u64, u64)> {
        if let Some((&s, &e)) = self.ranges.range(..=pos).next_back() {
            if e > pos {
                return Some((s.max(pos), e));
            }
        }
        self.ranges
            .range(pos..)
            .next()
            .map(|(&s, &e)| (s, e))
    }

    /// Iterates `(start, end)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// Iterates ranges that intersect `[start, end)`, clipped to it
    pub fn iter_within(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        let first = self
            .ranges
            .range(..=start)
            .next_back()
            .filter(|&(_, &e)| e > start)
            .map(|(&s, _)| s)
            .unwrap_or(start);
        self.ranges
            .range(first..end)
            .map(move |(&s, &e)| (s.max(start), e.min(end)))
            .filter(|(s, e)| s < e)
    }
}

/// Free-extent index of one block group
#[derive(Debug, Clone, Default)]
pub struct FreeSpaceCtl {
    free: RangeTree,
}

impl FreeSpaceCtl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total free bytes indexed
    pub fn free_space(&self) -> u64 {
        self.free.total()
    }

    /// Number of free extents
    pub fn extent_count(&self) -> usize {
        self.free.len()
    }

    /// Largest contiguous free extent
    pub fn largest_extent(&self) -> u64 {
        self.free.iter().map(|(s, e)| e - s).max().unwrap_or(0)
    }

    /// Returns a range to the index
    pub fn add_free_space(&mut self, start: u64, len: u64) -> Result<()> {
        if self.free.overlaps(start, len) {
            return Err(BtrfsError::Corrupt(format!(
                "free space [{}, {}) added twice",
                start,
                start + len
            )));
        }
        self.free.insert(start, len);
        Ok(())
    }

    /// Removes a range that must be entirely free
    pub fn remove_free_space(&mut self, start: u64, len: u64) -> Result<()> {
        if !self.free.contains(start, len) {
            return Err(BtrfsError::Corrupt(format!(
                "removing [{}, {}) which is not free",
                start,
                start + len
            )));
        }
        self.free.remove(start, len);
        Ok(())
    }

    /// Removes whatever part of the range is free
    pub fn remove_overlap(&mut self, start: u64, len: u64) -> u64 {
        self.free.remove(start, len)
    }

    /// True if the whole range is free
    pub fn is_free(&self, start: u64, len: u64) -> bool {
        self.free.contains(start, len)
    }

    /// First-fit search at or after `search_start`
    ///
    /// The candidate must hold `bytes + empty_size` after aligning its start;
    /// only `bytes` are taken out of the index.
    pub fn find_space_for_alloc(
        &mut self,
        search_start: u64,
        bytes: u64,
        empty_size: u64,
        align: u64,
    ) -> Option<u64> {
        let want = bytes + empty_size;
        let found = self
            .free
            .iter_within(search_start, u64::MAX)
            .find_map(|(s, e)| {
                let aligned = align_up(s, align);
                (aligned + want <= e).then_some(aligned)
            })?;
        self.free.remove(found, bytes);
        Some(found)
    }

    /// Drains the index
    pub fn take_all(&mut self) -> RangeTree {
        std::mem::take(&mut self.free)
    }

    /// Snapshot of the free ranges as `(start, len)`
    pub fn entries(&self) -> Vec<(u64, u64)> {
        self.free.iter().map(|(s, e)| (s, e - s)).collect()
    }

    pub fn ranges(&self) -> &RangeTree {
        &self.free
    }
}

/// A window of free space set aside for one allocation class
#[derive(Debug, Default)]
pub struct FreeCluster {
    /// Start of the block group the window was carved from
    block_group: Option<u64>,
    window_start: u64,
    ranges: RangeTree,
}

impl FreeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block group owning the window, if any
    pub fn block_group(&self) -> Option<u64> {
        self.block_group
    }

    /// Locality hint for the next allocation
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    /// Bytes left in the window
    pub fn free_space(&self) -> u64 {
        self.ranges.total()
    }

    /// Moves free extents from `ctl` into the window
    ///
    /// Extents smaller than `min_bytes` are skipped; the window is built only
    /// if the gathered space reaches `bytes + empty_size`.
    pub fn refill(
        &mut self,
        ctl: &mut FreeSpaceCtl,
        block_group: u64,
        search_start: u64,
        bytes: u64,
        empty_size: u64,
        min_bytes: u64,
    ) -> bool {
        let target = bytes + empty_size;
        let mut picked = Vec::new();
        let mut total = 0;
        let mut has_fit = false;

        for (s, e) in ctl.ranges().iter_within(search_start, u64::MAX) {
            let len = e - s;
            if len < min_bytes {
                continue;
            }
            has_fit |= len >= bytes;
            picked.push((s, len));
            total += len;
            if total >= target && has_fit {
                break;
            }
        }
        if total < target || !has_fit {
            return false;
        }

        for &(s, len) in &picked {
            ctl.remove_overlap(s, len);
            self.ranges.insert(s, len);
        }
        self.block_group = Some(block_group);
        self.window_start = picked[0].0;
        true
    }

    /// First-fit allocation from the window
    pub fn alloc(&mut self, bytes: u64, align: u64) -> Option<u64> {
        let found = self.ranges.iter().find_map(|(s, e)| {
            let aligned = align_up(s, align);
            (aligned + bytes <= e).then_some(aligned)
        })?;
        self.ranges.remove(found, bytes);
        self.window_start = found + bytes;
        Some(found)
    }

    /// Hands the whole window back to its group's index
    pub fn return_to(&mut self, ctl: &mut FreeSpaceCtl) -> Result<()> {
        for (s, e) in self.ranges.iter() {
            ctl.add_free_space(s, e - s)?;
        }
        self.reset();
        Ok(())
    }

    /// Forgets the window without returning its space
    pub fn reset(&mut self) -> RangeTree {
        self.block_group = None;
        self.window_start = 0;
        std::mem::take(&mut self.ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(17, 1), 17);
    }

    #[test]
    fn test_range_tree_merges() {
        let mut t = RangeTree::new();
        t.insert(0, 10);
        t.insert(20, 10);
        assert_eq!(t.len(), 2);
        t.insert(10, 10);
        assert_eq!(t.len(), 1);
        assert_eq!(t.total(), 30);
        t.insert(5, 30);
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![(0, 35)]);
        assert_eq!(t.total(), 35);
    }

    #[test]
    fn test_range_tree_remove_splits() {
        let mut t = RangeTree::new();
        t.insert(0, 100);
        assert_eq!(t.remove(40, 20), 20);
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![(0, 40), (60, 100)]);
        assert_eq!(t.remove(30, 40), 20);
        assert_eq!(t.total(), 60);
        assert!(t.contains(0, 30));
        assert!(!t.contains(0, 31));
        assert!(t.overlaps(25, 10));
        assert!(!t.overlaps(30, 40));
    }

    #[test]
    fn test_range_tree_first_from() {
        let mut t = RangeTree::new();
        t.insert(100, 50);
        t.insert(300, 50);
        assert_eq!(t.first_from(0), Some((100, 150)));
        assert_eq!(t.first_from(120), Some((120, 150)));
        assert_eq!(t.first_from(150), Some((300, 350)));
        assert_eq!(t.first_from(350), None);
        let within: Vec<_> = t.iter_within(120, 320).collect();
        assert_eq!(within, vec![(120, 150), (300, 320)]);
    }

    #[test]
    fn test_ctl_find_space_aligned() {
        let mut ctl = FreeSpaceCtl::new();
        ctl.add_free_space(1000, 100_000).unwrap();
        let start = ctl.find_space_for_alloc(0, 4096, 0, 4096).unwrap();
        assert_eq!(start, 4096);
        assert!(!ctl.is_free(4096, 4096));
        assert!(ctl.is_free(1000, 3096));
        assert_eq!(ctl.free_space(), 100_000 - 4096);
    }

    #[test]
    fn test_ctl_empty_size_slack() {
        let mut ctl = FreeSpaceCtl::new();
        ctl.add_free_space(0, 8192).unwrap();
        ctl.add_free_space(65536, 65536).unwrap();
        let start = ctl.find_space_for_alloc(0, 4096, 16384, 4096).unwrap();
        assert_eq!(start, 65536);
        assert!(ctl.find_space_for_alloc(0, 1 << 20, 0, 4096).is_none());
    }

    #[test]
    fn test_ctl_double_add_and_bad_remove() {
        let mut ctl = FreeSpaceCtl::new();
        ctl.add_free_space(0, 4096).unwrap();
        assert!(matches!(ctl.add_free_space(2048, 4096), Err(BtrfsError::Corrupt(_))));
        assert!(ctl.remove_free_space(0, 8192).is_err());
        ctl.remove_free_space(0, 4096).unwrap();
        assert_eq!(ctl.free_space(), 0);
    }

    #[test]
    fn test_cluster_refill_alloc_return() {
        let mut ctl = FreeSpaceCtl::new();
        ctl.add_free_space(0, 1 << 20).unwrap();
        let mut cluster = FreeCluster::new();
        assert!(cluster.refill(&mut ctl, 0, 0, 16384, 65536, 4096));
        assert_eq!(cluster.block_group(), Some(0));
        assert_eq!(ctl.free_space() + cluster.free_space(), 1 << 20);

        let a = cluster.alloc(16384, 4096).unwrap();
        let b = cluster.alloc(16384, 4096).unwrap();
        assert_eq!(b, a + 16384);
        assert_eq!(cluster.window_start(), b + 16384);

        cluster.return_to(&mut ctl).unwrap();
        assert_eq!(cluster.block_group(), None);
        assert_eq!(ctl.free_space(), (1 << 20) - 32768);
    }

    #[test]
    fn test_cluster_refill_fails_without_space() {
        let mut ctl = FreeSpaceCtl::new();
        ctl.add_free_space(0, 4096).unwrap();
        let mut cluster = FreeCluster::new();
        assert!(!cluster.refill(&mut ctl, 0, 0, 16384, 0, 4096));
        assert_eq!(ctl.free_space(), 4096);
    }
}
