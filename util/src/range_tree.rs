use more_asserts::*;
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeBounds;

/// A set of disjoint, coalesced `[start, start + size)` segments.
///
/// Segments are indexed twice: by offset (for first-fit style scans and
/// neighbor merging) and by (size, start) (for best-fit style scans and for
/// answering "largest contiguous segment" in O(log n)).
#[derive(Default, Debug, Clone)]
pub struct RangeTree {
    tree: BTreeMap<u64, u64>, // start -> size
    by_size: BTreeSet<(u64, u64)>, // (size, start)
    space: u64,
}

impl RangeTree {
    pub fn new() -> RangeTree {
        RangeTree {
            tree: BTreeMap::new(),
            by_size: BTreeSet::new(),
            space: 0,
        }
    }

    fn insert_segment(&mut self, start: u64, size: u64) {
        self.tree.insert(start, size);
        self.by_size.insert((size, start));
    }

    fn remove_segment(&mut self, start: u64, size: u64) {
        self.tree.remove(&start);
        let removed = self.by_size.remove(&(size, start));
        assert!(removed, "size index out of sync at [{}, {})", start, start + size);
    }

    // panics if any part is already present
    pub fn add(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }

        let end = start + size;
        let before = self.tree.range(..end).next_back().map(|(&s, &z)| (s, z));
        let after = self.tree.range(start..).next().map(|(&s, &z)| (s, z));

        let merge_before = match before {
            Some((before_start, before_size)) => {
                assert_le!(before_start + before_size, start);
                before_start + before_size == start
            }
            None => false,
        };

        let merge_after = match after {
            Some((after_start, _)) => {
                assert_ge!(after_start, end);
                after_start == end
            }
            None => false,
        };

        match (before, after) {
            (Some((before_start, before_size)), Some((after_start, after_size)))
                if merge_before && merge_after =>
            {
                self.remove_segment(before_start, before_size);
                self.remove_segment(after_start, after_size);
                self.insert_segment(before_start, before_size + size + after_size);
            }
            (Some((before_start, before_size)), _) if merge_before => {
                self.remove_segment(before_start, before_size);
                self.insert_segment(before_start, before_size + size);
            }
            (_, Some((after_start, after_size))) if merge_after => {
                self.remove_segment(after_start, after_size);
                self.insert_segment(start, size + after_size);
            }
            _ => self.insert_segment(start, size),
        }
        self.space += size;
    }

    // panics if not entirely present in a single segment
    pub fn remove(&mut self, start: u64, size: u64) {
        assert_ne!(size, 0);

        let end = start + size;
        let (existing_start, existing_size) = match self.tree.range(..end).next_back() {
            Some((&s, &z)) => (s, z),
            None => panic!("range_tree segment [{}, {}) is not present", start, end),
        };
        let existing_end = existing_start + existing_size;
        assert_le!(existing_start, start);
        assert_ge!(existing_end, end);

        self.remove_segment(existing_start, existing_size);
        if existing_start != start {
            self.insert_segment(existing_start, start - existing_start);
        }
        if existing_end != end {
            self.insert_segment(end, existing_end - end);
        }
        self.space -= size;
    }

    /// True if `[start, start + size)` lies entirely within one segment.
    pub fn contains(&self, start: u64, size: u64) -> bool {
        match self.tree.range(..=start).next_back() {
            Some((&s, &z)) => s <= start && start + size <= s + z,
            None => false,
        }
    }

    /// True if any byte of `[start, start + size)` is present.
    pub fn overlaps(&self, start: u64, size: u64) -> bool {
        size != 0 && self.first_overlapping(start, size).is_some()
    }

    /// Returns the lowest segment intersecting `[start, start + size)` as
    /// (start, size).
    pub fn first_overlapping(&self, start: u64, size: u64) -> Option<(u64, u64)> {
        if let Some((&s, &z)) = self.tree.range(..=start).next_back() {
            if s + z > start {
                return Some((s, z));
            }
        }
        self.tree
            .range(start..start + size)
            .next()
            .map(|(&s, &z)| (s, z))
    }

    /// Returns Iter<start, size>
    pub fn iter(&self) -> btree_map::Iter<u64, u64> {
        self.tree.iter()
    }

    pub fn range<R>(&self, range: R) -> btree_map::Range<'_, u64, u64>
    where
        R: RangeBounds<u64>,
    {
        self.tree.range(range)
    }

    /// Iterates (start, size) in ascending size order (ties by start),
    /// beginning with the smallest segment of at least `min_size` bytes.
    pub fn iter_by_size(&self, min_size: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_size
            .range((min_size, 0)..)
            .map(|&(size, start)| (start, size))
    }

    /// Size of the largest segment, or 0 when empty.
    pub fn max_size(&self) -> u64 {
        self.by_size
            .iter()
            .next_back()
            .map_or(0, |&(size, _)| size)
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.by_size.clear();
        self.space = 0;
    }

    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn verify_space(&self) {
        assert_eq!(self.space, self.tree.values().sum::<u64>());
        assert_eq!(self.tree.len(), self.by_size.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(rt: &RangeTree) -> Vec<(u64, u64)> {
        rt.iter().map(|(&s, &z)| (s, z)).collect()
    }

    #[test]
    fn test_add_coalesces_neighbors() {
        let mut rt = RangeTree::new();
        rt.add(0, 10);
        rt.add(20, 10);
        assert_eq!(segments(&rt), vec![(0, 10), (20, 10)]);
        rt.add(10, 10);
        assert_eq!(segments(&rt), vec![(0, 30)]);
        assert_eq!(rt.space(), 30);
        assert_eq!(rt.max_size(), 30);
        rt.verify_space();
    }

    #[test]
    fn test_remove_splits_segment() {
        let mut rt = RangeTree::new();
        rt.add(100, 100);
        rt.remove(120, 10);
        assert_eq!(segments(&rt), vec![(100, 20), (130, 70)]);
        rt.remove(100, 20);
        rt.remove(190, 10);
        assert_eq!(segments(&rt), vec![(130, 60)]);
        assert_eq!(rt.space(), 60);
        rt.verify_space();
    }

    #[test]
    fn test_size_index_order() {
        let mut rt = RangeTree::new();
        rt.add(0, 30);
        rt.add(100, 10);
        rt.add(200, 20);
        rt.add(300, 10);
        let by_size: Vec<_> = rt.iter_by_size(0).collect();
        assert_eq!(by_size, vec![(100, 10), (300, 10), (200, 20), (0, 30)]);
        let at_least_15: Vec<_> = rt.iter_by_size(15).collect();
        assert_eq!(at_least_15, vec![(200, 20), (0, 30)]);
        assert_eq!(rt.max_size(), 30);
    }

    #[test]
    fn test_contains_and_overlaps() {
        let mut rt = RangeTree::new();
        rt.add(10, 10);
        rt.add(40, 10);
        assert!(rt.contains(10, 10));
        assert!(rt.contains(12, 3));
        assert!(!rt.contains(15, 10));
        assert!(!rt.contains(0, 5));
        assert!(rt.overlaps(15, 10));
        assert!(rt.overlaps(0, 11));
        assert!(rt.overlaps(30, 20));
        assert!(!rt.overlaps(20, 20));
        assert!(!rt.overlaps(50, 100));
        assert_eq!(rt.first_overlapping(0, 100), Some((10, 10)));
        assert_eq!(rt.first_overlapping(25, 100), Some((40, 10)));
    }

    #[test]
    #[should_panic]
    fn test_double_add_panics() {
        let mut rt = RangeTree::new();
        rt.add(0, 10);
        rt.add(5, 10);
    }

    #[test]
    #[should_panic]
    fn test_remove_absent_panics() {
        let mut rt = RangeTree::new();
        rt.add(0, 10);
        rt.remove(5, 10);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut rt = RangeTree::new();
        rt.add(0, 10);
        rt.add(50, 10);
        rt.clear();
        assert!(rt.is_empty());
        assert_eq!(rt.space(), 0);
        assert_eq!(rt.max_size(), 0);
        assert_eq!(rt.iter_by_size(0).count(), 0);
    }
}
