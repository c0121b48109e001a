use crate::base_types::MAX_BLOCK_SIZE;
use crate::tunables::Tunables;
use more_asserts::*;
use serde::{Deserialize, Serialize};
use util::RangeTree;

/// Selects which placement algorithm new metaslabs use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    FirstFit,
    DynamicFit,
    ClusteredFit,
    NearDataFit,
}

const NUM_CURSORS: usize = 64;

/*
 * A placement strategy picks an offset for a new allocation within one
 * metaslab's free-extent tree.  The tree itself is owned and updated by the
 * ExtentIndex; strategies only keep their own cursors and see every change
 * through load/unload/claim/free.
 */
trait StrategyTrait {
    fn load(&mut self, tree: &RangeTree);
    fn unload(&mut self);
    fn alloc(&mut self, tree: &RangeTree, size: u64) -> Option<u64>;
    fn claim(&mut self, _start: u64, _size: u64) {}
    fn free(&mut self, _start: u64, _size: u64) {}
    fn max_size(&self, tree: &RangeTree) -> u64 {
        tree.max_size()
    }
    /// True if this metaslab is a poor candidate to stay active for
    /// requests of `wanted` bytes.
    fn is_fragmented(&self, tree: &RangeTree, wanted: u64) -> bool;
}

/// Natural alignment of a request: its lowest set bit.
fn alignment(size: u64) -> u64 {
    size & size.wrapping_neg()
}

fn round_up(offset: u64, align: u64) -> u64 {
    (offset + align - 1) & !(align - 1)
}

/// Aligned offset within segment (start, seg_size) that fits `size` bytes.
fn fit(start: u64, seg_size: u64, size: u64, align: u64) -> Option<u64> {
    let offset = round_up(start, align);
    if offset + size <= start + seg_size {
        Some(offset)
    } else {
        None
    }
}

#[allow(clippy::cast_possible_truncation)]
fn cursor_slot(size: u64) -> usize {
    alignment(size).trailing_zeros() as usize
}

/// Scans segments in offset order from `cursor`, wrapping around to the
/// start of the tree once.  The cursor is left just past the result.
fn pick_by_offset(tree: &RangeTree, cursor: &mut u64, size: u64, align: u64) -> Option<u64> {
    loop {
        let from = match tree.first_overlapping(*cursor, size) {
            Some((start, _)) => start,
            None => *cursor,
        };
        let found = tree
            .range(from..)
            .find_map(|(&start, &seg_size)| fit(start, seg_size, size, align));
        if let Some(offset) = found {
            *cursor = offset + size;
            return Some(offset);
        }
        if *cursor == 0 {
            return None;
        }
        *cursor = 0;
    }
}

/// Smallest segment of at least `size` bytes that fits after alignment.
fn pick_by_size(tree: &RangeTree, size: u64, align: u64) -> Option<u64> {
    tree.iter_by_size(size)
        .find_map(|(start, seg_size)| fit(start, seg_size, size, align))
}

/// Plain first fit, one cursor per alignment class.
#[derive(Debug)]
pub(crate) struct FirstFit {
    cursors: [u64; NUM_CURSORS],
}

impl FirstFit {
    fn new() -> FirstFit {
        FirstFit {
            cursors: [0; NUM_CURSORS],
        }
    }
}

impl StrategyTrait for FirstFit {
    fn load(&mut self, _tree: &RangeTree) {
        self.cursors = [0; NUM_CURSORS];
    }

    fn unload(&mut self) {
        self.cursors = [0; NUM_CURSORS];
    }

    fn alloc(&mut self, tree: &RangeTree, size: u64) -> Option<u64> {
        let cursor = &mut self.cursors[cursor_slot(size)];
        pick_by_offset(tree, cursor, size, alignment(size))
    }

    fn is_fragmented(&self, _tree: &RangeTree, _wanted: u64) -> bool {
        true
    }
}

/// First fit while there is plenty of contiguous free space, best fit once
/// the metaslab gets full or fragmented.
#[derive(Debug)]
pub(crate) struct DynamicFit {
    cursors: [u64; NUM_CURSORS],
    region_size: u64,
    alloc_threshold: u64,
    free_pct: u64,
}

impl DynamicFit {
    fn use_best_fit(&self, tree: &RangeTree) -> bool {
        let free_pct = tree.space() * 100 / self.region_size;
        tree.max_size() < self.alloc_threshold || free_pct < self.free_pct
    }
}

impl StrategyTrait for DynamicFit {
    fn load(&mut self, _tree: &RangeTree) {
        self.cursors = [0; NUM_CURSORS];
    }

    fn unload(&mut self) {
        self.cursors = [0; NUM_CURSORS];
    }

    fn alloc(&mut self, tree: &RangeTree, size: u64) -> Option<u64> {
        if tree.max_size() < size {
            return None;
        }
        let align = alignment(size);
        let best_fit = self.use_best_fit(tree);
        let cursor = &mut self.cursors[cursor_slot(size)];
        if best_fit {
            let offset = pick_by_size(tree, size, align)?;
            *cursor = offset + size;
            Some(offset)
        } else {
            pick_by_offset(tree, cursor, size, align)
        }
    }

    fn is_fragmented(&self, tree: &RangeTree, _wanted: u64) -> bool {
        self.use_best_fit(tree)
    }
}

/// Carves large clusters out of the biggest free segments and fills them
/// sequentially, so that streams of small writes land contiguously.
#[derive(Debug)]
pub(crate) struct ClusteredFit {
    cursor: u64,
    extent_end: u64,
    min_alloc_size: u64,
}

impl ClusteredFit {
    fn open_cluster(&mut self, tree: &RangeTree, size: u64, align: u64) -> Option<u64> {
        self.cursor = 0;
        self.extent_end = 0;
        let max_size = tree.max_size();
        let cluster_size = if max_size > 2 * MAX_BLOCK_SIZE {
            size.max(self.min_alloc_size.min(max_size))
        } else {
            size
        };
        let (offset, cluster_size) = match pick_by_size(tree, cluster_size, align) {
            Some(offset) => (offset, cluster_size),
            None => (pick_by_size(tree, size, align)?, size),
        };
        self.extent_end = offset + cluster_size;
        self.cursor = offset + size;
        Some(offset)
    }
}

impl StrategyTrait for ClusteredFit {
    fn load(&mut self, _tree: &RangeTree) {
        self.cursor = 0;
        self.extent_end = 0;
    }

    fn unload(&mut self) {
        self.cursor = 0;
        self.extent_end = 0;
    }

    fn alloc(&mut self, tree: &RangeTree, size: u64) -> Option<u64> {
        if tree.max_size() < size {
            return None;
        }
        assert_ge!(self.extent_end, self.cursor);
        let align = alignment(size);

        let offset = round_up(self.cursor, align);
        if self.extent_end != 0 && offset + size <= self.extent_end && tree.contains(offset, size)
        {
            self.cursor = offset + size;
            return Some(offset);
        }
        self.open_cluster(tree, size, align)
    }

    fn claim(&mut self, start: u64, size: u64) {
        // A claim inside the open cluster would leave the cursor pointing
        // at allocated space.
        if start < self.extent_end && start + size > self.cursor {
            self.cursor = 0;
            self.extent_end = 0;
        }
    }

    fn is_fragmented(&self, tree: &RangeTree, _wanted: u64) -> bool {
        tree.max_size() <= self.min_alloc_size * 10
    }
}

/// Allocates close to the previous allocation of the same size class,
/// falling back to a size-bounded clump elsewhere in the metaslab.
#[derive(Debug)]
pub(crate) struct NearDataFit {
    cursors: [u64; NUM_CURSORS],
    clump_shift: u32,
    min_alloc_size: u64,
}

impl StrategyTrait for NearDataFit {
    fn load(&mut self, _tree: &RangeTree) {
        self.cursors = [0; NUM_CURSORS];
    }

    fn unload(&mut self) {
        self.cursors = [0; NUM_CURSORS];
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc(&mut self, tree: &RangeTree, size: u64) -> Option<u64> {
        let max_size = tree.max_size();
        if max_size < size {
            return None;
        }
        assert_ne!(size, 0);
        let align = alignment(size);
        let size_class = 63 - size.leading_zeros();
        let cursor = &mut self.cursors[size_class as usize];

        if let Some(offset) = tree
            .first_overlapping(*cursor, size)
            .and_then(|(start, seg_size)| fit(start, seg_size, size, align))
        {
            *cursor = offset + size;
            return Some(offset);
        }

        let clump_shift = (size_class + 1 + self.clump_shift).min(63);
        let clump = max_size.min(1 << clump_shift);
        let offset = tree
            .iter_by_size(clump)
            .find_map(|(start, seg_size)| fit(start, seg_size, size, align))?;
        *cursor = offset + size;
        Some(offset)
    }

    fn is_fragmented(&self, tree: &RangeTree, wanted: u64) -> bool {
        let max_size = tree.max_size();
        max_size <= self.min_alloc_size << self.clump_shift && max_size <= wanted
    }
}

pub(crate) enum Strategy {
    FirstFit(FirstFit),
    DynamicFit(DynamicFit),
    ClusteredFit(ClusteredFit),
    NearDataFit(NearDataFit),
}

impl Strategy {
    pub(crate) fn new(kind: StrategyKind, tunables: &Tunables, region_size: u64) -> Strategy {
        assert_gt!(region_size, 0);
        match kind {
            StrategyKind::FirstFit => Strategy::FirstFit(FirstFit::new()),
            StrategyKind::DynamicFit => Strategy::DynamicFit(DynamicFit {
                cursors: [0; NUM_CURSORS],
                region_size,
                alloc_threshold: tunables.df_alloc_threshold,
                free_pct: tunables.df_free_pct,
            }),
            StrategyKind::ClusteredFit => Strategy::ClusteredFit(ClusteredFit {
                cursor: 0,
                extent_end: 0,
                min_alloc_size: tunables.min_alloc_size,
            }),
            StrategyKind::NearDataFit => Strategy::NearDataFit(NearDataFit {
                cursors: [0; NUM_CURSORS],
                clump_shift: tunables.ndf_clump_shift,
                min_alloc_size: tunables.min_alloc_size,
            }),
        }
    }

    fn with_trait_mut<R, F>(&mut self, cb: F) -> R
    where
        F: FnOnce(&mut dyn StrategyTrait) -> R,
    {
        match self {
            Strategy::FirstFit(t) => cb(t),
            Strategy::DynamicFit(t) => cb(t),
            Strategy::ClusteredFit(t) => cb(t),
            Strategy::NearDataFit(t) => cb(t),
        }
    }

    fn with_trait<R, F>(&self, cb: F) -> R
    where
        F: FnOnce(&dyn StrategyTrait) -> R,
    {
        match self {
            Strategy::FirstFit(t) => cb(t),
            Strategy::DynamicFit(t) => cb(t),
            Strategy::ClusteredFit(t) => cb(t),
            Strategy::NearDataFit(t) => cb(t),
        }
    }

    pub(crate) fn kind(&self) -> StrategyKind {
        match self {
            Strategy::FirstFit(_) => StrategyKind::FirstFit,
            Strategy::DynamicFit(_) => StrategyKind::DynamicFit,
            Strategy::ClusteredFit(_) => StrategyKind::ClusteredFit,
            Strategy::NearDataFit(_) => StrategyKind::NearDataFit,
        }
    }

    pub(crate) fn load(&mut self, tree: &RangeTree) {
        self.with_trait_mut(|s| s.load(tree))
    }

    pub(crate) fn unload(&mut self) {
        self.with_trait_mut(|s| s.unload())
    }

    /// Picks an offset for `size` bytes.  The caller removes the result
    /// from `tree`.
    pub(crate) fn alloc(&mut self, tree: &RangeTree, size: u64) -> Option<u64> {
        assert_gt!(size, 0);
        let offset = self.with_trait_mut(|s| s.alloc(tree, size))?;
        debug_assert!(tree.contains(offset, size));
        Some(offset)
    }

    pub(crate) fn claim(&mut self, start: u64, size: u64) {
        self.with_trait_mut(|s| s.claim(start, size))
    }

    pub(crate) fn free(&mut self, start: u64, size: u64) {
        self.with_trait_mut(|s| s.free(start, size))
    }

    pub(crate) fn max_size(&self, tree: &RangeTree) -> u64 {
        self.with_trait(|s| s.max_size(tree))
    }

    pub(crate) fn is_fragmented(&self, tree: &RangeTree, wanted: u64) -> bool {
        self.with_trait(|s| s.is_fragmented(tree, wanted))
    }
}
