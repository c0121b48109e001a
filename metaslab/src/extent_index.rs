use crate::error::{MetaslabError, Result};
use crate::space_map::{SpaceMapEntry, SpaceMapExtent};
use crate::strategy::Strategy;
use log::*;
use more_asserts::*;
use util::RangeTree;

/// In-core index of one metaslab's free extents.  Only meaningful while
/// loaded; unloading discards the tree, which is rebuilt from the
/// persisted log on the next load.
pub(crate) struct ExtentIndex {
    start: u64,
    size: u64,
    tree: RangeTree,
    strategy: Strategy,
    loaded: bool,
}

impl ExtentIndex {
    pub(crate) fn new(start: u64, size: u64, strategy: Strategy) -> ExtentIndex {
        ExtentIndex {
            start,
            size,
            tree: RangeTree::new(),
            strategy,
            loaded: false,
        }
    }

    fn verify_in_region(&self, offset: u64, size: u64) -> Result<()> {
        if size == 0 || offset < self.start || offset + size > self.start + self.size {
            return Err(MetaslabError::CorruptIndexState(format!(
                "extent [{:#x}, {:#x}) is outside region [{:#x}, {:#x})",
                offset,
                offset + size,
                self.start,
                self.start + self.size
            )));
        }
        Ok(())
    }

    fn replay(&mut self, entries: &[SpaceMapEntry]) -> Result<()> {
        self.tree.add(self.start, self.size);
        for entry in entries {
            match *entry {
                SpaceMapEntry::Alloc(SpaceMapExtent { offset, size }) => {
                    self.verify_in_region(offset, size)?;
                    if !self.tree.contains(offset, size) {
                        return Err(MetaslabError::CorruptIndexState(format!(
                            "log allocates [{:#x}, {:#x}) which is not free",
                            offset,
                            offset + size
                        )));
                    }
                    self.tree.remove(offset, size);
                }
                SpaceMapEntry::Free(SpaceMapExtent { offset, size }) => {
                    self.verify_in_region(offset, size)?;
                    if self.tree.overlaps(offset, size) {
                        return Err(MetaslabError::CorruptIndexState(format!(
                            "log frees [{:#x}, {:#x}) which is already free",
                            offset,
                            offset + size
                        )));
                    }
                    self.tree.add(offset, size);
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the free tree by replaying `entries` over an all-free
    /// region.  On error the index stays unloaded.
    pub(crate) fn load(&mut self, entries: &[SpaceMapEntry]) -> Result<()> {
        assert!(!self.loaded);
        assert!(self.tree.is_empty());
        if let Err(e) = self.replay(entries) {
            self.tree.clear();
            return Err(e);
        }
        self.strategy.load(&self.tree);
        self.loaded = true;
        trace!(
            "loaded {:?} index [{:#x}, {:#x}): {} entries, {} free in {} segments",
            self.strategy.kind(),
            self.start,
            self.start + self.size,
            entries.len(),
            self.tree.space(),
            self.tree.len()
        );
        Ok(())
    }

    pub(crate) fn unload(&mut self) {
        self.strategy.unload();
        self.tree.clear();
        self.loaded = false;
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn alloc(&mut self, size: u64) -> Option<u64> {
        assert!(self.loaded);
        let offset = self.strategy.alloc(&self.tree, size)?;
        assert_ge!(offset, self.start);
        self.tree.remove(offset, size);
        Some(offset)
    }

    /// Marks a specific extent allocated.
    pub(crate) fn claim(&mut self, offset: u64, size: u64) -> Result<()> {
        assert!(self.loaded);
        if !self.tree.contains(offset, size) {
            return Err(MetaslabError::CorruptIndexState(format!(
                "claim of [{:#x}, {:#x}) which is not free",
                offset,
                offset + size
            )));
        }
        self.tree.remove(offset, size);
        self.strategy.claim(offset, size);
        Ok(())
    }

    /// Returns an extent to the free tree.
    pub(crate) fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        assert!(self.loaded);
        self.verify_in_region(offset, size)?;
        if self.tree.overlaps(offset, size) {
            return Err(MetaslabError::CorruptIndexState(format!(
                "free of [{:#x}, {:#x}) which is already free",
                offset,
                offset + size
            )));
        }
        self.tree.add(offset, size);
        self.strategy.free(offset, size);
        Ok(())
    }

    pub(crate) fn contains(&self, offset: u64, size: u64) -> bool {
        self.tree.contains(offset, size)
    }

    pub(crate) fn tree(&self) -> &RangeTree {
        &self.tree
    }

    /// Largest contiguous free extent; 0 when unloaded.
    pub(crate) fn max_size(&self) -> u64 {
        if self.loaded {
            self.strategy.max_size(&self.tree)
        } else {
            0
        }
    }

    pub(crate) fn space(&self) -> u64 {
        self.tree.space()
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.tree.len()
    }

    pub(crate) fn is_fragmented(&self, wanted: u64) -> bool {
        self.strategy.is_fragmented(&self.tree, wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyKind;
    use crate::tunables::Tunables;

    const START: u64 = 1 << 20;
    const SIZE: u64 = 1 << 20;

    fn index() -> ExtentIndex {
        let strategy = Strategy::new(StrategyKind::FirstFit, &Tunables::default(), SIZE);
        ExtentIndex::new(START, SIZE, strategy)
    }

    #[test]
    fn test_load_replays_log() {
        let mut index = index();
        index
            .load(&[
                SpaceMapEntry::alloc(START, 8192),
                SpaceMapEntry::free(START + 4096, 4096),
                SpaceMapEntry::alloc(START + SIZE - 512, 512),
            ])
            .unwrap();
        assert!(index.is_loaded());
        assert_eq!(index.space(), SIZE - 4096 - 512);
        assert!(index.contains(START + 4096, 4096));
        assert!(!index.contains(START, 512));
        assert_eq!(index.max_size(), SIZE - 4096 - 512);
        index.unload();
        assert!(!index.is_loaded());
        assert_eq!(index.max_size(), 0);
        assert_eq!(index.space(), 0);
    }

    #[test]
    fn test_load_rejects_double_free() {
        let mut index = index();
        let err = index
            .load(&[
                SpaceMapEntry::alloc(START, 4096),
                SpaceMapEntry::free(START, 4096),
                SpaceMapEntry::free(START, 4096),
            ])
            .unwrap_err();
        assert!(matches!(err, MetaslabError::CorruptIndexState(_)));
        assert!(!index.is_loaded());
        // A failed load leaves nothing behind, so a clean load still works.
        index.load(&[]).unwrap();
        assert_eq!(index.space(), SIZE);
    }

    #[test]
    fn test_load_rejects_foreign_extent() {
        let mut index = index();
        let err = index
            .load(&[SpaceMapEntry::alloc(START - 512, 1024)])
            .unwrap_err();
        assert!(matches!(err, MetaslabError::CorruptIndexState(_)));
    }

    #[test]
    fn test_alloc_claim_free() {
        let mut index = index();
        index.load(&[]).unwrap();
        assert_eq!(index.alloc(4096), Some(START));
        index.claim(START + 8192, 4096).unwrap();
        assert!(index.claim(START + 8192, 512).is_err());
        index.free(START, 4096).unwrap();
        assert!(index.free(START, 512).is_err());
        assert_eq!(index.space(), SIZE - 4096);
        assert_eq!(index.num_segments(), 2);
        assert!(index.alloc(SIZE).is_none());
    }
}
