use crate::base_types::OnDisk;
use anyhow::{anyhow, Result};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use util::RangeTree;

/// Bytes one log entry occupies in a persisted log.
pub const SPACE_MAP_ENTRY_SIZE: u64 = 8;

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub struct SpaceMapExtent {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
pub enum SpaceMapEntry {
    Alloc(SpaceMapExtent),
    Free(SpaceMapExtent),
}
impl OnDisk for SpaceMapEntry {}

impl SpaceMapEntry {
    pub fn alloc(offset: u64, size: u64) -> SpaceMapEntry {
        SpaceMapEntry::Alloc(SpaceMapExtent { offset, size })
    }

    pub fn free(offset: u64, size: u64) -> SpaceMapEntry {
        SpaceMapEntry::Free(SpaceMapExtent { offset, size })
    }

    /// One entry per segment of `tree`.
    pub(crate) fn from_tree(tree: &RangeTree, is_alloc: bool) -> Vec<SpaceMapEntry> {
        tree.iter()
            .map(|(&offset, &size)| {
                if is_alloc {
                    SpaceMapEntry::alloc(offset, size)
                } else {
                    SpaceMapEntry::free(offset, size)
                }
            })
            .collect()
    }
}

/// Persistent descriptor of one metaslab's extent index log.  `object` 0
/// means no log has been created yet (the whole region is free).
#[derive(Debug, Serialize, Deserialize, Default, Copy, Clone, PartialEq, Eq)]
pub struct ExtentIndexPhys {
    pub object: u64,
    /// Bytes of log written so far.
    pub objsize: u64,
    /// Net allocated bytes recorded by the log.
    pub alloc: u64,
}
impl OnDisk for ExtentIndexPhys {}

/// Where extent index logs live.  Implementations are expected to be
/// internally synchronized; loads happen with no allocator locks held.
pub trait SpaceMapStore: Send + Sync {
    /// Creates an empty log, returning its object id (never 0).
    fn create(&self) -> Result<u64>;

    /// Replays the log described by `phys`, oldest entry first.
    fn load(&self, phys: &ExtentIndexPhys, visit: &mut dyn FnMut(SpaceMapEntry)) -> Result<()>;

    /// Appends `entries`, advancing `phys.objsize`.  The caller maintains
    /// `phys.alloc`.
    fn append(&self, phys: &mut ExtentIndexPhys, entries: &[SpaceMapEntry]) -> Result<()>;

    /// Discards every entry, resetting `phys.objsize` and `phys.alloc`.
    fn truncate(&self, phys: &mut ExtentIndexPhys) -> Result<()>;

    /// Hint that `phys` will be loaded soon.
    fn prefetch(&self, _phys: &ExtentIndexPhys) {}
}

/// A `SpaceMapStore` that keeps every log in memory.
#[derive(Debug)]
pub struct MemorySpaceMapStore {
    objects: Mutex<HashMap<u64, Vec<SpaceMapEntry>>>,
    next_object: AtomicU64,
    loads: AtomicU64,
    prefetches: AtomicU64,
}

impl Default for MemorySpaceMapStore {
    fn default() -> Self {
        MemorySpaceMapStore {
            objects: Default::default(),
            next_object: AtomicU64::new(1),
            loads: Default::default(),
            prefetches: Default::default(),
        }
    }
}

impl MemorySpaceMapStore {
    pub fn new() -> MemorySpaceMapStore {
        Default::default()
    }

    /// Number of successful load() calls.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn prefetch_count(&self) -> u64 {
        self.prefetches.load(Ordering::Relaxed)
    }

    pub fn entries(&self, object: u64) -> Vec<SpaceMapEntry> {
        self.objects
            .lock()
            .get(&object)
            .cloned()
            .unwrap_or_default()
    }
}

impl SpaceMapStore for MemorySpaceMapStore {
    fn create(&self) -> Result<u64> {
        let object = self.next_object.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().insert(object, Vec::new());
        trace!("created space map object {}", object);
        Ok(object)
    }

    fn load(&self, phys: &ExtentIndexPhys, visit: &mut dyn FnMut(SpaceMapEntry)) -> Result<()> {
        if phys.object == 0 {
            return Ok(());
        }
        let entries = {
            let objects = self.objects.lock();
            let log = objects
                .get(&phys.object)
                .ok_or_else(|| anyhow!("space map object {} does not exist", phys.object))?;
            let count = usize::try_from(phys.objsize / SPACE_MAP_ENTRY_SIZE)?;
            if count > log.len() {
                return Err(anyhow!(
                    "space map object {} has {} entries, descriptor expects {}",
                    phys.object,
                    log.len(),
                    count
                ));
            }
            log[..count].to_vec()
        };
        for entry in entries {
            visit(entry);
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn append(&self, phys: &mut ExtentIndexPhys, entries: &[SpaceMapEntry]) -> Result<()> {
        let mut objects = self.objects.lock();
        let log = objects
            .get_mut(&phys.object)
            .ok_or_else(|| anyhow!("space map object {} does not exist", phys.object))?;
        log.extend_from_slice(entries);
        phys.objsize += u64::try_from(entries.len())? * SPACE_MAP_ENTRY_SIZE;
        Ok(())
    }

    fn truncate(&self, phys: &mut ExtentIndexPhys) -> Result<()> {
        let mut objects = self.objects.lock();
        let log = objects
            .get_mut(&phys.object)
            .ok_or_else(|| anyhow!("space map object {} does not exist", phys.object))?;
        log.clear();
        phys.objsize = 0;
        phys.alloc = 0;
        Ok(())
    }

    fn prefetch(&self, phys: &ExtentIndexPhys) {
        trace!("prefetch space map object {}", phys.object);
        self.prefetches.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(store: &MemorySpaceMapStore, phys: &ExtentIndexPhys) -> Vec<SpaceMapEntry> {
        let mut entries = Vec::new();
        store.load(phys, &mut |e| entries.push(e)).unwrap();
        entries
    }

    #[test]
    fn test_append_then_load() {
        let store = MemorySpaceMapStore::new();
        let mut phys = ExtentIndexPhys {
            object: store.create().unwrap(),
            ..Default::default()
        };
        assert_ne!(phys.object, 0);
        store
            .append(
                &mut phys,
                &[SpaceMapEntry::alloc(0, 4096), SpaceMapEntry::free(0, 512)],
            )
            .unwrap();
        assert_eq!(phys.objsize, 2 * SPACE_MAP_ENTRY_SIZE);
        assert_eq!(
            replay(&store, &phys),
            vec![SpaceMapEntry::alloc(0, 4096), SpaceMapEntry::free(0, 512)]
        );
        assert_eq!(store.load_count(), 1);
    }

    #[test]
    fn test_load_respects_descriptor_size() {
        let store = MemorySpaceMapStore::new();
        let mut phys = ExtentIndexPhys {
            object: store.create().unwrap(),
            ..Default::default()
        };
        store
            .append(&mut phys, &[SpaceMapEntry::alloc(0, 512)])
            .unwrap();
        let old = phys;
        store
            .append(&mut phys, &[SpaceMapEntry::alloc(512, 512)])
            .unwrap();
        assert_eq!(replay(&store, &old), vec![SpaceMapEntry::alloc(0, 512)]);
    }

    #[test]
    fn test_truncate_and_missing_object() {
        let store = MemorySpaceMapStore::new();
        let mut phys = ExtentIndexPhys {
            object: store.create().unwrap(),
            objsize: 0,
            alloc: 1024,
        };
        store
            .append(&mut phys, &[SpaceMapEntry::alloc(0, 1024)])
            .unwrap();
        store.truncate(&mut phys).unwrap();
        assert_eq!(phys.objsize, 0);
        assert_eq!(phys.alloc, 0);
        assert!(replay(&store, &phys).is_empty());

        let bogus = ExtentIndexPhys {
            object: 99,
            objsize: 8,
            alloc: 0,
        };
        assert!(store.load(&bogus, &mut |_| {}).is_err());
        // Object 0 is an empty log.
        assert!(replay(&store, &ExtentIndexPhys::default()).is_empty());
    }

    #[test]
    fn test_from_tree() {
        let mut tree = RangeTree::new();
        tree.add(0, 512);
        tree.add(4096, 1024);
        assert_eq!(
            SpaceMapEntry::from_tree(&tree, false),
            vec![SpaceMapEntry::free(0, 512), SpaceMapEntry::free(4096, 1024)]
        );
    }
}
