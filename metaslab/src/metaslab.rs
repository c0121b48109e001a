use crate::base_types::*;
use crate::error::{MetaslabError, Result};
use crate::extent_index::ExtentIndex;
use crate::group::MetaslabGroup;
use crate::space_map::{ExtentIndexPhys, SpaceMapEntry, SPACE_MAP_ENTRY_SIZE};
use crate::strategy::Strategy;
use log::*;
use more_asserts::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use util::RangeTree;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Activation {
    Inactive,
    /// Active for redundant copies of blocks whose first copy is on the
    /// same device.
    Secondary,
    Primary,
}

/// Selection priority of a metaslab.  Any active metaslab outranks every
/// inactive one; among equals, more (position-weighted) free space wins.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Weight {
    pub activation: Activation,
    pub space: u64,
}

impl Weight {
    pub const ZERO: Weight = Weight {
        activation: Activation::Inactive,
        space: 0,
    };

    pub fn is_active(&self) -> bool {
        self.activation != Activation::Inactive
    }

    /// True if this metaslab can't be expected to hold `size` bytes.
    /// Active metaslabs are never below any size.
    pub(crate) fn below(&self, size: u64) -> bool {
        !self.is_active() && self.space < size
    }

    fn with_activation(self, activation: Activation) -> Weight {
        Weight { activation, ..self }
    }

    /// Inactive weight no greater than `limit`.
    fn clamp(self, limit: u64) -> Weight {
        let space = if self.is_active() {
            limit
        } else {
            self.space.min(limit)
        };
        Weight {
            activation: Activation::Inactive,
            space,
        }
    }
}

pub(crate) struct MetaslabState {
    pub(crate) weight: Weight,
    index: ExtentIndex,
    alloc_logs: [RangeTree; TXG_SIZE],
    free_logs: [RangeTree; TXG_SIZE],
    defer_logs: [RangeTree; TXG_DEFER_SIZE],
    deferspace: u64,
    /// Descriptor as of the last completed sync.
    phys: ExtentIndexPhys,
    /// Descriptor being written by the current sync.
    phys_syncing: ExtentIndexPhys,
    activated: Txg,
    loading: bool,
    condense: bool,
    initialized: bool,
}

impl MetaslabState {
    pub(crate) fn max_contiguous(&self) -> u64 {
        self.index.max_size()
    }
}

/// A fixed-size region of a device, the unit of free-space tracking.
pub struct Metaslab {
    id: usize,
    start: u64,
    size: u64,
    state: Mutex<MetaslabState>,
    load_cv: Condvar,
    // Mirror of phys.alloc, readable without the lock for placement
    // decisions.
    committed_alloc: AtomicU64,
}

impl Metaslab {
    pub(crate) fn new(
        id: usize,
        start: u64,
        size: u64,
        phys: ExtentIndexPhys,
        strategy: Strategy,
    ) -> Metaslab {
        Metaslab {
            id,
            start,
            size,
            state: Mutex::new(MetaslabState {
                weight: Weight::ZERO,
                index: ExtentIndex::new(start, size, strategy),
                alloc_logs: Default::default(),
                free_logs: Default::default(),
                defer_logs: Default::default(),
                deferspace: 0,
                phys: ExtentIndexPhys::default(),
                phys_syncing: phys,
                activated: Txg(0),
                loading: false,
                condense: false,
                initialized: false,
            }),
            load_cv: Condvar::new(),
            committed_alloc: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn weight(&self) -> Weight {
        self.state.lock().weight
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().index.is_loaded()
    }

    /// Descriptor of the persisted log as of the last completed sync.
    pub fn phys(&self) -> ExtentIndexPhys {
        self.state.lock().phys
    }

    /// Largest free extent, or 0 if the index is not loaded.
    pub fn max_contiguous(&self) -> u64 {
        self.state.lock().index.max_size()
    }

    pub(crate) fn committed_alloc(&self) -> u64 {
        self.committed_alloc.load(Ordering::Relaxed)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MetaslabState> {
        self.state.lock()
    }

    /// Rewrite the whole log at the next first-pass sync, even if it is
    /// still compact.
    pub fn request_condense(&self) {
        self.state.lock().condense = true;
    }

    /// Called once the owning group exists.
    pub(crate) fn init(&self, group: &MetaslabGroup, txg: Txg) -> Result<()> {
        if txg <= TXG_INITIAL {
            self.sync_done(group, Txg(0))?;
        }

        let core = group.core();
        if core.tunables.debug {
            let mut state = self.state.lock();
            let phys = state.phys_syncing;
            if phys.object != 0 && !state.index.is_loaded() {
                self.load(&mut state, group, phys)?;
            }
        }

        if !txg.is_dry_run() {
            group.dirty(self.id, txg);
        }
        Ok(())
    }

    pub(crate) fn fini(&self, group: &MetaslabGroup) {
        let mut state = self.state.lock();
        if state.initialized {
            let alloc = i64::try_from(state.phys.alloc).unwrap_or(i64::MAX);
            let size = i64::try_from(self.size).unwrap_or(i64::MAX);
            group.space_update(-alloc, 0, -size);
        }
        group.remove(self, &state);
        state.index.unload();
        assert_eq!(state.deferspace, 0);
    }

    pub(crate) fn compute_weight(&self, state: &MetaslabState, group: &MetaslabGroup) -> Result<Weight> {
        let space = self.size.checked_sub(state.phys.alloc).ok_or_else(|| {
            MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: {} bytes allocated of {}",
                self.id, self.start, state.phys.alloc, self.size
            ))
        })?;

        // Lower metaslabs sit on faster outer tracks: scale free space by
        // a multiplier running from 2x at the start of the device to 1x at
        // the end.
        let device = group.device();
        let position = u128::from(self.start >> device.ms_shift);
        let count = u128::from(device.ms_count().max(1));
        let free = u128::from(space);
        let weighted = (2 * free).checked_sub(position * free / count).unwrap_or(0);
        if weighted < free || weighted > 2 * free {
            return Err(MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: weight {} out of range for {} free",
                self.id, self.start, weighted, space
            )));
        }

        // An active metaslab we can keep allocating from stays ahead of
        // everything inactive until it is used up.
        let activation = if state.index.is_loaded() && !state.index.is_fragmented(group.aliquot()) {
            state.weight.activation
        } else {
            Activation::Inactive
        };
        Ok(Weight {
            activation,
            space: u64::try_from(weighted).unwrap_or(u64::MAX),
        })
    }

    fn wait_for_load(&self, state: &mut MutexGuard<'_, MetaslabState>) {
        while state.loading {
            self.load_cv.wait(state);
        }
    }

    /// Rebuilds the in-core index from the persisted log.  The store is
    /// read with the metaslab lock dropped; other threads see `loading`
    /// and wait.
    fn load(
        &self,
        state: &mut MutexGuard<'_, MetaslabState>,
        group: &MetaslabGroup,
        phys: ExtentIndexPhys,
    ) -> Result<()> {
        assert!(!state.loading);
        assert!(!state.index.is_loaded());
        state.loading = true;
        let store = group.core().store.clone();
        let mut entries = Vec::new();
        let result = MutexGuard::unlocked(state, || {
            store.load(&phys, &mut |entry| entries.push(entry))
        });
        state.loading = false;
        self.load_cv.notify_all();
        if let Err(e) = result {
            warn!(
                "METASLAB: device {} metaslab {}: load of object {} failed: {:#}",
                group.device().id,
                self.id,
                phys.object,
                e
            );
            return Err(e.into());
        }

        let state = &mut **state;
        state.index.load(&entries)?;
        if state.index.space() + phys.alloc != self.size {
            let free = state.index.space();
            state.index.unload();
            return Err(MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: log says {} allocated but replay left {} of {} free",
                self.id, self.start, phys.alloc, free, self.size
            )));
        }
        // Deferred frees are already free on disk but must not be reused
        // yet.
        for defer in state.defer_logs.iter() {
            for (&offset, &size) in defer.iter() {
                state.index.claim(offset, size)?;
            }
        }
        debug!(
            "METASLAB: device {} metaslab {}: loaded {} log entries, {} free",
            group.device().id,
            self.id,
            entries.len(),
            state.index.space()
        );
        Ok(())
    }

    fn unload(&self, state: &mut MetaslabState, group: &MetaslabGroup) {
        trace!(
            "METASLAB: device {} metaslab {}: unloading index",
            group.device().id,
            self.id
        );
        state.index.unload();
        state.activated = Txg(0);
        group.note_unload();
    }

    /// Makes this metaslab active, loading its index if necessary.  Fails
    /// with OutOfSpace (after passivating) if the loaded index turns out to
    /// be unable to hold `size` bytes.
    pub(crate) fn activate(
        &self,
        state: &mut MutexGuard<'_, MetaslabState>,
        group: &MetaslabGroup,
        activation: Activation,
        size: u64,
        txg: Txg,
    ) -> Result<()> {
        if !state.weight.is_active() {
            self.wait_for_load(state);
        }
        if !state.weight.is_active() {
            if !state.index.is_loaded() {
                let phys = state.phys;
                if let Err(e) = self.load(state, group, phys) {
                    group.sort(self, state, Weight::ZERO);
                    return Err(e);
                }
            }

            group.update_bonus_area(self.start);
            state.activated = txg;

            if state.weight.below(size) {
                let max_size = state.index.max_size();
                self.passivate(state, group, max_size)?;
                return Err(MetaslabError::OutOfSpace);
            }

            let weight = state.weight.with_activation(activation);
            group.sort(self, state, weight);
        }
        assert!(state.index.is_loaded());
        assert!(state.weight.is_active());
        Ok(())
    }

    /// Drops activation, leaving a weight of at most `size`.
    pub(crate) fn passivate(&self, state: &mut MetaslabState, group: &MetaslabGroup, size: u64) -> Result<()> {
        if size < MIN_BLOCK_SIZE && state.index.space() != 0 {
            return Err(MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: passivated to {} with {} bytes still free",
                self.id,
                self.start,
                size,
                state.index.space()
            )));
        }
        let weight = state.weight.clamp(size);
        group.sort(self, state, weight);
        Ok(())
    }

    /// Allocates from an active metaslab and records the allocation in the
    /// txg's alloc log.
    pub(crate) fn alloc(
        &self,
        state: &mut MetaslabState,
        group: &MetaslabGroup,
        size: u64,
        txg: Txg,
    ) -> Option<u64> {
        assert!(state.weight.is_active());
        let offset = state.index.alloc(size)?;
        let alloc_log = &mut state.alloc_logs[txg.slot()];
        if alloc_log.is_empty() {
            group.dirty(self.id, txg);
        }
        alloc_log.add(offset, size);
        Some(offset)
    }

    pub(crate) fn free(
        &self,
        group: &MetaslabGroup,
        offset: u64,
        size: u64,
        txg: Txg,
        now: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let slot = txg.slot();
        if now {
            // Undo of an allocation from this same txg.
            if !state.alloc_logs[slot].contains(offset, size) {
                return Err(MetaslabError::NotFound {
                    vdev: group.device().id,
                    offset,
                    size,
                });
            }
            state.alloc_logs[slot].remove(offset, size);
            if state.index.is_loaded() {
                state.index.free(offset, size)?;
            }
        } else {
            if state.free_logs[slot].overlaps(offset, size) {
                return Err(MetaslabError::CorruptIndexState(format!(
                    "device {} extent [{:#x}, {:#x}) freed twice in txg {}",
                    group.device().id,
                    offset,
                    offset + size,
                    txg
                )));
            }
            if state.free_logs[slot].is_empty() {
                group.dirty(self.id, txg);
            }
            state.free_logs[slot].add(offset, size);
        }
        Ok(())
    }

    /// Marks an exact extent allocated on behalf of an existing block.
    /// With the dry-run txg this only checks that the extent is free.
    pub(crate) fn claim(&self, group: &MetaslabGroup, offset: u64, size: u64, txg: Txg) -> Result<()> {
        let writeable = group.core().txg_ctx.is_writeable();
        let mut state = self.state.lock();

        if txg.is_dry_run() {
            self.wait_for_load(&mut state);
            let was_loaded = state.index.is_loaded();
            if !was_loaded {
                let phys = state.phys;
                self.load(&mut state, group, phys)?;
            }
            let free = state.index.contains(offset, size);
            if !was_loaded && !state.weight.is_active() {
                state.index.unload();
            }
            return if free {
                Ok(())
            } else {
                Err(MetaslabError::NotFound {
                    vdev: group.device().id,
                    offset,
                    size,
                })
            };
        }

        if writeable || !state.index.is_loaded() {
            self.activate(&mut state, group, Activation::Secondary, 0, txg)?;
        }
        if !state.index.contains(offset, size) {
            return Err(MetaslabError::NotFound {
                vdev: group.device().id,
                offset,
                size,
            });
        }
        state.index.claim(offset, size)?;
        if writeable {
            let alloc_log = &mut state.alloc_logs[txg.slot()];
            if alloc_log.is_empty() {
                group.dirty(self.id, txg);
            }
            alloc_log.add(offset, size);
        }
        Ok(())
    }

    /// Writes this txg's allocations and frees to the persisted log,
    /// condensing the log first if it has grown large.
    pub(crate) fn sync(&self, group: &MetaslabGroup, txg: Txg) -> Result<()> {
        let core = group.core();
        let defer = core.kind.defers_frees();
        let slot = txg.slot();
        let freed_slot = txg.clean().slot();
        let mut state = self.state.lock();

        if state.alloc_logs[slot].is_empty() && state.free_logs[slot].is_empty() {
            return Ok(());
        }

        if state.phys_syncing.object == 0 {
            assert_eq!(state.phys_syncing.objsize, 0);
            assert_eq!(state.phys_syncing.alloc, 0);
            state.phys_syncing.object = core.store.create()?;
        }

        let state = &mut *state;
        if let Some((offset, size)) = state.free_logs[slot]
            .iter()
            .map(|(&offset, &size)| (offset, size))
            .find(|&(offset, size)| state.free_logs[freed_slot].overlaps(offset, size))
        {
            return Err(MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: [{:#x}, {:#x}) freed twice in txg {}",
                self.id,
                self.start,
                offset,
                offset + size,
                txg
            )));
        }
        let frees = std::mem::take(&mut state.free_logs[slot]);
        for (&offset, &size) in frees.iter() {
            state.free_logs[freed_slot].add(offset, size);
        }

        let segments = u64::try_from(state.index.num_segments()).unwrap_or(u64::MAX);
        let oversized = state.phys_syncing.objsize >= 2 * SPACE_MAP_ENTRY_SIZE * segments;
        let condense = state.index.is_loaded()
            && core.txg_ctx.sync_pass() == 1
            && (oversized || state.condense);

        let (allocs, frees) = if condense {
            // Everything is allocated except what the index holds free,
            // what was freed this txg, deferred frees, and allocations
            // from future txgs (which are logged when those txgs sync).
            let mut allocated = RangeTree::new();
            allocated.add(self.start, self.size);
            let mut release = |offset: u64, size: u64| -> Result<()> {
                if !allocated.contains(offset, size) {
                    return Err(MetaslabError::CorruptIndexState(format!(
                        "metaslab {} at {:#x}: condensing releases [{:#x}, {:#x}) twice",
                        self.id,
                        self.start,
                        offset,
                        offset + size
                    )));
                }
                allocated.remove(offset, size);
                Ok(())
            };
            for (&offset, &size) in state.index.tree().iter() {
                release(offset, size)?;
            }
            for (&offset, &size) in state.free_logs[freed_slot].iter() {
                release(offset, size)?;
            }
            for defer_log in state.defer_logs.iter() {
                assert!(defer || defer_log.is_empty());
                for (&offset, &size) in defer_log.iter() {
                    release(offset, size)?;
                }
            }
            for t in 1..TXG_CONCURRENT_STATES {
                for (&offset, &size) in state.alloc_logs[txg.plus(t).slot()].iter() {
                    release(offset, size)?;
                }
            }
            state.alloc_logs[slot].clear();
            if state.condense {
                debug!(
                    "METASLAB: device {} metaslab {}: condensing on request in txg {}",
                    group.device().id,
                    self.id,
                    txg
                );
                state.condense = false;
            }
            core.store.truncate(&mut state.phys_syncing)?;
            (allocated, RangeTree::new())
        } else {
            (std::mem::take(&mut state.alloc_logs[slot]), frees)
        };

        let mut entries = SpaceMapEntry::from_tree(&allocs, true);
        entries.extend(SpaceMapEntry::from_tree(&frees, false));
        core.store.append(&mut state.phys_syncing, &entries)?;
        state.phys_syncing.alloc += allocs.space();
        state.phys_syncing.alloc = state
            .phys_syncing
            .alloc
            .checked_sub(frees.space())
            .ok_or_else(|| {
                MetaslabError::CorruptIndexState(format!(
                    "metaslab {} at {:#x}: frees exceed logged allocations",
                    self.id, self.start
                ))
            })?;

        trace!(
            "METASLAB: device {} metaslab {}: txg {} synced {} allocated {} freed{}",
            group.device().id,
            self.id,
            txg,
            allocs.space(),
            frees.space(),
            if condense { " (condensed)" } else { "" }
        );
        Ok(())
    }

    /// Completes a sync: oldest deferred frees become allocatable, this
    /// txg's frees start their deferral, and the synced descriptor becomes
    /// the committed one.
    pub(crate) fn sync_done(&self, group: &MetaslabGroup, txg: Txg) -> Result<()> {
        let core = group.core();
        let defer = core.kind.defers_frees();
        let freed_slot = txg.clean().slot();
        let defer_slot = txg.defer_slot();
        let mut state = self.state.lock();

        if !state.initialized {
            state.initialized = true;
            group.space_update(0, 0, i64::try_from(self.size).unwrap_or(i64::MAX));
        }

        let alloc_delta = signed(state.phys_syncing.alloc) - signed(state.phys.alloc);
        let defer_delta = if defer {
            signed(state.free_logs[freed_slot].space()) - signed(state.defer_logs[defer_slot].space())
        } else {
            0
        };
        group.space_update(alloc_delta + defer_delta, defer_delta, 0);

        if !state.alloc_logs[txg.slot()].is_empty() || !state.free_logs[txg.slot()].is_empty() {
            return Err(MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: txg {} completed with unsynced changes",
                self.id, self.start, txg
            )));
        }

        self.wait_for_load(&mut state);
        let state = &mut *state;
        let loaded = state.index.is_loaded();
        let freed = std::mem::take(&mut state.free_logs[freed_slot]);
        if defer {
            let released = std::mem::replace(&mut state.defer_logs[defer_slot], freed);
            if loaded {
                for (&offset, &size) in released.iter() {
                    state.index.free(offset, size)?;
                }
            }
        } else if loaded {
            for (&offset, &size) in freed.iter() {
                state.index.free(offset, size)?;
            }
        }

        state.phys = state.phys_syncing;
        self.committed_alloc.store(state.phys.alloc, Ordering::Relaxed);

        let deferspace = signed(state.deferspace) + defer_delta;
        if deferspace < 0 || deferspace > signed(self.size) {
            return Err(MetaslabError::CorruptIndexState(format!(
                "metaslab {} at {:#x}: deferred space {} out of range",
                self.id, self.start, deferspace
            )));
        }
        state.deferspace = u64::try_from(deferspace).unwrap_or(0);
        if state.deferspace != 0 {
            assert!(defer);
            // Keep syncing until every deferred free is back in circulation.
            group.dirty(self.id, txg.next());
        }

        if self.evictable(state, group, txg) && !core.tunables.debug {
            self.unload(state, group);
        }

        if !core.health.is_removing(group.device().id) {
            let weight = self.compute_weight(state, group)?;
            group.sort(self, state, weight);
        }
        Ok(())
    }

    /// Re-sorts by current weight and unloads the index if it has been
    /// idle long enough.
    pub(crate) fn reassess(&self, group: &MetaslabGroup, txg: Txg) -> Result<()> {
        let core = group.core();
        let mut state = self.state.lock();
        let weight = self.compute_weight(&state, group)?;
        group.sort(self, &mut state, weight);

        if core.tunables.unload_delay > 0 {
            self.wait_for_load(&mut state);
            if self.evictable(&state, group, txg) && !core.tunables.debug {
                self.unload(&mut state, group);
            }
        }
        Ok(())
    }

    /// Whether a loaded index can be dropped at the end of `txg` without
    /// losing allocations that later txgs have yet to sync.
    fn evictable(&self, state: &MetaslabState, group: &MetaslabGroup, txg: Txg) -> bool {
        if !state.index.is_loaded() || state.weight.is_active() {
            return false;
        }
        if (1..TXG_CONCURRENT_STATES).any(|t| !state.alloc_logs[txg.plus(t).slot()].is_empty()) {
            return false;
        }
        let tunables = &group.core().tunables;
        let delay = tunables.unload_delay;
        !(delay > 0
            && (group.unloads() > tunables.unload_limit
                || state.activated < TXG_INITIAL
                || state.activated.0 + delay > txg.0))
    }

    /// Object to prefetch if this index is a likely activation candidate.
    pub(crate) fn prefetch_candidate(&self) -> Option<ExtentIndexPhys> {
        let state = self.state.lock();
        if !state.index.is_loaded() && state.phys.object != 0 {
            Some(state.phys)
        } else {
            None
        }
    }

    /// Lowest-offset-first walk of the free extents, for verification.
    pub fn free_extents(&self) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .index
            .tree()
            .iter()
            .map(|(&offset, &size)| (offset, size))
            .collect()
    }
}

#[allow(clippy::cast_possible_wrap)]
fn signed(value: u64) -> i64 {
    assert_le!(value, i64::MAX as u64);
    value as i64
}
