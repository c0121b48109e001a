use crate::base_types::*;
use crate::domain::DomainCore;
use crate::error::{MetaslabError, Result};
use crate::metaslab::{Activation, Metaslab, MetaslabState, Weight};
use crate::space_map::ExtentIndexPhys;
use crate::strategy::Strategy;
use log::*;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Highest weight first; ties go to the lowest offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SortedMetaslabEntry {
    weight: Reverse<Weight>,
    start: u64,
    id: usize,
}

impl SortedMetaslabEntry {
    fn new(weight: Weight, ms: &Metaslab) -> SortedMetaslabEntry {
        SortedMetaslabEntry {
            weight: Reverse(weight),
            start: ms.start(),
            id: ms.id(),
        }
    }
}

struct GroupIndex {
    by_weight: BTreeSet<SortedMetaslabEntry>,
    /// Highest metaslab start ever activated; reassessment stops here.
    bonus_area: u64,
}

fn add_signed(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta.unsigned_abs(), Ordering::Relaxed);
    } else {
        counter.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
    }
}

/// Allocated, deferred-free, and total space, raw and deflated.
#[derive(Debug, Default)]
pub(crate) struct SpaceStats {
    alloc: AtomicU64,
    deferred: AtomicU64,
    space: AtomicU64,
    dspace: AtomicU64,
}

impl SpaceStats {
    pub(crate) fn update(&self, alloc_delta: i64, defer_delta: i64, space_delta: i64, dspace_delta: i64) {
        add_signed(&self.alloc, alloc_delta);
        add_signed(&self.deferred, defer_delta);
        add_signed(&self.space, space_delta);
        add_signed(&self.dspace, dspace_delta);
    }

    pub(crate) fn alloc(&self) -> u64 {
        self.alloc.load(Ordering::Relaxed)
    }

    pub(crate) fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    pub(crate) fn space(&self) -> u64 {
        self.space.load(Ordering::Relaxed)
    }

    pub(crate) fn dspace(&self) -> u64 {
        self.dspace.load(Ordering::Relaxed)
    }
}

/// Free space of `alloc` out of `space`, in 1/1024ths.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn free_per_1024(alloc: u64, space: u64) -> i64 {
    let used = (u128::from(alloc) << 10) / (u128::from(space) + 1);
    1024 - used.min(1 << 20) as i64
}

/// All metaslabs of one device, ordered by weight for allocation.
pub struct MetaslabGroup {
    device: DeviceInfo,
    core: Arc<DomainCore>,
    metaslabs: Vec<Arc<Metaslab>>,
    index: Mutex<GroupIndex>,
    activation_count: AtomicI64,
    aliquot: AtomicU64,
    bias: AtomicI64,
    allocated: AtomicU64,
    unloads: AtomicU64,
    stats: SpaceStats,
    dirty: [Mutex<BTreeSet<usize>>; TXG_SIZE],
}

impl MetaslabGroup {
    /// Carves `device` into metaslabs.  `phys` holds persisted descriptors
    /// for the leading metaslabs, if any; the rest start out empty.
    pub(crate) fn new(
        core: Arc<DomainCore>,
        device: DeviceInfo,
        phys: &[ExtentIndexPhys],
        txg: Txg,
    ) -> Result<Arc<MetaslabGroup>> {
        let ms_size = device.ms_size();
        let metaslabs: Vec<Arc<Metaslab>> = (0..device.ms_count())
            .zip(0..)
            .map(|(m, id)| {
                let strategy = Strategy::new(core.tunables.strategy, &core.tunables, ms_size);
                let phys = phys.get(id).copied().unwrap_or_default();
                Arc::new(Metaslab::new(id, m << device.ms_shift, ms_size, phys, strategy))
            })
            .collect();
        if phys.len() > metaslabs.len() {
            return Err(MetaslabError::CorruptIndexState(format!(
                "device {} has {} metaslabs but {} descriptors",
                device.id,
                metaslabs.len(),
                phys.len()
            )));
        }

        let by_weight = metaslabs
            .iter()
            .map(|ms| SortedMetaslabEntry::new(Weight::ZERO, ms))
            .collect();
        let group = Arc::new(MetaslabGroup {
            device,
            core: core.clone(),
            metaslabs,
            index: Mutex::new(GroupIndex {
                by_weight,
                bonus_area: 0,
            }),
            activation_count: AtomicI64::new(0),
            aliquot: AtomicU64::new(core.tunables.aliquot),
            bias: AtomicI64::new(0),
            allocated: AtomicU64::new(0),
            unloads: AtomicU64::new(0),
            stats: SpaceStats::default(),
            dirty: Default::default(),
        });
        for ms in group.metaslabs.iter() {
            ms.init(&group, txg)?;
        }
        info!(
            "METASLAB: device {}: {} metaslabs of {} bytes ({} usable)",
            device.id,
            group.metaslabs.len(),
            ms_size,
            group.stats.space()
        );
        Ok(group)
    }

    pub fn id(&self) -> DeviceId {
        self.device.id
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn metaslabs(&self) -> &[Arc<Metaslab>] {
        &self.metaslabs
    }

    pub(crate) fn core(&self) -> &DomainCore {
        &self.core
    }

    pub(crate) fn core_arc(&self) -> &Arc<DomainCore> {
        &self.core
    }

    /// Metaslab covering `offset`.
    pub fn metaslab_for(&self, offset: u64) -> Option<&Arc<Metaslab>> {
        let id = usize::try_from(offset >> self.device.ms_shift).ok()?;
        self.metaslabs.get(id)
    }

    pub fn get_alloc(&self) -> u64 {
        self.stats.alloc()
    }

    pub fn get_deferred(&self) -> u64 {
        self.stats.deferred()
    }

    pub fn get_space(&self) -> u64 {
        self.stats.space()
    }

    pub fn get_dspace(&self) -> u64 {
        self.stats.dspace()
    }

    pub fn activation_count(&self) -> i64 {
        self.activation_count.load(Ordering::Relaxed)
    }

    pub fn aliquot(&self) -> u64 {
        self.aliquot.load(Ordering::Relaxed)
    }

    pub fn bias(&self) -> i64 {
        self.bias.load(Ordering::Relaxed)
    }

    /// Returns true if the group just became a member of the rotor.
    pub(crate) fn activate(&self) -> bool {
        let count = self.activation_count.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(count <= 1, "device {} activated twice", self.device.id);
        if count <= 0 {
            return false;
        }
        let children = self.device.children.max(1);
        self.aliquot
            .store(self.core.tunables.aliquot * children, Ordering::Relaxed);
        self.allocated.store(0, Ordering::Relaxed);
        true
    }

    /// Returns true if the group just left the rotor.
    pub(crate) fn passivate(&self) -> bool {
        let count = self.activation_count.fetch_sub(1, Ordering::Relaxed) - 1;
        assert!(count <= 0, "device {} passivated twice", self.device.id);
        count == 0
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Adds `asize` to the bytes allocated since the rotor arrived here.
    pub(crate) fn add_allocated(&self, asize: u64) -> u64 {
        self.allocated.fetch_add(asize, Ordering::Relaxed) + asize
    }

    pub(crate) fn reset_allocated(&self) {
        self.allocated.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_bias(&self, bias: i64) {
        self.bias.store(bias, Ordering::Relaxed);
    }

    /// Free space of this device, in 1/1024ths.
    pub(crate) fn free_per_1024(&self) -> i64 {
        free_per_1024(self.stats.alloc(), self.stats.space())
    }

    pub(crate) fn sort(&self, ms: &Metaslab, state: &mut MetaslabState, weight: Weight) {
        let mut index = self.index.lock();
        let removed = index
            .by_weight
            .remove(&SortedMetaslabEntry::new(state.weight, ms));
        assert!(removed, "metaslab {} not in device {}", ms.id(), self.device.id);
        state.weight = weight;
        index.by_weight.insert(SortedMetaslabEntry::new(weight, ms));
    }

    pub(crate) fn remove(&self, ms: &Metaslab, state: &MetaslabState) {
        let removed = self
            .index
            .lock()
            .by_weight
            .remove(&SortedMetaslabEntry::new(state.weight, ms));
        assert!(removed, "metaslab {} not in device {}", ms.id(), self.device.id);
    }

    pub(crate) fn update_bonus_area(&self, start: u64) {
        let mut index = self.index.lock();
        if start > index.bonus_area {
            index.bonus_area = start;
        }
    }

    pub(crate) fn space_update(&self, alloc_delta: i64, defer_delta: i64, space_delta: i64) {
        let dspace_delta = self.device.deflate(space_delta);
        self.stats
            .update(alloc_delta, defer_delta, space_delta, dspace_delta);
        self.core
            .stats
            .update(alloc_delta, defer_delta, space_delta, dspace_delta);
    }

    pub(crate) fn dirty(&self, id: usize, txg: Txg) {
        self.dirty[txg.slot()].lock().insert(id);
    }

    pub(crate) fn note_unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unloads(&self) -> u64 {
        self.unloads.load(Ordering::Relaxed)
    }

    /// Separation between metaslab `ms` and an existing copy.  Copies on
    /// other devices are infinitely far away.
    fn distance(&self, ms: &Metaslab, dva: &Dva) -> u64 {
        if dva.vdev != self.device.id {
            return 1 << 63;
        }
        let shift = self.device.ms_shift;
        let offset = dva.offset >> shift;
        let start = ms.start() >> shift;
        (if offset > start {
            offset - start
        } else {
            start - offset
        }) << shift
    }

    fn pick_metaslab(
        &self,
        size: u64,
        activation: Activation,
        min_distance: u64,
        prior: &[Dva],
    ) -> Option<(Arc<Metaslab>, bool)> {
        let index = self.index.lock();
        for entry in index.by_weight.iter() {
            let weight = entry.weight.0;
            if weight.below(size) {
                return None;
            }
            let ms = &self.metaslabs[entry.id];
            if activation == Activation::Primary {
                return Some((ms.clone(), weight.is_active()));
            }
            // Untouched metaslabs need to be further away, to leave room
            // for the next copy of something else.
            let target = min_distance
                + if ms.committed_alloc() != 0 {
                    0
                } else {
                    min_distance >> 1
                };
            if prior.iter().all(|dva| self.distance(ms, dva) >= target) {
                return Some((ms.clone(), weight.is_active()));
            }
        }
        None
    }

    /// Allocates `size` bytes from the best metaslab of this device that is
    /// at least `min_distance` away from `prior` copies on this device.
    pub(crate) fn alloc(
        &self,
        size: u64,
        txg: Txg,
        min_distance: u64,
        prior: &[Dva],
    ) -> Result<Option<u64>> {
        let activation = if prior.iter().any(|dva| dva.vdev == self.device.id) {
            Activation::Secondary
        } else {
            Activation::Primary
        };

        loop {
            let (ms, was_active) = match self.pick_metaslab(size, activation, min_distance, prior)
            {
                Some(pick) => pick,
                None => return Ok(None),
            };
            let mut state = ms.lock();

            // The weight may have changed before we got the lock.
            if state.weight.below(size)
                || (was_active && !state.weight.is_active() && activation == Activation::Primary)
            {
                continue;
            }

            if state.weight.activation == Activation::Secondary
                && activation == Activation::Primary
            {
                let space = state.weight.space;
                ms.passivate(&mut state, self, space)?;
                continue;
            }

            match ms.activate(&mut state, self, activation, size, txg) {
                Ok(()) => {}
                Err(MetaslabError::OutOfSpace) => continue,
                Err(MetaslabError::Store(e)) => {
                    warn!(
                        "METASLAB: device {} metaslab {} unusable: {:#}",
                        self.device.id,
                        ms.id(),
                        e
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            if let Some(offset) = ms.alloc(&mut state, self, size, txg) {
                trace!(
                    "METASLAB: device {} metaslab {}: allocated [{:#x}, {:#x}) txg {}",
                    self.device.id,
                    ms.id(),
                    offset,
                    offset + size,
                    txg
                );
                return Ok(Some(offset));
            }

            // Alignment can defeat a segment that is big enough, so never
            // leave the weight at or above the size that just failed.
            let max_size = state.max_contiguous();
            let limit = if max_size >= size { size - 1 } else { max_size };
            ms.passivate(&mut state, self, limit)?;
        }
    }

    pub(crate) fn sync(&self, txg: Txg) -> Result<()> {
        let dirty: Vec<usize> = self.dirty[txg.slot()].lock().iter().copied().collect();
        for id in dirty {
            self.metaslabs[id].sync(self, txg)?;
        }
        Ok(())
    }

    pub(crate) fn sync_done(&self, txg: Txg) -> Result<()> {
        let dirty = std::mem::take(&mut *self.dirty[txg.slot()].lock());
        for id in dirty {
            self.metaslabs[id].sync_done(self, txg)?;
        }
        self.reassess(txg)
    }

    /// Re-weighs every metaslab up to the bonus area, unloads idle indexes,
    /// and prefetches the logs of the next likely candidates.
    pub(crate) fn reassess(&self, txg: Txg) -> Result<()> {
        let bonus_area = self.index.lock().bonus_area;
        for ms in self.metaslabs.iter() {
            if ms.start() > bonus_area {
                break;
            }
            ms.reassess(self, txg)?;
        }
        self.prefetch();
        self.unloads.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn prefetch(&self) {
        let candidates: Vec<usize> = self
            .index
            .lock()
            .by_weight
            .iter()
            .take(self.core.tunables.prefetch_limit)
            .map(|entry| entry.id)
            .collect();
        for id in candidates {
            if let Some(phys) = self.metaslabs[id].prefetch_candidate() {
                self.core.store.prefetch(&phys);
            }
        }
    }

    pub(crate) fn fini(&self) {
        for ms in self.metaslabs.iter() {
            ms.fini(self);
        }
        assert_eq!(self.stats.space(), 0);
        debug!("METASLAB: device {} torn down", self.device.id);
    }

    /// Weight-ordered (metaslab id, weight) pairs.
    pub fn weights(&self) -> Vec<(usize, Weight)> {
        self.index
            .lock()
            .by_weight
            .iter()
            .map(|entry| (entry.id, entry.weight.0))
            .collect()
    }
}
