use crate::base_types::*;
use crate::context::{DeviceHealth, TxgContext};
use crate::error::{MetaslabError, Result};
use crate::group::{free_per_1024, MetaslabGroup, SpaceStats};
use crate::space_map::{ExtentIndexPhys, SpaceMapStore};
use crate::tunables::Tunables;
use log::*;
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a domain's devices hold.  Intent-log devices reuse freed space
/// immediately instead of deferring it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DomainKind {
    Normal,
    Log,
}

impl DomainKind {
    pub(crate) fn defers_frees(self) -> bool {
        self == DomainKind::Normal
    }
}

/// State shared by a domain and all of its groups.
pub(crate) struct DomainCore {
    pub(crate) kind: DomainKind,
    pub(crate) tunables: Tunables,
    pub(crate) store: Arc<dyn SpaceMapStore>,
    pub(crate) health: Arc<dyn DeviceHealth>,
    pub(crate) txg_ctx: Arc<dyn TxgContext>,
    pub(crate) stats: SpaceStats,
}

/// Devices known to the domain, and the rotor ring of those currently
/// accepting allocations.  Ring entries index into `groups`.
#[derive(Default)]
pub(crate) struct Topology {
    groups: Vec<Option<Arc<MetaslabGroup>>>,
    ring: Vec<usize>,
}

impl Topology {
    fn find(&self, vdev: DeviceId) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.as_ref().map_or(false, |g| g.id() == vdev))
    }

    pub(crate) fn group(&self, vdev: DeviceId) -> Option<&Arc<MetaslabGroup>> {
        self.find(vdev).and_then(|i| self.groups[i].as_ref())
    }

    /// Ring position of `vdev`, if it is accepting allocations.
    pub(crate) fn ring_position(&self, vdev: DeviceId) -> Option<usize> {
        let index = self.find(vdev)?;
        self.ring.iter().position(|&i| i == index)
    }

    pub(crate) fn ring_len(&self) -> usize {
        self.ring.len()
    }

    pub(crate) fn group_at(&self, position: usize) -> &Arc<MetaslabGroup> {
        self.groups[self.ring[position]]
            .as_ref()
            .expect("rotor ring references a removed device")
    }

    fn all_groups(&self) -> impl Iterator<Item = &Arc<MetaslabGroup>> {
        self.groups.iter().flatten()
    }
}

/// A set of devices that allocations rotate across, e.g. the normal
/// devices of a pool or its intent-log devices.
pub struct AllocationDomain {
    pub(crate) core: Arc<DomainCore>,
    pub(crate) topology: RwLock<Topology>,
    /// Ring position allocations start from.
    pub(crate) rotor: AtomicUsize,
}

impl AllocationDomain {
    pub fn new(
        kind: DomainKind,
        tunables: Tunables,
        store: Arc<dyn SpaceMapStore>,
        health: Arc<dyn DeviceHealth>,
        txg_ctx: Arc<dyn TxgContext>,
    ) -> AllocationDomain {
        debug!(
            "METASLAB: new {:?} domain using {:?}",
            kind, tunables.strategy
        );
        AllocationDomain {
            core: Arc::new(DomainCore {
                kind,
                tunables,
                store,
                health,
                txg_ctx,
                stats: SpaceStats::default(),
            }),
            topology: Default::default(),
            rotor: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> DomainKind {
        self.core.kind
    }

    pub fn tunables(&self) -> &Tunables {
        &self.core.tunables
    }

    pub fn get_alloc(&self) -> u64 {
        self.core.stats.alloc()
    }

    pub fn get_deferred(&self) -> u64 {
        self.core.stats.deferred()
    }

    pub fn get_space(&self) -> u64 {
        self.core.stats.space()
    }

    pub fn get_dspace(&self) -> u64 {
        self.core.stats.dspace()
    }

    pub fn group(&self, vdev: DeviceId) -> Option<Arc<MetaslabGroup>> {
        self.topology.read().group(vdev).cloned()
    }

    /// Devices accepting allocations, in rotor order starting at the rotor.
    pub fn rotor_order(&self) -> Vec<DeviceId> {
        let topology = self.topology.read();
        let len = topology.ring_len();
        if len == 0 {
            return Vec::new();
        }
        let rotor = self.rotor.load(Ordering::Relaxed) % len;
        (0..len)
            .map(|i| topology.group_at((rotor + i) % len).id())
            .collect()
    }

    pub(crate) fn read_topology(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read()
    }

    /// Adds a device and its metaslabs.  Descriptors in `phys` are used for
    /// the leading metaslabs.  Space added after TXG_INITIAL is usable once
    /// `txg` has synced.  The device takes no allocations until
    /// `activate_group`.
    pub fn add_device(&self, device: DeviceInfo, phys: &[ExtentIndexPhys], txg: Txg) -> Result<()> {
        if self.topology.read().find(device.id).is_some() {
            return Err(MetaslabError::CorruptIndexState(format!(
                "device {} added twice",
                device.id
            )));
        }
        let group = MetaslabGroup::new(self.core.clone(), device, phys, txg)?;
        let mut topology = self.topology.write();
        match topology.groups.iter().position(|g| g.is_none()) {
            Some(slot) => topology.groups[slot] = Some(group),
            None => topology.groups.push(Some(group)),
        }
        Ok(())
    }

    /// Lets a device take allocations.  The device is placed right after
    /// the rotor, and becomes the rotor.
    pub fn activate_group(&self, vdev: DeviceId) -> Result<()> {
        let mut topology = self.topology.write();
        let index = topology
            .find(vdev)
            .ok_or(MetaslabError::DeviceUnavailable(vdev))?;
        let group = topology.groups[index]
            .clone()
            .ok_or(MetaslabError::DeviceUnavailable(vdev))?;
        if !group.activate() {
            return Ok(());
        }
        assert!(!topology.ring.contains(&index));

        if topology.ring.is_empty() {
            topology.ring.push(index);
            self.rotor.store(0, Ordering::Relaxed);
        } else {
            let rotor = self.rotor.load(Ordering::Relaxed) % topology.ring.len();
            topology.ring.insert(rotor + 1, index);
            self.rotor.store(rotor + 1, Ordering::Relaxed);
        }
        info!(
            "METASLAB: device {} activated, aliquot {}",
            vdev,
            group.aliquot()
        );
        Ok(())
    }

    /// Stops a device from taking allocations.  If it was the rotor, the
    /// rotor moves to the next device.
    pub fn passivate_group(&self, vdev: DeviceId) -> Result<()> {
        let mut topology = self.topology.write();
        let index = topology
            .find(vdev)
            .ok_or(MetaslabError::DeviceUnavailable(vdev))?;
        let group = topology.groups[index]
            .clone()
            .ok_or(MetaslabError::DeviceUnavailable(vdev))?;
        if !group.passivate() {
            return Ok(());
        }

        let position = topology
            .ring
            .iter()
            .position(|&i| i == index)
            .ok_or_else(|| {
                MetaslabError::CorruptIndexState(format!("device {} active but not in rotor", vdev))
            })?;
        let rotor = self.rotor.load(Ordering::Relaxed);
        topology.ring.remove(position);
        let len = topology.ring.len();
        let rotor = if len == 0 {
            0
        } else if rotor > position {
            rotor - 1
        } else {
            // Includes the removed device being the rotor: its successor
            // slides into its position.
            rotor % len
        };
        self.rotor.store(rotor, Ordering::Relaxed);
        info!("METASLAB: device {} passivated", vdev);
        Ok(())
    }

    /// Tears down a passivated device, removing its space from the domain.
    pub fn remove_device(&self, vdev: DeviceId) -> Result<()> {
        let mut topology = self.topology.write();
        let index = topology
            .find(vdev)
            .ok_or(MetaslabError::DeviceUnavailable(vdev))?;
        if topology.ring.contains(&index) {
            return Err(MetaslabError::CorruptIndexState(format!(
                "device {} removed while still taking allocations",
                vdev
            )));
        }
        if let Some(group) = topology.groups[index].take() {
            group.fini();
        }
        Ok(())
    }

    /// Picks the ring position after `position`, skipping devices much
    /// fuller than the domain average.  Never skips past `rotor`.
    pub(crate) fn group_next(
        &self,
        topology: &Topology,
        position: usize,
        rotor: usize,
        least_space: bool,
    ) -> usize {
        let len = topology.ring_len();
        let next = |p: usize| (p + 1) % len;
        let tunables = &self.core.tunables;
        let domain_free = free_per_1024(self.get_alloc(), self.get_space());

        if domain_free < 30
            || self.core.kind != DomainKind::Normal
            || !tunables.skip_enabled()
            || least_space
        {
            return next(position);
        }

        let mut candidate = position;
        loop {
            candidate = next(candidate);
            if candidate == rotor {
                break;
            }
            let device_free = topology.group_at(candidate).free_per_1024();
            let below_threshold = device_free < (tunables.skip_threshold << 10) / 100;
            let much_fuller = (device_free * tunables.skip_ratio) >> 10 < domain_free;
            if !(below_threshold && much_fuller) {
                break;
            }
            trace!(
                "METASLAB: skipping device {} ({} of 1024 free, domain {})",
                topology.group_at(candidate).id(),
                device_free,
                domain_free
            );
        }
        candidate
    }

    /// Writes every dirty metaslab's allocations and frees for `txg`.
    pub fn sync(&self, txg: Txg) -> Result<()> {
        let topology = self.topology.read();
        for group in topology.all_groups() {
            group.sync(txg)?;
        }
        Ok(())
    }

    /// Finishes `txg`: releases deferred frees, re-weighs metaslabs, and
    /// unloads idle indexes.
    pub fn sync_done(&self, txg: Txg) -> Result<()> {
        let topology = self.topology.read();
        for group in topology.all_groups() {
            group.sync_done(txg)?;
        }
        trace!(
            "METASLAB: txg {} done: {} allocated, {} deferred, {} total",
            txg,
            self.get_alloc(),
            self.get_deferred(),
            self.get_space()
        );
        Ok(())
    }

    /// Re-weighs metaslabs outside of the sync cycle, e.g. after a tunable
    /// or topology change.
    pub fn reassess(&self, txg: Txg) -> Result<()> {
        let topology = self.topology.read();
        for group in topology.all_groups() {
            group.reassess(txg)?;
        }
        Ok(())
    }

    /// Checks that every device in the rotor belongs to this domain and is
    /// activated exactly once.
    pub fn validate(&self) -> Result<()> {
        let topology = self.topology.read();
        for position in 0..topology.ring_len() {
            let group = topology.group_at(position);
            if !Arc::ptr_eq(group.core_arc(), &self.core) {
                return Err(MetaslabError::CorruptIndexState(format!(
                    "device {} in rotor belongs to another domain",
                    group.id()
                )));
            }
            if group.activation_count() != 1 {
                return Err(MetaslabError::CorruptIndexState(format!(
                    "device {} in rotor has activation count {}",
                    group.id(),
                    group.activation_count()
                )));
            }
        }
        let listed = topology.ring.len();
        let active = topology
            .all_groups()
            .filter(|g| g.activation_count() > 0)
            .count();
        if listed != active {
            return Err(MetaslabError::CorruptIndexState(format!(
                "{} devices in rotor but {} activated",
                listed, active
            )));
        }
        Ok(())
    }

    /// Destroys an empty domain.  Every device must have been passivated
    /// and removed.
    pub fn close(self) -> Result<()> {
        let topology = self.topology.read();
        if topology.ring_len() != 0 || topology.all_groups().next().is_some() {
            return Err(MetaslabError::CorruptIndexState(
                "domain closed with devices attached".to_string(),
            ));
        }
        if self.get_alloc() != 0 || self.get_deferred() != 0 || self.get_space() != 0 {
            return Err(MetaslabError::CorruptIndexState(format!(
                "domain closed with {} allocated, {} deferred, {} total",
                self.get_alloc(),
                self.get_deferred(),
                self.get_space()
            )));
        }
        debug!("METASLAB: {:?} domain closed", self.core.kind);
        Ok(())
    }
}
