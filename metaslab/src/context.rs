use crate::base_types::{DeviceId, Txg};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Device health as seen by the allocator.
pub trait DeviceHealth: Send + Sync {
    fn is_allocatable(&self, vdev: DeviceId) -> bool;

    /// Authoritative check, consulted only once the cheap check has made
    /// every device look unusable.
    fn is_allocatable_locked(&self, vdev: DeviceId) -> bool {
        self.is_allocatable(vdev)
    }

    fn is_degraded(&self, _vdev: DeviceId) -> bool {
        false
    }

    /// Devices being evacuated keep their metaslabs out of the weight order.
    fn is_removing(&self, _vdev: DeviceId) -> bool {
        false
    }
}

/// Transaction group state of the pool.
pub trait TxgContext: Send + Sync {
    fn syncing_txg(&self) -> Txg;

    fn is_writeable(&self) -> bool {
        true
    }

    fn sync_pass(&self) -> u32 {
        1
    }
}

/// `DeviceHealth` driven by explicit state changes.
#[derive(Debug, Default)]
pub struct StaticHealth {
    offline: RwLock<HashSet<DeviceId>>,
    degraded: RwLock<HashSet<DeviceId>>,
    removing: RwLock<HashSet<DeviceId>>,
}

fn set_membership(set: &RwLock<HashSet<DeviceId>>, vdev: DeviceId, member: bool) {
    let mut set = set.write();
    if member {
        set.insert(vdev);
    } else {
        set.remove(&vdev);
    }
}

impl StaticHealth {
    pub fn new() -> StaticHealth {
        Default::default()
    }

    pub fn set_offline(&self, vdev: DeviceId, offline: bool) {
        set_membership(&self.offline, vdev, offline);
    }

    pub fn set_degraded(&self, vdev: DeviceId, degraded: bool) {
        set_membership(&self.degraded, vdev, degraded);
    }

    pub fn set_removing(&self, vdev: DeviceId, removing: bool) {
        set_membership(&self.removing, vdev, removing);
    }
}

impl DeviceHealth for StaticHealth {
    fn is_allocatable(&self, vdev: DeviceId) -> bool {
        !self.offline.read().contains(&vdev)
    }

    fn is_degraded(&self, vdev: DeviceId) -> bool {
        self.degraded.read().contains(&vdev)
    }

    fn is_removing(&self, vdev: DeviceId) -> bool {
        self.removing.read().contains(&vdev)
    }
}

/// `TxgContext` whose syncing txg is advanced by the caller.
#[derive(Debug)]
pub struct ManualTxgContext {
    syncing: AtomicU64,
    writeable: AtomicBool,
    sync_pass: AtomicU64,
}

impl Default for ManualTxgContext {
    fn default() -> Self {
        ManualTxgContext {
            syncing: AtomicU64::new(0),
            writeable: AtomicBool::new(true),
            sync_pass: AtomicU64::new(1),
        }
    }
}

impl ManualTxgContext {
    pub fn new() -> ManualTxgContext {
        Default::default()
    }

    pub fn set_syncing(&self, txg: Txg) {
        self.syncing.store(txg.0, Ordering::Relaxed);
    }

    pub fn set_writeable(&self, writeable: bool) {
        self.writeable.store(writeable, Ordering::Relaxed);
    }

    pub fn set_sync_pass(&self, pass: u32) {
        self.sync_pass.store(u64::from(pass), Ordering::Relaxed);
    }
}

impl TxgContext for ManualTxgContext {
    fn syncing_txg(&self) -> Txg {
        Txg(self.syncing.load(Ordering::Relaxed))
    }

    fn is_writeable(&self) -> bool {
        self.writeable.load(Ordering::Relaxed)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sync_pass(&self) -> u32 {
        self.sync_pass.load(Ordering::Relaxed) as u32
    }
}
