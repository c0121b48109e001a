#![allow(dead_code)]

use metaslab::base_types::*;
use metaslab::*;
use std::sync::Arc;

pub const MS_SHIFT: u32 = 20;
pub const MS_SIZE: u64 = 1 << MS_SHIFT;

pub struct Harness {
    pub domain: AllocationDomain,
    pub store: Arc<MemorySpaceMapStore>,
    pub health: Arc<StaticHealth>,
    pub txg_ctx: Arc<ManualTxgContext>,
}

pub fn tunables(strategy: StrategyKind) -> Tunables {
    Tunables {
        strategy,
        gang_threshold: u64::MAX,
        debug: false,
        ..Default::default()
    }
}

impl Harness {
    pub fn new(kind: DomainKind, tunables: Tunables) -> Harness {
        let store = Arc::new(MemorySpaceMapStore::new());
        let health = Arc::new(StaticHealth::new());
        let txg_ctx = Arc::new(ManualTxgContext::new());
        let domain = AllocationDomain::new(
            kind,
            tunables,
            store.clone(),
            health.clone(),
            txg_ctx.clone(),
        );
        Harness {
            domain,
            store,
            health,
            txg_ctx,
        }
    }

    /// A domain with `devices` active devices of `ms_count` metaslabs each,
    /// with the initial txg already synced.
    pub fn with_devices(
        kind: DomainKind,
        tunables: Tunables,
        devices: u64,
        ms_count: u64,
    ) -> Harness {
        let harness = Harness::new(kind, tunables);
        for id in 0..devices {
            harness.add_device(DeviceId(id), ms_count);
        }
        harness.sync_txg(TXG_INITIAL);
        harness
    }

    pub fn add_device(&self, id: DeviceId, ms_count: u64) {
        let device = DeviceInfo::new(id, ms_count << MS_SHIFT, MS_SHIFT);
        self.domain.add_device(device, &[], TXG_INITIAL).unwrap();
        self.domain.activate_group(id).unwrap();
    }

    pub fn sync_txg(&self, txg: Txg) {
        self.txg_ctx.set_syncing(txg);
        self.domain.sync(txg).unwrap();
        self.domain.sync_done(txg).unwrap();
    }

    /// Syncs every txg in `from..=to`.
    pub fn sync_through(&self, from: Txg, to: Txg) {
        for txg in from.0..=to.0 {
            self.sync_txg(Txg(txg));
        }
    }

    pub fn alloc(&self, psize: u64, ndvas: usize, txg: Txg) -> Result<Vec<Dva>> {
        self.domain.alloc(&AllocRequest::new(psize, ndvas, txg))
    }

    pub fn metaslab(&self, vdev: DeviceId, offset: u64) -> Arc<Metaslab> {
        let group = self.domain.group(vdev).unwrap();
        group.metaslab_for(offset).unwrap().clone()
    }

    /// True if [offset, offset + size) lies entirely within a free extent
    /// of its (loaded) metaslab.
    pub fn is_free(&self, vdev: DeviceId, offset: u64, size: u64) -> bool {
        self.metaslab(vdev, offset)
            .free_extents()
            .iter()
            .any(|&(start, len)| start <= offset && offset + size <= start + len)
    }
}

pub fn overlaps(a: &Dva, b: &Dva) -> bool {
    a.vdev == b.vdev && a.offset < b.offset + b.asize && b.offset < a.offset + a.asize
}
