use crate::base_types::*;
use crate::context::DeviceHealth;
use crate::domain::{AllocationDomain, Topology};
use crate::error::{MetaslabError, Result};
use crate::group::MetaslabGroup;
use crate::metaslab::Metaslab;
use log::*;
use more_asserts::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// How much placement quality a DVA allocation still insists on.  Each
/// full pass over the rotor that fails gives up a little more.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Relaxation {
    /// Copies on the same device must be at least `asize >> dshift` apart.
    Distance { dshift: u32 },
    /// As Distance, but device health is taken from the authoritative
    /// (locked) check.
    LockedHealth { dshift: u32 },
}

impl Relaxation {
    const INITIAL_DSHIFT: u32 = 3;

    fn strictest() -> Relaxation {
        Relaxation::Distance {
            dshift: Self::INITIAL_DSHIFT,
        }
    }

    fn dshift(self) -> u32 {
        match self {
            Relaxation::Distance { dshift } | Relaxation::LockedHealth { dshift } => dshift,
        }
    }

    /// Degraded devices are only avoided before any distance relaxation.
    fn avoids_degraded(self) -> bool {
        self.dshift() == Self::INITIAL_DSHIFT
    }

    fn is_allocatable(self, health: &dyn DeviceHealth, vdev: DeviceId) -> bool {
        match self {
            Relaxation::Distance { .. } => health.is_allocatable(vdev),
            Relaxation::LockedHealth { .. } => health.is_allocatable_locked(vdev),
        }
    }

    /// The next level after a failed pass, or None if nothing is left to
    /// give up.
    fn relax(self, all_zero: bool, unallocatable: bool) -> Option<Relaxation> {
        if !all_zero {
            let dshift = self.dshift() + 1;
            assert_lt!(dshift, 64);
            return Some(match self {
                Relaxation::Distance { .. } => Relaxation::Distance { dshift },
                Relaxation::LockedHealth { .. } => Relaxation::LockedHealth { dshift },
            });
        }
        match self {
            Relaxation::Distance { .. } if unallocatable => Some(Relaxation::LockedHealth {
                dshift: Self::INITIAL_DSHIFT,
            }),
            _ => None,
        }
    }
}

impl AllocationDomain {
    /// Allocates `request.ndvas` copies of a `request.psize`-byte block.
    /// All-or-nothing: on failure, copies already placed are released.  An
    /// out-of-space failure is retried once with the free-space skip
    /// heuristic disabled.
    pub fn alloc(&self, request: &AllocRequest) -> Result<Vec<Dva>> {
        assert_gt!(request.ndvas, 0);
        assert_gt!(request.psize, 0);

        let result = {
            let topology = self.read_topology();
            if topology.ring_len() == 0 {
                debug!("METASLAB: allocation with no devices accepting allocations");
                return Err(MetaslabError::OutOfSpace);
            }
            self.alloc_copies(&topology, request)
        };

        match result {
            Err(e) if e.is_retryable() && !request.flags.least_space => {
                debug!(
                    "METASLAB: {} byte allocation failed ({}), retrying with least space",
                    request.psize, e
                );
                let retry = AllocRequest {
                    flags: AllocFlags {
                        least_space: true,
                        ..request.flags
                    },
                    ..request.clone()
                };
                self.alloc(&retry)
            }
            result => result,
        }
    }

    fn alloc_copies(&self, topology: &Topology, request: &AllocRequest) -> Result<Vec<Dva>> {
        let mut dvas: Vec<Dva> = Vec::with_capacity(request.ndvas);
        let mut copies = 0;
        for d in 0..request.ndvas {
            match self.alloc_dva(topology, request, &dvas, d) {
                Ok(dva) => {
                    copies += dva.copies;
                    let nparity = dva.copies - 1;
                    dvas.push(dva);
                    // A parity device already provides the extra copies.
                    if copies >= request.ndvas + nparity {
                        break;
                    }
                }
                Err(e) => {
                    if let Err(rollback) = self.release_copies(topology, &dvas, request.txg, true) {
                        warn!(
                            "METASLAB: releasing copies of failed {} byte allocation: {}",
                            request.psize, rollback
                        );
                    }
                    return Err(e);
                }
            }
        }
        trace!(
            "METASLAB: allocated {} bytes as {:?} in txg {}",
            request.psize,
            dvas.iter().map(|dva| dva.to_string()).collect::<Vec<_>>(),
            request.txg
        );
        Ok(dvas)
    }

    /// Allocates copy `d` of a block, given copies `prior` already placed.
    fn alloc_dva(
        &self,
        topology: &Topology,
        request: &AllocRequest,
        prior: &[Dva],
        d: usize,
    ) -> Result<Dva> {
        let tunables = &self.core.tunables;
        let health = &*self.core.health;
        let least_space = request.flags.least_space;
        let len = topology.ring_len();

        // Exercise gang blocks by failing some large allocations.
        if request.psize >= tunables.gang_threshold && rand::random::<u8>() & 3 == 0 {
            trace!(
                "METASLAB: failing {} byte allocation to force ganging",
                request.psize
            );
            return Err(MetaslabError::OutOfSpace);
        }

        // Ditto copies go to consecutive devices; gang children follow
        // their header.
        let start = match request.hint.as_ref().and_then(|hint| hint.get(d)) {
            Some(hint) => topology.ring_position(hint.vdev).map(|p| {
                if request.flags.avoid_hint {
                    self.group_next(topology, p, p, least_space)
                } else {
                    p
                }
            }),
            None if d != 0 => topology
                .ring_position(prior[d - 1].vdev)
                .map(|p| self.group_next(topology, p, p, least_space)),
            None => None,
        };
        let rotor = start.unwrap_or_else(|| self.rotor.load(Ordering::Relaxed) % len);

        let mut level = Relaxation::strictest();
        loop {
            let mut all_zero = true;
            let mut unallocatable = false;
            let mut position = rotor;
            loop {
                let group = topology.group_at(position);
                let device = group.device();

                if !level.is_allocatable(health, device.id) {
                    unallocatable = true;
                } else if health.is_degraded(device.id) && d == 0 && level.avoids_degraded() {
                    // Keep single-copy data off failing devices while
                    // there is any alternative.
                    all_zero = false;
                } else {
                    let mut distance = device.asize >> level.dshift();
                    if distance <= device.ms_size() {
                        distance = 0;
                    } else {
                        all_zero = false;
                    }

                    let asize = device.psize_to_asize(request.psize);
                    if let Some(offset) = group.alloc(asize, request.txg, distance, prior)? {
                        self.account_allocation(topology, group, position, rotor, asize, least_space);
                        return Ok(Dva {
                            vdev: device.id,
                            offset,
                            asize,
                            gang: request.flags.gang,
                            copies: device.copies(),
                        });
                    }
                }

                position = self.group_next(topology, position, rotor, least_space);
                self.rotor.store(position, Ordering::Relaxed);
                group.reset_allocated();
                if position == rotor {
                    break;
                }
            }

            level = match level.relax(all_zero, unallocatable) {
                Some(next) => next,
                None => {
                    debug!(
                        "METASLAB: no device can hold {} bytes (copy {} of {})",
                        request.psize,
                        d + 1,
                        request.ndvas
                    );
                    return Err(MetaslabError::OutOfSpace);
                }
            };
            trace!("METASLAB: relaxing placement to {:?}", level);
        }
    }

    /// Charges `asize` against the device's aliquot, moving the rotor on
    /// once the device has had its (usage-biased) share.
    fn account_allocation(
        &self,
        topology: &Topology,
        group: &MetaslabGroup,
        position: usize,
        rotor: usize,
        asize: u64,
        least_space: bool,
    ) {
        if group.allocated() == 0 {
            group.set_bias(self.bias_for(group));
        }
        let allocated = i128::from(group.add_allocated(asize));
        if allocated >= i128::from(group.aliquot()) + i128::from(group.bias()) {
            let next = self.group_next(topology, position, rotor, least_space);
            self.rotor.store(next, Ordering::Relaxed);
            group.reset_allocated();
        }
    }

    /// Allocation bias steering a device's usage toward the domain average,
    /// at most `bias_factor` percent of its aliquot either way.
    #[allow(clippy::cast_possible_truncation)]
    fn bias_for(&self, group: &MetaslabGroup) -> i64 {
        let tunables = &self.core.tunables;
        let device_alloc = i128::from(group.get_alloc());
        let device_space = i128::from(group.get_space());
        let mut domain_alloc = i128::from(self.get_alloc());
        let mut domain_space = i128::from(self.get_space());

        let device_used = (device_alloc << 10) / (device_space + 1);
        if tunables.stronger_bias {
            domain_alloc -= device_alloc;
            domain_space -= device_space;
        }
        let domain_used = (domain_alloc << 10) / (domain_space.max(0) + 1);

        let bias = (domain_used - device_used)
            * i128::from(tunables.effective_bias_factor())
            * i128::from(group.aliquot())
            / (1024 * 100);
        bias as i64
    }

    /// Releases copies of a block.  With `now`, the copies must have been
    /// allocated in `txg` and are reusable immediately; otherwise they
    /// become reusable once the free has cleared the deferral window.
    pub fn free(&self, dvas: &[Dva], txg: Txg, now: bool) -> Result<()> {
        if now {
            let syncing = self.core.txg_ctx.syncing_txg();
            if txg < syncing {
                return Err(MetaslabError::CorruptIndexState(format!(
                    "immediate free of txg {} blocks while txg {} is syncing",
                    txg, syncing
                )));
            }
        }

        let topology = self.read_topology();
        self.release_copies(&topology, dvas, txg, now)
    }

    /// Frees every copy, newest first, even after one fails.  Returns the
    /// first failure.
    fn release_copies(&self, topology: &Topology, dvas: &[Dva], txg: Txg, now: bool) -> Result<()> {
        let mut first_error = None;
        for dva in dvas.iter().rev() {
            if let Err(e) = self.free_dva(topology, dva, txg, now) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn free_dva(&self, topology: &Topology, dva: &Dva, txg: Txg, now: bool) -> Result<()> {
        let (group, ms) = match self.lookup(topology, dva) {
            Ok(found) => found,
            Err(e) => {
                warn!("METASLAB: free of bad DVA {}: {}", dva, e);
                return Err(e);
            }
        };
        let size = extent_size(group.device(), dva);
        ms.free(group, dva.offset, size, txg, now)
    }

    /// Marks existing copies allocated, e.g. while replaying an intent
    /// log.  Every copy is first checked without side effects; nothing is
    /// changed unless all of them are free.  `Txg::DRY_RUN` stops after the
    /// check.
    pub fn claim(&self, dvas: &[Dva], txg: Txg) -> Result<()> {
        if !txg.is_dry_run() {
            self.claim(dvas, Txg::DRY_RUN)?;
        }
        let topology = self.read_topology();
        for dva in dvas {
            self.claim_dva(&topology, dva, txg)?;
        }
        Ok(())
    }

    fn claim_dva(&self, topology: &Topology, dva: &Dva, txg: Txg) -> Result<()> {
        let (group, ms) = self.lookup(topology, dva)?;
        let size = extent_size(group.device(), dva);
        ms.claim(group, dva.offset, size, txg)
    }

    fn lookup<'a>(
        &self,
        topology: &'a Topology,
        dva: &Dva,
    ) -> Result<(&'a Arc<MetaslabGroup>, &'a Arc<Metaslab>)> {
        let group = topology
            .group(dva.vdev)
            .ok_or(MetaslabError::DeviceUnavailable(dva.vdev))?;
        let not_found = MetaslabError::NotFound {
            vdev: dva.vdev,
            offset: dva.offset,
            size: dva.asize,
        };
        let ms = match group.metaslab_for(dva.offset) {
            Some(ms) => ms,
            None => return Err(not_found),
        };
        let size = extent_size(group.device(), dva);
        if size == 0 || dva.offset + size > ms.start() + ms.size() {
            return Err(not_found);
        }
        Ok((group, ms))
    }
}

/// Bytes a DVA occupies: gang DVAs point at a single gang header.
fn extent_size(device: &DeviceInfo, dva: &Dva) -> u64 {
    if dva.gang {
        device.psize_to_asize(GANG_BLOCK_SIZE)
    } else {
        dva.asize
    }
}
