use more_asserts::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::*;

/*
 * Transaction group bookkeeping.  Per-txg state is kept in rings of
 * TXG_SIZE slots, indexed by the low bits of the txg number.
 */
pub const TXG_SIZE: usize = 4;
pub const TXG_MASK: u64 = TXG_SIZE as u64 - 1;
pub const TXG_CONCURRENT_STATES: u64 = 3;
pub const TXG_DEFER_SIZE: usize = 2;
pub const TXG_INITIAL: Txg = Txg(TXG_SIZE as u64);

pub const MIN_BLOCK_SHIFT: u32 = 9;
pub const MIN_BLOCK_SIZE: u64 = 1 << MIN_BLOCK_SHIFT;
pub const MAX_BLOCK_SIZE: u64 = 128 << 10;
pub const GANG_BLOCK_SIZE: u64 = MIN_BLOCK_SIZE;

/*
 * Things that are stored on disk.
 */
pub trait OnDisk: Serialize + DeserializeOwned {}

#[derive(Serialize, Deserialize, Default, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct Txg(pub u64);
impl OnDisk for Txg {}
impl Display for Txg {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.0)
    }
}
impl Txg {
    /// Claims made with this txg only verify, they change nothing.
    pub const DRY_RUN: Txg = Txg(0);

    pub fn next(&self) -> Txg {
        Txg(self.0 + 1)
    }

    pub fn plus(&self, n: u64) -> Txg {
        Txg(self.0 + n)
    }

    pub fn is_dry_run(&self) -> bool {
        *self == Txg::DRY_RUN
    }

    /// Slot in a TXG_SIZE ring.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn slot(&self) -> usize {
        (self.0 & TXG_MASK) as usize
    }

    /// Slot in the TXG_DEFER_SIZE ring.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn defer_slot(&self) -> usize {
        (self.0 % TXG_DEFER_SIZE as u64) as usize
    }

    /// The txg whose ring slot is guaranteed idle while this txg syncs.
    pub(crate) fn clean(&self) -> Txg {
        Txg(self.0.wrapping_sub(1))
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub u64);
impl OnDisk for DeviceId {}
impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.0)
    }
}
impl DeviceId {
    pub fn next(&self) -> DeviceId {
        DeviceId(self.0 + 1)
    }
}

/// Data virtual address: one physical copy of a block.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Dva {
    pub vdev: DeviceId,
    pub offset: u64,
    pub asize: u64,
    pub gang: bool,
    /// Number of redundant copies this DVA stands for (parity devices
    /// count as nparity + 1).
    pub copies: usize,
}
impl OnDisk for Dva {}
impl Display for Dva {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "<{}:{:#x}:{:#x}>", self.vdev, self.offset, self.asize)?;
        if self.gang {
            write!(f, "G")?;
        }
        Ok(())
    }
}

/// Static description of a top-level device.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub asize: u64,
    pub ashift: u32,
    pub ms_shift: u32,
    pub children: u64,
    pub nparity: u64,
    /// Ratio of usable to raw space, in units of 1/512.
    pub deflate_ratio: u64,
}
impl OnDisk for DeviceInfo {}

impl DeviceInfo {
    pub fn new(id: DeviceId, asize: u64, ms_shift: u32) -> DeviceInfo {
        assert_ge!(ms_shift, MIN_BLOCK_SHIFT);
        DeviceInfo {
            id,
            asize,
            ashift: MIN_BLOCK_SHIFT,
            ms_shift,
            children: 0,
            nparity: 0,
            deflate_ratio: 1 << MIN_BLOCK_SHIFT,
        }
    }

    pub fn with_ashift(self, ashift: u32) -> DeviceInfo {
        assert_ge!(ashift, MIN_BLOCK_SHIFT);
        assert_le!(ashift, self.ms_shift);
        DeviceInfo { ashift, ..self }
    }

    /// Describes a parity group of `children` disks, `nparity` of which
    /// hold parity for every stripe.
    pub fn with_parity(self, children: u64, nparity: u64) -> DeviceInfo {
        assert_gt!(children, nparity);
        DeviceInfo {
            children,
            nparity,
            ..self
        }
    }

    pub fn with_deflate_ratio(self, deflate_ratio: u64) -> DeviceInfo {
        DeviceInfo {
            deflate_ratio,
            ..self
        }
    }

    pub fn ms_size(&self) -> u64 {
        1 << self.ms_shift
    }

    pub fn ms_count(&self) -> u64 {
        self.asize >> self.ms_shift
    }

    /// How many redundant copies a single DVA on this device provides.
    #[allow(clippy::cast_possible_truncation)]
    pub fn copies(&self) -> usize {
        self.nparity as usize + 1
    }

    /// Allocated size of a `psize`-byte block, including parity sectors.
    pub fn psize_to_asize(&self, psize: u64) -> u64 {
        let ashift = self.ashift;
        if self.nparity == 0 || self.children <= self.nparity {
            let align = 1u64 << ashift;
            return (psize.max(1) + align - 1) & !(align - 1);
        }

        let data_cols = self.children - self.nparity;
        let mut sectors = ((psize.max(1) - 1) >> ashift) + 1;
        sectors += self.nparity * ((sectors + data_cols - 1) / data_cols);
        let group = self.nparity + 1;
        let sectors = (sectors + group - 1) / group * group;
        sectors << ashift
    }

    /// Converts a raw space delta to a deflated one.
    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn deflate(&self, space_delta: i64) -> i64 {
        (space_delta >> MIN_BLOCK_SHIFT) * self.deflate_ratio as i64
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AllocFlags {
    /// Don't start on the device of the hinted DVA.
    pub avoid_hint: bool,
    /// The request is for a gang block's children.
    pub gang: bool,
    /// Disable the free-space skip heuristic when choosing devices.
    pub least_space: bool,
}

#[derive(Debug, Clone)]
pub struct AllocRequest {
    pub psize: u64,
    pub ndvas: usize,
    pub txg: Txg,
    /// Per-copy placement hints, usually the DVAs of a previous version of
    /// the block.
    pub hint: Option<Vec<Dva>>,
    pub flags: AllocFlags,
}

impl AllocRequest {
    pub fn new(psize: u64, ndvas: usize, txg: Txg) -> AllocRequest {
        AllocRequest {
            psize,
            ndvas,
            txg,
            hint: None,
            flags: AllocFlags::default(),
        }
    }

    pub fn with_hint(self, hint: Vec<Dva>) -> AllocRequest {
        AllocRequest {
            hint: Some(hint),
            ..self
        }
    }

    pub fn with_flags(self, flags: AllocFlags) -> AllocRequest {
        AllocRequest { flags, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txg_slots() {
        assert_eq!(Txg(4).slot(), 0);
        assert_eq!(Txg(7).slot(), 3);
        assert_eq!(Txg(9).defer_slot(), 1);
        assert_eq!(Txg(9).clean().slot(), 0);
        assert!(Txg::DRY_RUN.is_dry_run());
        assert!(!TXG_INITIAL.is_dry_run());
    }

    #[test]
    fn test_asize_without_parity_rounds_to_sector() {
        let dev = DeviceInfo::new(DeviceId(0), 1 << 30, 24);
        assert_eq!(dev.psize_to_asize(1), 512);
        assert_eq!(dev.psize_to_asize(4096), 4096);
        assert_eq!(dev.psize_to_asize(4097), 4608);
        let dev = dev.with_ashift(12);
        assert_eq!(dev.psize_to_asize(512), 4096);
        assert_eq!(dev.copies(), 1);
    }

    #[test]
    fn test_asize_with_parity() {
        // 4 data + 1 parity: 8 data sectors need 2 parity sectors, and the
        // total is rounded up to a multiple of nparity + 1.
        let dev = DeviceInfo::new(DeviceId(0), 1 << 30, 24).with_parity(5, 1);
        assert_eq!(dev.psize_to_asize(4096), 10 * 512);
        // 1 data sector + 1 parity sector.
        assert_eq!(dev.psize_to_asize(512), 2 * 512);
        assert_eq!(dev.copies(), 2);

        let dev = DeviceInfo::new(DeviceId(0), 1 << 30, 24).with_parity(6, 2);
        // 3 sectors of data, 2 parity sectors, rounded up to 6.
        assert_eq!(dev.psize_to_asize(1536), 6 * 512);
        assert_eq!(dev.copies(), 3);
    }

    #[test]
    fn test_deflate() {
        let dev = DeviceInfo::new(DeviceId(0), 1 << 30, 24);
        assert_eq!(dev.deflate(1 << 20), 1 << 20);
        assert_eq!(dev.deflate(-(1 << 20)), -(1 << 20));
        let dev = dev.with_deflate_ratio(256);
        assert_eq!(dev.deflate(1 << 20), 1 << 19);
    }

    #[test]
    fn test_dva_display() {
        let dva = Dva {
            vdev: DeviceId(2),
            offset: 0x1000,
            asize: 0x200,
            gang: true,
            copies: 1,
        };
        assert_eq!(dva.to_string(), "<2:0x1000:0x200>G");
    }
}
