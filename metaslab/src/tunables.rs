use crate::strategy::StrategyKind;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use util::get_tunable;

lazy_static! {
    static ref METASLAB_ALIQUOT: u64 = get_tunable("metaslab_aliquot", 512 << 10);
    static ref METASLAB_GANG_THRESHOLD: u64 = get_tunable("metaslab_gang_threshold", u64::MAX);
    static ref METASLAB_DEBUG: bool = get_tunable("metaslab_debug", false);
    static ref METASLAB_UNLOAD_DELAY: u64 = get_tunable("metaslab_unload_delay", 10);
    static ref METASLAB_UNLOAD_LIMIT: u64 = get_tunable("metaslab_unload_limit", 1);
    static ref METASLAB_DF_ALLOC_THRESHOLD: u64 =
        get_tunable("metaslab_df_alloc_threshold", 128 << 10);
    static ref METASLAB_DF_FREE_PCT: u64 = get_tunable("metaslab_df_free_pct", 4);
    static ref METASLAB_MIN_ALLOC_SIZE: u64 = get_tunable("metaslab_min_alloc_size", 10 << 20);
    static ref METASLAB_PREFETCH_LIMIT: usize = get_tunable("metaslab_prefetch_limit", 3);
    static ref METASLAB_NDF_CLUMP_SHIFT: u32 = get_tunable("metaslab_ndf_clump_shift", 4);
    static ref ZFS_MG_BIAS_FACTOR: i64 = get_tunable("zfs_mg_bias_factor", 100);
    static ref ZFS_MG_STRONGER_BIAS: bool = get_tunable("zfs_mg_stronger_bias", true);
    static ref ZFS_MG_SKIP_THRESHOLD: i64 = get_tunable("zfs_mg_skip_threshold", 20);
    static ref ZFS_MG_SKIP_RATIO: i64 = get_tunable("zfs_mg_skip_ratio", 1280);
    static ref METASLAB_STRATEGY: StrategyKind =
        get_tunable("metaslab_strategy", StrategyKind::NearDataFit);
}

/// Policy knobs for one allocation domain.  `Default` latches the
/// process-wide tunables (see `util::read_tunable_config`); tests and
/// embedders may override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    /// Bytes allocated from one device before the rotor moves on (scaled
    /// by the device's child count).
    pub aliquot: u64,
    /// Requests at least this large are randomly failed to exercise
    /// ganging.
    pub gang_threshold: u64,
    /// Load every index at open and never unload.
    pub debug: bool,
    /// Txgs an index must stay idle before it may be unloaded; 0 disables
    /// unloading.
    pub unload_delay: u64,
    /// Unloads per device allowed before reassessment resets the count.
    pub unload_limit: u64,
    pub df_alloc_threshold: u64,
    pub df_free_pct: u64,
    pub min_alloc_size: u64,
    pub prefetch_limit: usize,
    pub ndf_clump_shift: u32,
    /// Percentage strength of the device usage bias, 0..=100.
    pub bias_factor: i64,
    /// Exclude a device's own usage from the domain average it is compared
    /// to.
    pub stronger_bias: bool,
    pub skip_threshold: i64,
    pub skip_ratio: i64,
    pub strategy: StrategyKind,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            aliquot: *METASLAB_ALIQUOT,
            gang_threshold: *METASLAB_GANG_THRESHOLD,
            debug: *METASLAB_DEBUG,
            unload_delay: *METASLAB_UNLOAD_DELAY,
            unload_limit: *METASLAB_UNLOAD_LIMIT,
            df_alloc_threshold: *METASLAB_DF_ALLOC_THRESHOLD,
            df_free_pct: *METASLAB_DF_FREE_PCT,
            min_alloc_size: *METASLAB_MIN_ALLOC_SIZE,
            prefetch_limit: *METASLAB_PREFETCH_LIMIT,
            ndf_clump_shift: *METASLAB_NDF_CLUMP_SHIFT,
            bias_factor: *ZFS_MG_BIAS_FACTOR,
            stronger_bias: *ZFS_MG_STRONGER_BIAS,
            skip_threshold: *ZFS_MG_SKIP_THRESHOLD,
            skip_ratio: *ZFS_MG_SKIP_RATIO,
            strategy: *METASLAB_STRATEGY,
        }
    }
}

impl Tunables {
    /// Out-of-range bias factors behave as full strength.
    pub(crate) fn effective_bias_factor(&self) -> i64 {
        if (0..=100).contains(&self.bias_factor) {
            self.bias_factor
        } else {
            100
        }
    }

    /// The skip heuristic only applies with a threshold in 1..=100 and a
    /// ratio of at least 1024 (i.e. 1.0).
    pub(crate) fn skip_enabled(&self) -> bool {
        (1..=100).contains(&self.skip_threshold) && self.skip_ratio >= 1 << 10
    }
}
