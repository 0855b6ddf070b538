//! Mount options and space-management policy
//!
//! Everything here is plain data that can be loaded from JSON. The policy
//! constants default to the values the allocator has always shipped with;
//! they shape how eagerly space is over-committed and chunks are carved, but
//! correctness never depends on their exact values.

use super::{checksum::Checksum, chunk::RaidProfile, BtrfsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Tunable space-management constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpacePolicy {
    /// Right shift applied to unallocated device space when flushing is
    /// allowed (`avail >> 3`)
    pub overcommit_shift_flush: u32,
    /// Right shift applied when the caller may not flush (`avail >> 1`)
    pub overcommit_shift_no_flush: u32,
    /// Minimum headroom that triggers a chunk in `Limited` force mode
    pub chunk_limited_min_thresh: u64,
    /// Percent of the filesystem size used as the `Limited` threshold
    pub chunk_limited_percent: u64,
    /// Lower bound of the "large space info" threshold
    pub chunk_min_thresh: u64,
    /// Fraction (in tenths of a percent) of the filesystem used as the
    /// "large space info" threshold
    pub chunk_thresh_permille: u64,
    /// Large space infos skip allocation while used < tenths * this
    pub chunk_used_tenths: u64,
    /// Skip allocation while allocated < tenths * this
    pub chunk_alloc_tenths: u64,
    /// Upper bound on the global block reservation
    pub global_rsv_max: u64,
    /// Largest data chunk
    pub max_data_chunk: u64,
    /// Largest metadata chunk
    pub max_metadata_chunk: u64,
    /// Largest system chunk
    pub max_system_chunk: u64,
    /// Heads gathered per delayed-ref cluster
    pub delayed_ref_cluster: usize,
    /// Reservation flush attempts before giving up
    pub flush_retries: u32,
    /// Delayed ref updates that make `end_transaction` run some refs
    pub delayed_ref_batch: u64,
}

impl Default for SpacePolicy {
    fn default() -> Self {
        Self {
            overcommit_shift_flush: 3,
            overcommit_shift_no_flush: 1,
            chunk_limited_min_thresh: 64 * MIB,
            chunk_limited_percent: 1,
            chunk_min_thresh: 256 * MIB,
            chunk_thresh_permille: 5,
            chunk_used_tenths: 3,
            chunk_alloc_tenths: 8,
            global_rsv_max: 512 * MIB,
            max_data_chunk: GIB,
            max_metadata_chunk: 256 * MIB,
            max_system_chunk: 32 * MIB,
            delayed_ref_cluster: 32,
            flush_retries: 2,
            delayed_ref_batch: 64,
        }
    }
}

/// Extent-engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtentConfig {
    /// Allocation granularity
    pub sector_size: u32,
    /// Tree block size
    pub node_size: u32,
    /// Alignment of allocated extents
    pub stripe_size: u32,
    /// Checksum algorithm (sizes the global reservation)
    pub csum_type: Checksum,
    /// Discard freed ranges on the device when they are unpinned
    pub discard: bool,
    /// Solid-state device: cluster data allocations as well as metadata
    pub ssd: bool,
    /// Persist free-space caches on commit and load them on first use
    pub space_cache: bool,
    /// Log a space dump whenever an allocation fails
    pub enospc_debug: bool,
    /// Force a metadata chunk every N data chunks (0 disables)
    pub metadata_ratio: u64,
    /// Run block-group caching on the worker pool instead of inline
    pub async_caching: bool,
    /// Worker threads for caching
    pub caching_workers: usize,
    /// Extent items scanned before the caching thread publishes progress
    pub caching_batch_items: usize,
    /// Replication of new data chunks
    pub data_profile: RaidProfile,
    /// Replication of new metadata chunks
    pub metadata_profile: RaidProfile,
    /// Replication of new system chunks
    pub system_profile: RaidProfile,
    /// Tunable policy constants
    pub policy: SpacePolicy,
}

impl Default for ExtentConfig {
    fn default() -> Self {
        Self {
            sector_size: 4096,
            node_size: 16384,
            stripe_size: 4096,
            csum_type: Checksum::Crc32c,
            discard: false,
            ssd: false,
            space_cache: true,
            enospc_debug: false,
            metadata_ratio: 0,
            async_caching: true,
            caching_workers: 2,
            caching_batch_items: 256,
            data_profile: RaidProfile::Single,
            metadata_profile: RaidProfile::Dup,
            system_profile: RaidProfile::Dup,
            policy: SpacePolicy::default(),
        }
    }
}

impl ExtentConfig {
    /// Parses and validates a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BtrfsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Serializes the configuration as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BtrfsError::InvalidConfig(e.to_string()))
    }

    /// Checks the geometry for consistency
    pub fn validate(&self) -> Result<()> {
        let pow2 = |name: &str, v: u32| -> Result<()> {
            if v == 0 || !v.is_power_of_two() {
                return Err(BtrfsError::InvalidConfig(format!(
                    "{} must be a power of two, got {}",
                    name, v
                )));
            }
            Ok(())
        };
        pow2("sector_size", self.sector_size)?;
        pow2("node_size", self.node_size)?;
        pow2("stripe_size", self.stripe_size)?;

        if self.node_size < self.sector_size {
            return Err(BtrfsError::InvalidConfig(
                "node_size smaller than sector_size".to_string(),
            ));
        }
        if self.stripe_size < self.sector_size {
            return Err(BtrfsError::InvalidConfig(
                "stripe_size smaller than sector_size".to_string(),
            ));
        }
        if self.async_caching && self.caching_workers == 0 {
            return Err(BtrfsError::InvalidConfig(
                "async caching needs at least one worker".to_string(),
            ));
        }
        if self.caching_batch_items == 0 || self.policy.delayed_ref_cluster == 0 {
            return Err(BtrfsError::InvalidConfig(
                "batch sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
