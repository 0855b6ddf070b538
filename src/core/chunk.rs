//! BTRFS Chunk tree and chunk allocator
//!
//! The chunk tree maps logical addresses to device stripes. New chunks are
//! carved out of unallocated device space when a space info runs short;
//! [`do_chunk_alloc`] decides when that happens.

use super::{
    block_group, free_space::RangeTree, item_type, objectid, space_info::SpaceInfo,
    tree::{BtrfsKey, KeyValueTree},
    BtrfsError, FsContext, Result,
};
use crate::blockdev::BlockDevice;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

/// Per-device stripe unit
pub const STRIPE_LEN: u64 = 64 * 1024;

/// Space at the start of every device that is never allocated
pub const DEVICE_RESERVED: u64 = MIB;

/// Smallest device stripe worth allocating
pub const MIN_STRIPE_SIZE: u64 = MIB;

/// Size of the fixed part of a chunk item
const CHUNK_ITEM_SIZE: usize = 0x30;

/// Size of one stripe in a chunk item
const STRIPE_ITEM_SIZE: usize = 0x20;

/// A chunk mapping entry
#[derive(Debug, Clone)]
pub struct ChunkMapping {
    /// Logical address start
    pub logical: u64,
    /// Size of the chunk
    pub size: u64,
    /// Stripe length
    pub stripe_len: u64,
    /// Type flags
    pub type_flags: u64,
    /// Number of stripes
    pub num_stripes: u16,
    /// Sub stripes
    pub sub_stripes: u16,
    /// Stripe information
    pub stripes: Vec<Stripe>,
}

/// A stripe within a chunk
#[derive(Debug, Clone)]
pub struct Stripe {
    /// Device ID
    pub devid: u64,
    /// Offset on device
    pub offset: u64,
    /// Device UUID
    pub dev_uuid: [u8; 16],
}

/// Chunk type flags
pub mod chunk_type {
    pub const DATA: u64 = 1 << 0;
    pub const SYSTEM: u64 = 1 << 1;
    pub const METADATA: u64 = 1 << 2;
    pub const RAID0: u64 = 1 << 3;
    pub const RAID1: u64 = 1 << 4;
    pub const DUP: u64 = 1 << 5;
    pub const RAID10: u64 = 1 << 6;
    pub const RAID5: u64 = 1 << 7;
    pub const RAID6: u64 = 1 << 8;
    pub const RAID1C3: u64 = 1 << 9;
    pub const RAID1C4: u64 = 1 << 10;

    /// Allocation-class bits
    pub const TYPE_MASK: u64 = DATA | SYSTEM | METADATA;
    /// Replication profile bits
    pub const PROFILE_MASK: u64 =
        RAID0 | RAID1 | DUP | RAID10 | RAID5 | RAID6 | RAID1C3 | RAID1C4;
}

/// Number of RAID-profile buckets kept per space info
pub const NR_RAID_TYPES: usize = 5;

/// Bucket index of a profile, most redundant first
pub fn raid_index(flags: u64) -> usize {
    if flags & chunk_type::RAID10 != 0 {
        0
    } else if flags & chunk_type::RAID1 != 0 {
        1
    } else if flags & chunk_type::DUP != 0 {
        2
    } else if flags & chunk_type::RAID0 != 0 {
        3
    } else {
        4
    }
}

/// Raw bytes consumed per logical byte
pub fn profile_factor(flags: u64) -> u64 {
    if flags & (chunk_type::DUP | chunk_type::RAID1 | chunk_type::RAID10) != 0 {
        2
    } else {
        1
    }
}

/// Replication profile of a block group type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    #[default]
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
}

impl RaidProfile {
    /// Profile bits for chunk and block group flags
    pub const fn flags(self) -> u64 {
        match self {
            Self::Single => 0,
            Self::Dup => chunk_type::DUP,
            Self::Raid0 => chunk_type::RAID0,
            Self::Raid1 => chunk_type::RAID1,
            Self::Raid10 => chunk_type::RAID10,
        }
    }

    /// Minimum number of devices the profile needs
    pub const fn min_devices(self) -> usize {
        match self {
            Self::Single | Self::Dup => 1,
            Self::Raid0 | Self::Raid1 => 2,
            Self::Raid10 => 4,
        }
    }
}

/// Chunk allocation urgency, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum ChunkAllocForce {
    /// Allocate only when the heuristics say so
    #[default]
    NoForce,
    /// Allocate when headroom falls under a size-relative threshold
    Limited,
    /// Always allocate
    Force,
}

/// A device the chunk allocator may carve stripes from
#[derive(Clone)]
pub struct DeviceSpec {
    pub devid: u64,
    pub total_bytes: u64,
    /// Backing device, used for discards
    pub device: Option<Arc<dyn BlockDevice>>,
}

impl DeviceSpec {
    /// A device with no backing store
    pub fn new(devid: u64, total_bytes: u64) -> Self {
        Self {
            devid,
            total_bytes,
            device: None,
        }
    }

    /// A device whose freed ranges can be discarded
    pub fn with_device(devid: u64, device: Arc<dyn BlockDevice>) -> Self {
        Self {
            devid,
            total_bytes: device.size(),
            device: Some(device),
        }
    }
}

struct DeviceState {
    total_bytes: u64,
    /// Dev extents already handed to chunks
    allocated: RangeTree,
    device: Option<Arc<dyn BlockDevice>>,
}

impl DeviceState {
    fn free_bytes(&self) -> u64 {
        self.total_bytes
            .saturating_sub(DEVICE_RESERVED)
            .saturating_sub(self.allocated.total())
    }

    /// Largest unallocated hole as `(offset, len)`
    fn largest_hole(&self) -> Option<(u64, u64)> {
        let mut best: Option<(u64, u64)> = None;
        let mut cursor = DEVICE_RESERVED;
        let mut consider = |start: u64, end: u64| {
            if end > start && best.is_none_or(|(_, l)| end - start > l) {
                best = Some((start, end - start));
            }
        };
        for (s, e) in self.allocated.iter() {
            if s > cursor {
                consider(cursor, s);
            }
            cursor = cursor.max(e);
        }
        consider(cursor, self.total_bytes);
        best
    }
}

/// The chunk tree manages logical to physical address mappings and the raw
/// device space behind them
pub struct ChunkTree {
    /// Ordered map of logical address -> chunk mapping
    chunks: BTreeMap<u64, ChunkMapping>,
    devices: BTreeMap<u64, DeviceState>,
}

impl ChunkTree {
    /// Creates an empty chunk tree over the given devices
    pub fn new(devices: &[DeviceSpec]) -> Self {
        let devices = devices
            .iter()
            .map(|d| {
                (
                    d.devid,
                    DeviceState {
                        total_bytes: d.total_bytes,
                        allocated: RangeTree::new(),
                        device: d.device.clone(),
                    },
                )
            })
            .collect();
        Self {
            chunks: BTreeMap::new(),
            devices,
        }
    }

    /// Rebuilds the chunk map from persisted `CHUNK_ITEM`s
    pub fn load(chunk_root: &dyn KeyValueTree, devices: &[DeviceSpec]) -> Result<Self> {
        let mut tree = Self::new(devices);
        let min = BtrfsKey::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, 0);
        let max = BtrfsKey::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, u64::MAX);
        for (key, data) in chunk_root.range(&min, &max)? {
            let chunk = Self::parse_chunk_item(&data, key.offset)?;
            tree.insert_mapping(chunk)?;
        }
        Ok(tree)
    }

    /// Parses a CHUNK_ITEM from bytes
    fn parse_chunk_item(data: &[u8], logical: u64) -> Result<ChunkMapping> {
        if data.len() < CHUNK_ITEM_SIZE {
            return Err(BtrfsError::Corrupt("CHUNK_ITEM too small".to_string()));
        }

        let size = LittleEndian::read_u64(&data[0..8]);
        let stripe_len = LittleEndian::read_u64(&data[16..24]);
        let type_flags = LittleEndian::read_u64(&data[24..32]);
        let num_stripes = LittleEndian::read_u16(&data[44..46]);
        let sub_stripes = LittleEndian::read_u16(&data[46..48]);

        let mut stripes = Vec::with_capacity(num_stripes as usize);
        let mut offset = CHUNK_ITEM_SIZE;

        for _ in 0..num_stripes {
            if offset + STRIPE_ITEM_SIZE > data.len() {
                return Err(BtrfsError::Corrupt("CHUNK_ITEM stripe data truncated".to_string()));
            }

            let devid = LittleEndian::read_u64(&data[offset..offset + 8]);
            let stripe_offset = LittleEndian::read_u64(&data[offset + 8..offset + 16]);
            let mut dev_uuid = [0u8; 16];
            dev_uuid.copy_from_slice(&data[offset + 16..offset + 32]);

            stripes.push(Stripe {
                devid,
                offset: stripe_offset,
                dev_uuid,
            });

            offset += STRIPE_ITEM_SIZE;
        }

        Ok(ChunkMapping {
            logical,
            size,
            stripe_len,
            type_flags,
            num_stripes,
            sub_stripes,
            stripes,
        })
    }

    /// Serializes a chunk into a CHUNK_ITEM payload
    fn chunk_item_bytes(chunk: &ChunkMapping, sector_size: u32) -> Vec<u8> {
        let mut data = vec![0u8; CHUNK_ITEM_SIZE + chunk.stripes.len() * STRIPE_ITEM_SIZE];
        LittleEndian::write_u64(&mut data[0..8], chunk.size);
        LittleEndian::write_u64(&mut data[8..16], objectid::EXTENT_TREE);
        LittleEndian::write_u64(&mut data[16..24], chunk.stripe_len);
        LittleEndian::write_u64(&mut data[24..32], chunk.type_flags);
        LittleEndian::write_u32(&mut data[32..36], STRIPE_LEN as u32);
        LittleEndian::write_u32(&mut data[36..40], STRIPE_LEN as u32);
        LittleEndian::write_u32(&mut data[40..44], sector_size);
        LittleEndian::write_u16(&mut data[44..46], chunk.num_stripes);
        LittleEndian::write_u16(&mut data[46..48], chunk.sub_stripes);

        for (i, stripe) in chunk.stripes.iter().enumerate() {
            let off = CHUNK_ITEM_SIZE + i * STRIPE_ITEM_SIZE;
            LittleEndian::write_u64(&mut data[off..off + 8], stripe.devid);
            LittleEndian::write_u64(&mut data[off + 8..off + 16], stripe.offset);
            data[off + 16..off + 32].copy_from_slice(&stripe.dev_uuid);
        }
        data
    }

    fn insert_mapping(&mut self, chunk: ChunkMapping) -> Result<()> {
        let per_device = Self::device_stripe_size(&chunk);
        for stripe in &chunk.stripes {
            let dev = self.devices.get_mut(&stripe.devid).ok_or_else(|| {
                BtrfsError::Corrupt(format!(
                    "chunk {} references missing device {}",
                    chunk.logical, stripe.devid
                ))
            })?;
            if dev.allocated.overlaps(stripe.offset, per_device) {
                return Err(BtrfsError::Corrupt(format!(
                    "dev extent {}@{} overlaps another chunk",
                    stripe.devid, stripe.offset
                )));
            }
            dev.allocated.insert(stripe.offset, per_device);
        }
        self.chunks.insert(chunk.logical, chunk);
        Ok(())
    }

    /// Bytes each stripe occupies on its device
    fn device_stripe_size(chunk: &ChunkMapping) -> u64 {
        let n = chunk.num_stripes.max(1) as u64;
        if chunk.type_flags & chunk_type::RAID0 != 0 {
            chunk.size / n
        } else if chunk.type_flags & chunk_type::RAID10 != 0 {
            chunk.size / (n / chunk.sub_stripes.max(1) as u64).max(1)
        } else {
            chunk.size
        }
    }

    /// Translates a logical address to `(devid, physical)` copies
    pub fn logical_to_physical(&self, logical: u64) -> Result<Vec<(u64, u64)>> {
        let chunk = self
            .chunks
            .range(..=logical)
            .next_back()
            .map(|(_, v)| v)
            .ok_or_else(|| {
                BtrfsError::NotFound(format!("No chunk mapping for logical address {}", logical))
            })?;

        if logical >= chunk.logical + chunk.size {
            return Err(BtrfsError::NotFound(format!(
                "Logical address {} not in any chunk",
                logical
            )));
        }

        let offset_in_chunk = logical - chunk.logical;
        let mut physical_addrs = Vec::new();

        if chunk.type_flags & (chunk_type::RAID0 | chunk_type::RAID10) != 0 {
            let group = if chunk.type_flags & chunk_type::RAID10 != 0 {
                chunk.sub_stripes.max(1) as u64
            } else {
                1
            };
            let width = chunk.num_stripes as u64 / group;
            let stripe_nr = offset_in_chunk / chunk.stripe_len;
            let stripe_offset = offset_in_chunk % chunk.stripe_len;
            let first = ((stripe_nr % width) * group) as usize;
            let row = stripe_nr / width;
            for stripe in chunk.stripes.iter().skip(first).take(group as usize) {
                physical_addrs.push((
                    stripe.devid,
                    stripe.offset + row * chunk.stripe_len + stripe_offset,
                ));
            }
        } else {
            // single, DUP and RAID1 keep identical copies at the same offset
            for stripe in &chunk.stripes {
                physical_addrs.push((stripe.devid, stripe.offset + offset_in_chunk));
            }
        }

        if physical_addrs.is_empty() {
            return Err(BtrfsError::NotFound(format!(
                "Could not translate logical address {}",
                logical
            )));
        }

        Ok(physical_addrs)
    }

    /// Reverse-maps a physical byte into the logical addresses of a chunk
    pub fn physical_to_logical(&self, chunk_start: u64, physical: u64) -> Vec<u64> {
        let Some(chunk) = self.chunks.get(&chunk_start) else {
            return Vec::new();
        };
        let per_device = Self::device_stripe_size(chunk);
        let mut logical = Vec::new();

        for (index, stripe) in chunk.stripes.iter().enumerate() {
            if physical < stripe.offset || physical >= stripe.offset + per_device {
                continue;
            }
            let dev_off = physical - stripe.offset;
            let addr = if chunk.type_flags & (chunk_type::RAID0 | chunk_type::RAID10) != 0 {
                let group = if chunk.type_flags & chunk_type::RAID10 != 0 {
                    chunk.sub_stripes.max(1) as u64
                } else {
                    1
                };
                let width = chunk.num_stripes as u64 / group;
                let row = dev_off / chunk.stripe_len;
                let column = index as u64 / group;
                chunk.logical + (row * width + column) * chunk.stripe_len + dev_off % chunk.stripe_len
            } else {
                chunk.logical + dev_off
            };
            if !logical.contains(&addr) {
                logical.push(addr);
            }
        }
        logical
    }

    /// Splits `[logical, logical + len)` into `(devid, physical, len)` pieces
    /// that are contiguous on their device
    pub fn map_range(&self, logical: u64, len: u64) -> Result<Vec<(u64, u64, u64)>> {
        let mut pieces = Vec::new();
        let mut cursor = logical;
        let end = logical + len;
        while cursor < end {
            let chunk = self
                .chunks
                .range(..=cursor)
                .next_back()
                .map(|(_, c)| c)
                .filter(|c| cursor < c.logical + c.size)
                .ok_or_else(|| BtrfsError::NotFound(format!("No chunk for {}", cursor)))?;
            let mut piece_end = end.min(chunk.logical + chunk.size);
            if chunk.type_flags & (chunk_type::RAID0 | chunk_type::RAID10) != 0 {
                let in_chunk = cursor - chunk.logical;
                piece_end = piece_end.min(cursor + chunk.stripe_len - in_chunk % chunk.stripe_len);
            }
            for (devid, physical) in self.logical_to_physical(cursor)? {
                pieces.push((devid, physical, piece_end - cursor));
            }
            cursor = piece_end;
        }
        Ok(pieces)
    }

    /// Returns all chunks
    pub fn chunks(&self) -> &BTreeMap<u64, ChunkMapping> {
        &self.chunks
    }

    /// Backing device for a devid
    pub fn device(&self, devid: u64) -> Option<Arc<dyn BlockDevice>> {
        self.devices.get(&devid).and_then(|d| d.device.clone())
    }

    /// Raw bytes across all devices
    pub fn total_device_bytes(&self) -> u64 {
        self.devices.values().map(|d| d.total_bytes).sum()
    }

    /// Raw bytes not yet handed to any chunk
    pub fn unallocated_bytes(&self) -> u64 {
        self.devices.values().map(DeviceState::free_bytes).sum()
    }

    /// Number of devices
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// First logical byte after every existing chunk
    fn next_logical(&self, first_logical_byte: u64) -> u64 {
        self.chunks
            .values()
            .next_back()
            .map(|c| c.logical + c.size)
            .unwrap_or(0)
            .max(first_logical_byte)
    }

    /// Carves a new chunk out of unallocated device space
    pub fn alloc_chunk(
        &mut self,
        type_flags: u64,
        max_chunk_size: u64,
        first_logical_byte: u64,
    ) -> Result<ChunkMapping> {
        let profile = type_flags & chunk_type::PROFILE_MASK;
        if profile & (chunk_type::RAID5 | chunk_type::RAID6 | chunk_type::RAID1C3 | chunk_type::RAID1C4)
            != 0
        {
            return Err(BtrfsError::InvalidConfig(format!(
                "unsupported chunk profile {:#x}",
                profile
            )));
        }

        // chunks never exceed a tenth of the raw space
        let max_chunk_size = max_chunk_size.min(self.total_device_bytes() / 10).max(MIN_STRIPE_SIZE);

        let mut holes: Vec<(u64, u64, u64)> = self
            .devices
            .iter()
            .filter_map(|(&devid, d)| d.largest_hole().map(|(off, len)| (devid, off, len)))
            .filter(|&(_, _, len)| len >= MIN_STRIPE_SIZE)
            .collect();
        holes.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));

        let (num_stripes, sub_stripes, data_stripes) = match profile {
            chunk_type::DUP => (2usize, 0u16, 1u64),
            chunk_type::RAID1 => (2, 0, 1),
            chunk_type::RAID0 => {
                let n = holes.len();
                (n, 0, n as u64)
            }
            chunk_type::RAID10 => {
                let n = holes.len() & !1;
                (n, 2, (n / 2) as u64)
            }
            _ => (1, 0, 1),
        };
        let devs_needed = if profile == chunk_type::DUP { 1 } else { num_stripes };
        let devs_min = match profile {
            chunk_type::RAID0 | chunk_type::RAID1 => 2,
            chunk_type::RAID10 => 4,
            _ => 1,
        };
        if devs_needed == 0 || holes.len() < devs_needed || devs_needed < devs_min {
            return Err(BtrfsError::NoSpace);
        }
        holes.truncate(devs_needed);

        let smallest_hole = holes.iter().map(|h| h.2).min().unwrap_or(0);
        let usable = if profile == chunk_type::DUP {
            smallest_hole / 2
        } else {
            smallest_hole
        };
        let mut stripe_size = (max_chunk_size / data_stripes).min(usable);
        stripe_size -= stripe_size % STRIPE_LEN;
        if stripe_size < MIN_STRIPE_SIZE {
            return Err(BtrfsError::NoSpace);
        }

        let mut stripes = Vec::with_capacity(num_stripes);
        if profile == chunk_type::DUP {
            let (devid, off, _) = holes[0];
            stripes.push(new_stripe(devid, off));
            stripes.push(new_stripe(devid, off + stripe_size));
        } else {
            for &(devid, off, _) in &holes {
                stripes.push(new_stripe(devid, off));
            }
        }

        let chunk = ChunkMapping {
            logical: self.next_logical(first_logical_byte),
            size: stripe_size * data_stripes,
            stripe_len: STRIPE_LEN,
            type_flags,
            num_stripes: num_stripes as u16,
            sub_stripes,
            stripes,
        };
        self.insert_mapping(chunk.clone())?;
        Ok(chunk)
    }
}

fn new_stripe(devid: u64, offset: u64) -> Stripe {
    let mut dev_uuid = [0u8; 16];
    dev_uuid[..8].copy_from_slice(&devid.to_le_bytes());
    Stripe {
        devid,
        offset,
        dev_uuid,
    }
}

/// Picks the single profile new chunks of `type_flags` get
pub fn get_alloc_profile(fs: &FsContext, type_flags: u64) -> u64 {
    let config = fs.config();
    let wanted = if type_flags & chunk_type::DATA != 0 {
        config.data_profile
    } else if type_flags & chunk_type::SYSTEM != 0 {
        config.system_profile
    } else {
        config.metadata_profile
    };
    let num_devices = fs.chunks.lock().num_devices();

    let profile = if num_devices < wanted.min_devices() {
        // degrade to what the device count can hold
        match wanted {
            RaidProfile::Raid10 | RaidProfile::Raid1 if num_devices >= 2 => RaidProfile::Raid1,
            RaidProfile::Raid10 | RaidProfile::Raid1 | RaidProfile::Dup => RaidProfile::Dup,
            _ => RaidProfile::Single,
        }
    } else {
        wanted
    };
    (type_flags & chunk_type::TYPE_MASK) | profile.flags()
}

/// Decides whether a space info is short enough to deserve a new chunk
pub fn should_alloc_chunk(
    fs: &FsContext,
    space_info: &SpaceInfo,
    alloc_bytes: u64,
    force: ChunkAllocForce,
) -> bool {
    let policy = &fs.config().policy;
    let fs_total = fs.super_total_bytes();
    let counters = space_info.lock();

    if force == ChunkAllocForce::Force {
        return true;
    }

    let num_bytes = counters.total_bytes.saturating_sub(counters.bytes_readonly);
    let num_allocated = counters.bytes_used
        + counters.bytes_reserved
        + counters.bytes_pinned
        + counters.bytes_readonly
        + counters.bytes_may_use
        + alloc_bytes;

    if force == ChunkAllocForce::Limited {
        let thresh = (fs_total * policy.chunk_limited_percent / 100).max(policy.chunk_limited_min_thresh);
        if num_bytes.saturating_sub(num_allocated) < thresh {
            return true;
        }
    }

    let thresh = (fs_total * policy.chunk_thresh_permille / 1000).max(policy.chunk_min_thresh);
    if num_bytes > thresh && counters.bytes_used < num_bytes * policy.chunk_used_tenths / 10 {
        return false;
    }
    num_allocated >= num_bytes * policy.chunk_alloc_tenths / 10
}

/// Allocates a new chunk for `flags` if the space info needs one
///
/// Returns `Ok(true)` when a chunk was created. Concurrent callers for the
/// same space info wait for the one in flight and then re-evaluate.
pub fn do_chunk_alloc(
    fs: &FsContext,
    alloc_bytes: u64,
    flags: u64,
    force: ChunkAllocForce,
) -> Result<bool> {
    fs.check_writable()?;
    let flags = get_alloc_profile(fs, flags);
    let space_info = fs.get_or_create_space_info(flags);
    let mut force = force;

    loop {
        let mut counters = space_info.lock();
        force = force.max(counters.force_alloc);
        if counters.full && force != ChunkAllocForce::Force {
            return Ok(false);
        }
        if counters.chunk_alloc {
            space_info.wait_chunk_alloc(&mut counters);
            continue;
        }
        drop(counters);

        if !should_alloc_chunk(fs, &space_info, alloc_bytes, force) {
            return Ok(false);
        }

        let mut counters = space_info.lock();
        if counters.chunk_alloc {
            continue;
        }
        counters.chunk_alloc = true;
        break;
    }

    // every metadata_ratio data chunks, top up metadata too
    if flags & chunk_type::DATA != 0 && fs.config().metadata_ratio > 0 {
        let n = fs.note_data_chunk();
        if n % fs.config().metadata_ratio == 0 {
            fs.force_metadata_allocation();
        }
    }

    let ret = check_system_chunk(fs, flags).and_then(|_| btrfs_alloc_chunk(fs, flags));

    let mut counters = space_info.lock();
    let allocated = match ret {
        Ok(()) => {
            counters.full = false;
            true
        }
        Err(BtrfsError::NoSpace) => {
            counters.full = true;
            false
        }
        Err(e) => {
            counters.chunk_alloc = false;
            space_info.notify_chunk_waiters();
            return Err(e);
        }
    };
    counters.force_alloc = ChunkAllocForce::NoForce;
    counters.chunk_alloc = false;
    space_info.notify_chunk_waiters();
    Ok(allocated)
}

/// Makes sure the system space info can absorb one more chunk item
fn check_system_chunk(fs: &FsContext, flags: u64) -> Result<()> {
    if flags & chunk_type::SYSTEM != 0 {
        return Ok(());
    }
    let Some(system) = fs.find_space_info(chunk_type::SYSTEM) else {
        return Ok(());
    };
    // one chunk item plus its stripes, for up to 8 devices
    let needed = (CHUNK_ITEM_SIZE + 8 * STRIPE_ITEM_SIZE) as u64 + fs.config().node_size as u64;
    let left = {
        let c = system.lock();
        c.total_bytes.saturating_sub(c.used_bytes(true))
    };
    if left < needed {
        debug!(left, needed, "system space low, allocating a system chunk");
        let sys_flags = get_alloc_profile(fs, chunk_type::SYSTEM);
        match btrfs_alloc_chunk(fs, sys_flags) {
            Ok(()) | Err(BtrfsError::NoSpace) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Carves a chunk, records it and creates its block group
pub fn btrfs_alloc_chunk(fs: &FsContext, flags: u64) -> Result<()> {
    let policy = &fs.config().policy;
    let max_chunk = if flags & chunk_type::DATA != 0 {
        policy.max_data_chunk
    } else if flags & chunk_type::SYSTEM != 0 {
        policy.max_system_chunk
    } else {
        policy.max_metadata_chunk
    };

    let chunk = {
        let mut chunks = fs.chunks.lock();
        let chunk = chunks.alloc_chunk(flags, max_chunk, fs.first_logical_byte())?;
        let key = BtrfsKey::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, chunk.logical);
        if let Err(e) = fs
            .chunk_root()
            .insert(key, ChunkTree::chunk_item_bytes(&chunk, fs.config().sector_size))
        {
            warn!(logical = chunk.logical, error = %e, "failed to record chunk item");
            return Err(e);
        }
        chunk
    };

    info!(
        logical = chunk.logical,
        size = chunk.size,
        flags = format_args!("{:#x}", flags),
        "allocated chunk"
    );
    block_group::make_block_group(fs, 0, flags, chunk.logical, chunk.size)
}
