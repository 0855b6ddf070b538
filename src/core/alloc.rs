//! Extent allocation
//!
//! [`find_free_extent`] places an allocation inside a block group of the
//! requested class. Each pass walks the groups of one profile in order,
//! trying the class's cluster first and then the group's free-space index;
//! every failed pass escalates the next one: wait for caching, force a new
//! chunk, drop the requested slack.
//!
//! The functions taking a [`TransHandle`] are the reference-count entry
//! points: they only queue delayed refs, which are applied later by
//! [`run_delayed_refs`](super::delayed_ref::run_delayed_refs).

use super::{
    block_group::{self, BlockGroupCache, CacheState, ReserveType},
    block_rsv::{unuse_block_rsv, use_block_rsv, BlockRsv},
    chunk::{self, chunk_type, ChunkAllocForce, NR_RAID_TYPES},
    delayed_ref::{ExtentOp, RefAction},
    extent::extent_flags,
    free_space::FreeCluster,
    item_type, objectid, pinned,
    space_info::dump_space_info,
    transaction::TransHandle,
    tree::BtrfsKey,
    BtrfsError, FsContext, Result,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const EMPTY_CLUSTER: u64 = 64 * 1024;
const CHUNK_SLACK: u64 = 2 * 1024 * 1024;

/// Escalation stages of a failed search
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LoopPhase {
    /// Only look at what is already indexed
    CachingNoWait,
    /// Wait for scans in progress
    CachingWait,
    /// Force a new chunk, then search again
    AllocChunk,
    /// Give up the requested slack
    NoEmptySize,
}

const PHASES: [LoopPhase; 4] = [
    LoopPhase::CachingNoWait,
    LoopPhase::CachingWait,
    LoopPhase::AllocChunk,
    LoopPhase::NoEmptySize,
];

struct Search<'a> {
    fs: &'a FsContext,
    type_flags: u64,
    num_bytes: u64,
    empty_size: u64,
    empty_cluster: u64,
    align: u64,
    cluster: Option<&'a Mutex<FreeCluster>>,
    reserve: ReserveType,
}

impl Search<'_> {
    fn group_matches(&self, cache: &BlockGroupCache) -> bool {
        let wanted = self.type_flags & chunk_type::TYPE_MASK;
        cache.flags & wanted == wanted
    }

    fn min_cluster_bytes(&self) -> u64 {
        if self.type_flags & chunk_type::METADATA != 0 {
            self.num_bytes
        } else {
            self.num_bytes.max((self.num_bytes + self.empty_size) >> 2)
        }
    }

    /// Tries the class cluster, moving it to `cache` if it lives elsewhere
    fn alloc_from_cluster(&self, cluster: &Mutex<FreeCluster>, cache: &BlockGroupCache, search_start: u64) -> Result<Option<u64>> {
        let mut cl = cluster.lock();
        if cl.block_group() == Some(cache.start) {
            if let Some(offset) = cl.alloc(self.num_bytes, self.align) {
                return Ok(Some(offset));
            }
        }

        if let Some(old) = cl.block_group() {
            match self.fs.lookup_block_group(old) {
                Some(old_cache) => cl.return_to(&mut old_cache.free_space_ctl())?,
                None => {
                    cl.reset();
                }
            }
        }

        let mut ctl = cache.free_space_ctl();
        let refilled = cl.refill(
            &mut ctl,
            cache.start,
            search_start,
            self.num_bytes,
            self.empty_cluster + self.empty_size,
            self.min_cluster_bytes(),
        );
        drop(ctl);
        if refilled {
            trace!(group = cache.start, window = cl.window_start(), "refilled cluster");
            return Ok(cl.alloc(self.num_bytes, self.align));
        }
        Ok(None)
    }

    fn alloc_unclustered(&self, cache: &BlockGroupCache, search_start: u64) -> Option<u64> {
        cache
            .free_space_ctl()
            .find_space_for_alloc(search_start, self.num_bytes, self.empty_size, self.align)
    }

    /// Attempts one group from `search_start`; `None` moves on to the next
    fn try_group(&self, cache: &Arc<BlockGroupCache>, phase: LoopPhase, search_start: u64) -> Result<Option<u64>> {
        if cache.is_ro() || !self.group_matches(cache) {
            return Ok(None);
        }

        let mut cached = cache.cached();
        if cached == CacheState::NotStarted {
            block_group::cache_block_group(self.fs, cache, false)?;
            cached = cache.cached();
        }
        if cached == CacheState::Error {
            return Ok(None);
        }

        let search_start = search_start.clamp(cache.start, cache.end());

        let mut offset = None;
        if let Some(cluster) = self.cluster {
            if cached == CacheState::Finished {
                offset = self.alloc_from_cluster(cluster, cache, search_start)?;
            }
        }
        if offset.is_none() {
            offset = self.alloc_unclustered(cache, search_start);
        }
        if offset.is_none() && phase >= LoopPhase::CachingWait && cached != CacheState::Finished {
            block_group::wait_block_group_cache_progress(cache, self.num_bytes + self.empty_size);
            offset = self.alloc_unclustered(cache, search_start);
        }
        let Some(offset) = offset else {
            return Ok(None);
        };

        if offset + self.num_bytes > cache.end() {
            cache.free_space_ctl().add_free_space(offset, self.num_bytes)?;
            return Err(BtrfsError::Corrupt(format!(
                "allocation {}+{} crosses group {} end",
                offset, self.num_bytes, cache.start
            )));
        }

        match block_group::update_reserved_bytes(cache, self.num_bytes, self.reserve) {
            Ok(()) => Ok(Some(offset)),
            Err(BtrfsError::Again) => {
                // went read-only under us
                cache.free_space_ctl().add_free_space(offset, self.num_bytes)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// One pass over every group of the class
    fn scan(&self, phase: LoopPhase, hint: u64) -> Result<Option<u64>> {
        let profile = chunk::get_alloc_profile(self.fs, self.type_flags);
        let Some(sinfo) = self.fs.find_space_info(self.type_flags) else {
            return Ok(None);
        };

        if let Some(ideal) = self.fs.lookup_block_group(hint) {
            if ideal.cached() != CacheState::NotStarted {
                if let Some(offset) = self.try_group(&ideal, phase, hint)? {
                    return Ok(Some(offset));
                }
            }
        }

        for index in chunk::raid_index(profile)..NR_RAID_TYPES {
            // the hint only steers the ideal group
            for cache in sinfo.groups_in(index) {
                if let Some(offset) = self.try_group(&cache, phase, cache.start)? {
                    return Ok(Some(offset));
                }
            }
        }
        Ok(None)
    }
}

/// Finds and reserves `num_bytes` in a group of class `type_flags`
///
/// `empty_size` asks for that much free slack after the allocation;
/// `hint_byte` is where the search starts. The returned key carries the
/// start in `objectid` and the length in `offset`. Bytes are moved into the
/// group's and space info's reserved counters; metadata allocations consume
/// the caller's `bytes_may_use` charge.
pub fn find_free_extent(
    fs: &FsContext,
    num_bytes: u64,
    empty_size: u64,
    hint_byte: u64,
    type_flags: u64,
) -> Result<BtrfsKey> {
    let config = fs.config();
    if num_bytes < config.sector_size as u64 {
        return Err(BtrfsError::InvalidConfig(format!(
            "allocation of {} bytes is below the sector size",
            num_bytes
        )));
    }
    if fs.find_space_info(type_flags).is_none() {
        warn!(type_flags, "no space info for allocation class");
        return Err(BtrfsError::NoSpace);
    }

    let is_data = type_flags & chunk_type::DATA != 0;
    let cluster = if type_flags & chunk_type::METADATA != 0 {
        Some(&fs.meta_cluster)
    } else if is_data && config.ssd {
        Some(&fs.data_cluster)
    } else {
        None
    };
    let mut search = Search {
        fs,
        type_flags,
        num_bytes,
        empty_size,
        empty_cluster: if cluster.is_some() && !is_data && !config.ssd {
            EMPTY_CLUSTER
        } else {
            0
        },
        align: config.stripe_size as u64,
        cluster,
        reserve: if is_data {
            ReserveType::AllocNoAccount
        } else {
            ReserveType::Alloc
        },
    };

    let mut hint = hint_byte.max(fs.first_logical_byte());
    if let Some(cl) = cluster {
        let cl = cl.lock();
        if cl.block_group().is_some() {
            hint = cl.window_start();
        }
    }

    for phase in PHASES {
        match phase {
            LoopPhase::AllocChunk => {
                match chunk::do_chunk_alloc(fs, num_bytes + CHUNK_SLACK, type_flags, ChunkAllocForce::Force) {
                    Ok(_) | Err(BtrfsError::NoSpace) => {}
                    Err(e) => return Err(e),
                }
            }
            LoopPhase::NoEmptySize => {
                if search.empty_size == 0 && search.empty_cluster == 0 {
                    break;
                }
                search.empty_size = 0;
                search.empty_cluster = 0;
            }
            LoopPhase::CachingNoWait | LoopPhase::CachingWait => {}
        }

        if let Some(start) = search.scan(phase, hint)? {
            trace!(start, num_bytes, ?phase, "found free extent");
            return Ok(BtrfsKey::new(start, item_type::EXTENT_ITEM, num_bytes));
        }
        debug!(num_bytes, ?phase, "free extent search pass failed");
    }
    Err(BtrfsError::NoSpace)
}

/// Reserves an extent, halving the request down to `min_alloc_size` while
/// space is short
pub fn reserve_extent(
    fs: &FsContext,
    num_bytes: u64,
    min_alloc_size: u64,
    empty_size: u64,
    hint_byte: u64,
    is_data: bool,
) -> Result<BtrfsKey> {
    let type_flags = if is_data {
        chunk_type::DATA
    } else {
        chunk_type::METADATA
    };
    let sector_mask = !(fs.config().sector_size as u64 - 1);
    let mut num_bytes = num_bytes;

    loop {
        match find_free_extent(fs, num_bytes, empty_size, hint_byte, type_flags) {
            Err(BtrfsError::NoSpace) if num_bytes > min_alloc_size => {
                num_bytes = ((num_bytes >> 1) & sector_mask).max(min_alloc_size);
                match chunk::do_chunk_alloc(fs, num_bytes, type_flags, ChunkAllocForce::Force) {
                    Ok(_) | Err(BtrfsError::NoSpace) => {}
                    Err(e) => return Err(e),
                }
            }
            Err(BtrfsError::NoSpace) => {
                if fs.config().enospc_debug {
                    if let Some(sinfo) = fs.find_space_info(type_flags) {
                        dump_space_info(fs, &sinfo, num_bytes, true);
                    }
                }
                return Err(BtrfsError::NoSpace);
            }
            other => return other,
        }
    }
}

/// Returns a reserved extent that was never used
pub fn free_reserved_extent(fs: &FsContext, start: u64, len: u64) -> Result<()> {
    let cache = fs.lookup_block_group(start).ok_or_else(|| {
        BtrfsError::Corrupt(format!("no block group for reserved extent {}", start))
    })?;
    if fs.config().discard {
        if let Err(e) = pinned::discard_extent(fs, start, len) {
            warn!(start, len, error = %e, "discard failed");
        }
    }
    cache.free_space_ctl().add_free_space(start, len)?;
    block_group::update_reserved_bytes(&cache, len, ReserveType::Free)
}

/// Hands every cluster window (or only those in the group at `group`) back
/// to its block group
pub fn release_clusters(fs: &FsContext, group: Option<u64>) -> Result<()> {
    for cluster in [&fs.meta_cluster, &fs.data_cluster] {
        let mut cl = cluster.lock();
        let Some(owner) = cl.block_group() else {
            continue;
        };
        if group.is_some_and(|g| g != owner) {
            continue;
        }
        match fs.lookup_block_group(owner) {
            Some(cache) => cl.return_to(&mut cache.free_space_ctl())?,
            None => {
                cl.reset();
            }
        }
    }
    Ok(())
}

/// A tree block as the extent code sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeBlock {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub level: u8,
    /// Transaction that allocated the block
    pub generation: u64,
    /// The block has been written out
    pub written: bool,
}

fn block_rsv_for_root<'a>(fs: &'a FsContext, root_objectid: u64) -> &'a Arc<BlockRsv> {
    match root_objectid {
        objectid::CHUNK_TREE => &fs.chunk_rsv,
        objectid::ROOT_TREE | objectid::EXTENT_TREE | objectid::CSUM_TREE => &fs.global_rsv,
        _ => &fs.trans_rsv,
    }
}

/// Allocates a tree block for `root_objectid` and queues its first ref
///
/// A nonzero `parent` records a shared backref instead of a root backref.
pub fn alloc_tree_block(
    trans: &TransHandle<'_>,
    parent: u64,
    root_objectid: u64,
    key: &BtrfsKey,
    level: u8,
    hint: u64,
    empty_size: u64,
) -> Result<TreeBlock> {
    trans.check_aborted()?;
    let fs = trans.fs();
    let blocksize = fs.config().node_size as u64;

    let rsv = use_block_rsv(fs, block_rsv_for_root(fs, root_objectid), blocksize)?;
    let ins = match reserve_extent(fs, blocksize, blocksize, empty_size, hint, false) {
        Ok(ins) => ins,
        Err(e) => {
            unuse_block_rsv(&rsv, blocksize);
            return Err(e);
        }
    };

    if root_objectid != objectid::TREE_LOG {
        let flags = if parent > 0 {
            extent_flags::FULL_BACKREF
        } else {
            0
        };
        let extent_op = ExtentOp {
            flags_to_set: flags,
            key: Some(*key),
        };
        fs.delayed_refs.add_tree_ref(
            trans.ref_updates(),
            ins.objectid,
            ins.offset,
            parent,
            root_objectid,
            level,
            RefAction::AddExtent,
            Some(extent_op),
            false,
        )?;
    }

    Ok(TreeBlock {
        bytenr: ins.objectid,
        num_bytes: ins.offset,
        level,
        generation: trans.transid(),
        written: false,
    })
}

/// Drops a root's reference to a tree block
///
/// With `last_ref`, a block allocated in this same transaction whose refs
/// all cancelled goes straight back to the allocator, or is pinned if it
/// already reached disk.
pub fn free_tree_block(
    trans: &TransHandle<'_>,
    root_objectid: u64,
    block: &TreeBlock,
    parent: u64,
    last_ref: bool,
) -> Result<()> {
    trans.check_aborted()?;
    let fs = trans.fs();
    if root_objectid != objectid::TREE_LOG {
        fs.delayed_refs.add_tree_ref(
            trans.ref_updates(),
            block.bytenr,
            block.num_bytes,
            parent,
            root_objectid,
            block.level,
            RefAction::Drop,
            None,
            false,
        )?;
    }
    if !last_ref || block.generation != trans.transid() {
        return Ok(());
    }
    if root_objectid != objectid::TREE_LOG && !fs.delayed_refs.check_ref_cleanup(block.bytenr) {
        return Ok(());
    }

    let cache = fs.lookup_block_group(block.bytenr).ok_or_else(|| {
        BtrfsError::Corrupt(format!("no block group for tree block {}", block.bytenr))
    })?;
    if block.written {
        pinned::pin_down_extent(fs, &cache, block.bytenr, block.num_bytes, true);
        return Ok(());
    }
    cache.free_space_ctl().add_free_space(block.bytenr, block.num_bytes)?;
    block_group::update_reserved_bytes(&cache, block.num_bytes, ReserveType::Free)?;
    debug!(bytenr = block.bytenr, "tree block returned unused");
    Ok(())
}

/// Queues the first reference of a reserved data extent
///
/// `ins` is the key returned by [`reserve_extent`].
pub fn alloc_reserved_file_extent(
    trans: &TransHandle<'_>,
    root_objectid: u64,
    owner: u64,
    offset: u64,
    ins: &BtrfsKey,
) -> Result<()> {
    trans.check_aborted()?;
    trans.fs().delayed_refs.add_data_ref(
        trans.ref_updates(),
        ins.objectid,
        ins.offset,
        0,
        root_objectid,
        owner,
        offset,
        RefAction::AddExtent,
        None,
        false,
    )
}

#[allow(clippy::too_many_arguments)]
fn queue_ref(
    trans: &TransHandle<'_>,
    extent: (u64, u64),
    parent: u64,
    root_objectid: u64,
    owner: u64,
    offset: u64,
    action: RefAction,
    for_cow: bool,
) -> Result<()> {
    trans.check_aborted()?;
    let (bytenr, num_bytes) = extent;
    let refs = &trans.fs().delayed_refs;
    if owner < objectid::FIRST_FREE {
        let level = u8::try_from(owner)
            .map_err(|_| BtrfsError::Corrupt(format!("tree block level {} out of range", owner)))?;
        refs.add_tree_ref(
            trans.ref_updates(),
            bytenr,
            num_bytes,
            parent,
            root_objectid,
            level,
            action,
            None,
            for_cow,
        )
    } else {
        refs.add_data_ref(
            trans.ref_updates(),
            bytenr,
            num_bytes,
            parent,
            root_objectid,
            owner,
            offset,
            action,
            None,
            for_cow,
        )
    }
}

/// Adds a reference to an extent
///
/// `owner` below the first free objectid is a tree level; otherwise it is
/// the inode and `offset` its file offset.
#[allow(clippy::too_many_arguments)]
pub fn inc_extent_ref(
    trans: &TransHandle<'_>,
    bytenr: u64,
    num_bytes: u64,
    parent: u64,
    root_objectid: u64,
    owner: u64,
    offset: u64,
    for_cow: bool,
) -> Result<()> {
    if root_objectid == objectid::TREE_LOG {
        return Err(BtrfsError::Corrupt("log tree extents carry no refs".to_string()));
    }
    queue_ref(
        trans,
        (bytenr, num_bytes),
        parent,
        root_objectid,
        owner,
        offset,
        RefAction::Add,
        for_cow,
    )
}

/// Drops a reference to an extent
///
/// Log tree extents never enter the extent tree; they are only pinned.
#[allow(clippy::too_many_arguments)]
pub fn free_extent(
    trans: &TransHandle<'_>,
    bytenr: u64,
    num_bytes: u64,
    parent: u64,
    root_objectid: u64,
    owner: u64,
    offset: u64,
    for_cow: bool,
) -> Result<()> {
    if root_objectid == objectid::TREE_LOG {
        return pinned::pin_extent(trans.fs(), bytenr, num_bytes, true);
    }
    queue_ref(
        trans,
        (bytenr, num_bytes),
        parent,
        root_objectid,
        owner,
        offset,
        RefAction::Drop,
        for_cow,
    )
}

/// Queues flags to set on an extent item
pub fn set_disk_extent_flags(
    trans: &TransHandle<'_>,
    bytenr: u64,
    num_bytes: u64,
    flags: u64,
    is_data: bool,
) -> Result<()> {
    trans.check_aborted()?;
    trans
        .fs()
        .delayed_refs
        .add_extent_op(trans.ref_updates(), bytenr, num_bytes, ExtentOp::flags(flags), is_data);
    Ok(())
}
