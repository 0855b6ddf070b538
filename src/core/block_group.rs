//! Block groups
//!
//! A block group is the logical view of one chunk: its usage counters, its
//! free-space index and the state of the background scan that builds that
//! index. Counter updates always take the owning space info's lock first and
//! the group's lock second.

use super::{
    chunk::{self, chunk_type},
    extent::{BlockGroupItem, BLOCK_GROUP_ITEM_SIZE},
    free_space::{FreeSpaceCtl, RangeTree},
    item_type, objectid,
    pinned::PinnedExtents,
    space_cache,
    space_info::SpaceInfo,
    tree::{BtrfsKey, KeyValueTree},
    BtrfsError, FsContext, Result, SUPERBLOCK_MIRROR1_OFFSET, SUPERBLOCK_MIRROR2_OFFSET,
    SUPERBLOCK_OFFSET, SUPER_INFO_SIZE,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress of a group's free-space index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    /// Nothing indexed yet
    NotStarted,
    /// Loading the persisted cache
    Fast,
    /// The extent scan is running; space below `progress` is indexed
    Started,
    /// Fully indexed
    Finished,
    /// The scan failed; the group is skipped by the allocator
    Error,
}

/// State of the group's persisted cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskCacheState {
    /// Stale or absent
    Clear,
    /// Matches memory as of the last commit
    Written,
    /// Failed validation on load
    Error,
}

/// Mutable counters of a block group
#[derive(Debug, Clone)]
pub struct BlockGroupState {
    pub used: u64,
    pub pinned: u64,
    pub reserved: u64,
    pub ro: bool,
    pub cached: CacheState,
    /// Scan position while `cached == Started`
    pub progress: u64,
    /// Unpins at or beyond this address are left to the scan
    pub last_byte_to_unpin: u64,
    /// The block group item needs rewriting
    pub dirty: bool,
    pub disk_cache: DiskCacheState,
}

/// Point-in-time copy of a block group, for reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockGroupSnapshot {
    pub start: u64,
    pub length: u64,
    pub flags: u64,
    pub used: u64,
    pub pinned: u64,
    pub reserved: u64,
    pub bytes_super: u64,
    pub free: u64,
    pub ro: bool,
    pub cached: CacheState,
}

/// In-memory block group
pub struct BlockGroupCache {
    pub start: u64,
    pub length: u64,
    pub flags: u64,
    bytes_super: u64,
    space_info: Arc<SpaceInfo>,
    state: Mutex<BlockGroupState>,
    caching_wait: Condvar,
    free_space: Mutex<FreeSpaceCtl>,
}

impl BlockGroupCache {
    pub fn new(start: u64, length: u64, flags: u64, space_info: Arc<SpaceInfo>, bytes_super: u64) -> Self {
        Self {
            start,
            length,
            flags,
            bytes_super,
            space_info,
            state: Mutex::new(BlockGroupState {
                used: 0,
                pinned: 0,
                reserved: 0,
                ro: false,
                cached: CacheState::NotStarted,
                progress: start,
                last_byte_to_unpin: 0,
                dirty: false,
                disk_cache: DiskCacheState::Clear,
            }),
            caching_wait: Condvar::new(),
            free_space: Mutex::new(FreeSpaceCtl::new()),
        }
    }

    /// First byte past the group
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Bytes lost to superblock copies
    pub fn bytes_super(&self) -> u64 {
        self.bytes_super
    }

    pub fn space_info(&self) -> Arc<SpaceInfo> {
        self.space_info.clone()
    }

    pub fn lock_state(&self) -> MutexGuard<'_, BlockGroupState> {
        self.state.lock()
    }

    pub fn free_space_ctl(&self) -> MutexGuard<'_, FreeSpaceCtl> {
        self.free_space.lock()
    }

    /// Bytes in the free-space index
    pub fn free_space(&self) -> u64 {
        self.free_space.lock().free_space()
    }

    pub fn cached(&self) -> CacheState {
        self.state.lock().cached
    }

    pub fn is_ro(&self) -> bool {
        self.state.lock().ro
    }

    pub fn snapshot(&self) -> BlockGroupSnapshot {
        let s = self.state.lock().clone();
        BlockGroupSnapshot {
            start: self.start,
            length: self.length,
            flags: self.flags,
            used: s.used,
            pinned: s.pinned,
            reserved: s.reserved,
            bytes_super: self.bytes_super,
            free: self.free_space(),
            ro: s.ro,
            cached: s.cached,
        }
    }

    fn set_cached(&self, cached: CacheState) {
        let mut state = self.state.lock();
        state.cached = cached;
        if cached == CacheState::Finished {
            state.progress = self.end();
        }
        drop(state);
        self.caching_wait.notify_all();
    }
}

/// Bytes freed and unused in a group that would move to read-only
fn ro_candidate_bytes(cache: &BlockGroupCache, state: &BlockGroupState) -> u64 {
    cache
        .length
        .saturating_sub(state.reserved + state.pinned + cache.bytes_super + state.used)
}

/// Excludes superblock copies that fall inside a new group
///
/// Returns the number of bytes excluded.
pub fn exclude_super_stripes(fs: &FsContext, start: u64, length: u64) -> u64 {
    let end = start + length;
    let mut excluded = RangeTree::new();

    if start < SUPERBLOCK_OFFSET {
        excluded.insert(start, (SUPERBLOCK_OFFSET - start).min(length));
    }

    let chunks = fs.chunks.lock();
    for mirror in [SUPERBLOCK_OFFSET, SUPERBLOCK_MIRROR1_OFFSET, SUPERBLOCK_MIRROR2_OFFSET] {
        for logical in chunks.physical_to_logical(start, mirror) {
            let s = logical.max(start);
            let e = (logical + SUPER_INFO_SIZE).min(end);
            if s < e {
                excluded.insert(s, e - s);
            }
        }
    }
    drop(chunks);

    for (s, e) in excluded.iter() {
        fs.pinned.exclude(s, e - s);
    }
    excluded.total()
}

/// Indexes `[start, end)` as free, skipping excluded and pinned ranges
pub fn add_new_free_space(
    pinned: &PinnedExtents,
    cache: &BlockGroupCache,
    start: u64,
    end: u64,
) -> Result<u64> {
    let busy = pinned.busy_within(start, end);
    let mut ctl = cache.free_space_ctl();
    let mut added = 0;
    let mut cursor = start;
    for (s, e) in busy.iter() {
        if s > cursor {
            ctl.add_free_space(cursor, s - cursor)?;
            added += s - cursor;
        }
        cursor = cursor.max(e);
    }
    if cursor < end {
        ctl.add_free_space(cursor, end - cursor)?;
        added += end - cursor;
    }
    Ok(added)
}

fn key_successor(key: &BtrfsKey) -> BtrfsKey {
    if key.offset < u64::MAX {
        BtrfsKey::new(key.objectid, key.item_type, key.offset + 1)
    } else if key.item_type < u8::MAX {
        BtrfsKey::new(key.objectid, key.item_type + 1, 0)
    } else {
        BtrfsKey::new(key.objectid.saturating_add(1), 0, 0)
    }
}

/// Builds a group's free-space index from the extent items in its range
fn caching_thread(
    store: &dyn KeyValueTree,
    pinned: &PinnedExtents,
    cache: &BlockGroupCache,
    node_size: u64,
    batch: usize,
) -> Result<u64> {
    let end = cache.end();
    let mut last = cache.start.max(SUPERBLOCK_OFFSET);
    let mut cursor = BtrfsKey::new(last, 0, 0);
    let mut found = 0;

    'scan: loop {
        for _ in 0..batch {
            let Some((key, _)) = store.next_item(&cursor)? else {
                break 'scan;
            };
            if key.objectid >= end {
                break 'scan;
            }
            cursor = key_successor(&key);

            let extent_len = match key.item_type {
                item_type::EXTENT_ITEM => key.offset,
                item_type::METADATA_ITEM => node_size,
                _ => continue,
            };
            if key.objectid > last {
                found += add_new_free_space(pinned, cache, last, key.objectid)?;
            }
            last = last.max(key.objectid + extent_len);
        }

        cache.lock_state().progress = last;
        cache.caching_wait.notify_all();
    }

    if last < end {
        found += add_new_free_space(pinned, cache, last, end)?;
    }
    cache.set_cached(CacheState::Finished);
    Ok(found)
}

fn run_caching(
    store: Arc<dyn KeyValueTree>,
    pinned: Arc<PinnedExtents>,
    cache: Arc<BlockGroupCache>,
    node_size: u64,
    batch: usize,
) {
    match caching_thread(store.as_ref(), &pinned, &cache, node_size, batch) {
        Ok(found) => debug!(start = cache.start, found, "block group cached"),
        Err(e) => {
            warn!(start = cache.start, error = %e, "block group caching failed");
            cache.set_cached(CacheState::Error);
        }
    }
}

/// Starts indexing a group's free space if nobody has yet
///
/// Tries the persisted cache first. With `load_cache_only` the scan is not
/// started when no usable cache exists.
pub fn cache_block_group(fs: &FsContext, cache: &Arc<BlockGroupCache>, load_cache_only: bool) -> Result<()> {
    let space_cache = fs.config().space_cache;
    {
        let mut state = cache.lock_state();
        if state.cached != CacheState::NotStarted {
            return Ok(());
        }
        if space_cache {
            state.cached = CacheState::Fast;
        } else if load_cache_only {
            return Ok(());
        }
    }

    if space_cache {
        let loaded = space_cache::load_free_space_cache(fs, cache);
        let mut state = cache.lock_state();
        if loaded {
            state.cached = CacheState::Finished;
            state.progress = cache.end();
            state.last_byte_to_unpin = u64::MAX;
            drop(state);
            cache.caching_wait.notify_all();
            return Ok(());
        }
        state.cached = if load_cache_only {
            CacheState::NotStarted
        } else {
            CacheState::Started
        };
        drop(state);
        cache.caching_wait.notify_all();
        if load_cache_only {
            return Ok(());
        }
    } else {
        cache.lock_state().cached = CacheState::Started;
    }

    let config = fs.config();
    let store = fs.extent_root().clone();
    let pinned = fs.pinned.clone();
    let node_size = config.node_size as u64;
    let batch = config.caching_batch_items;

    if config.async_caching {
        let job_cache = cache.clone();
        fs.workers
            .submit(move || run_caching(store, pinned, job_cache, node_size, batch))?;
    } else {
        run_caching(store, pinned, cache.clone(), node_size, batch);
    }
    Ok(())
}

/// Blocks until the scan has indexed `num_bytes` or finished
pub fn wait_block_group_cache_progress(cache: &BlockGroupCache, num_bytes: u64) {
    let mut state = cache.lock_state();
    while matches!(state.cached, CacheState::Started | CacheState::Fast)
        && cache.free_space() < num_bytes
    {
        cache.caching_wait.wait(&mut state);
    }
}

/// Blocks until the scan completes
pub fn wait_block_group_cache_done(cache: &BlockGroupCache) -> Result<()> {
    let mut state = cache.lock_state();
    while matches!(state.cached, CacheState::Started | CacheState::Fast) {
        cache.caching_wait.wait(&mut state);
    }
    if state.cached == CacheState::Error {
        return Err(BtrfsError::Corrupt(format!(
            "block group {} could not be cached",
            cache.start
        )));
    }
    Ok(())
}

fn register_block_group(fs: &FsContext, cache: Arc<BlockGroupCache>, used: u64) -> Result<()> {
    fs.insert_block_group(cache.clone())?;
    cache.space_info().add_block_group(cache.clone(), used);
    fs.set_avail_alloc_bits(cache.flags);
    Ok(())
}

/// Creates the block group for a freshly allocated chunk
pub fn make_block_group(fs: &FsContext, used: u64, flags: u64, start: u64, size: u64) -> Result<()> {
    let space_info = fs.get_or_create_space_info(flags);
    let bytes_super = exclude_super_stripes(fs, start, size);
    let cache = Arc::new(BlockGroupCache::new(start, size, flags, space_info, bytes_super));
    {
        let mut state = cache.lock_state();
        state.used = used;
        state.cached = CacheState::Finished;
        state.progress = cache.end();
        state.last_byte_to_unpin = u64::MAX;
        state.dirty = true;
    }
    add_new_free_space(&fs.pinned, &cache, start, start + size)?;

    let item = BlockGroupItem {
        used,
        chunk_objectid: objectid::FIRST_CHUNK_TREE,
        flags,
    };
    fs.extent_root().insert(
        BtrfsKey::new(start, item_type::BLOCK_GROUP_ITEM, size),
        item.to_bytes(),
    )?;
    register_block_group(fs, cache, used)?;
    debug!(start, size, bytes_super, "created block group");
    Ok(())
}

/// Rebuilds the in-memory block groups from their items
pub fn read_block_groups(fs: &FsContext) -> Result<usize> {
    let store = fs.extent_root().clone();
    let mut cursor = BtrfsKey::new(0, item_type::BLOCK_GROUP_ITEM, 0);
    let mut count = 0;

    while let Some((key, data)) = store.next_item(&cursor)? {
        if key.objectid == objectid::FREE_SPACE_OBJECTID {
            break;
        }
        if key.item_type != item_type::BLOCK_GROUP_ITEM {
            cursor = if key.item_type < item_type::BLOCK_GROUP_ITEM {
                BtrfsKey::new(key.objectid, item_type::BLOCK_GROUP_ITEM, 0)
            } else {
                BtrfsKey::new(key.objectid + 1, item_type::BLOCK_GROUP_ITEM, 0)
            };
            continue;
        }
        if data.len() < BLOCK_GROUP_ITEM_SIZE {
            return Err(BtrfsError::Corrupt(format!("short block group item {}", key.objectid)));
        }
        let item = BlockGroupItem::from_bytes(&data)?;
        let (start, length) = (key.objectid, key.offset);
        let chunk_ok = fs
            .chunks
            .lock()
            .chunks()
            .get(&start)
            .is_some_and(|c| c.size == length);
        if !chunk_ok {
            return Err(BtrfsError::Corrupt(format!(
                "block group {}+{} has no matching chunk",
                start, length
            )));
        }
        if item.used > length {
            return Err(BtrfsError::Corrupt(format!(
                "block group {} uses {} of {} bytes",
                start, item.used, length
            )));
        }

        let space_info = fs.get_or_create_space_info(item.flags);
        let bytes_super = exclude_super_stripes(fs, start, length);
        let cache = Arc::new(BlockGroupCache::new(start, length, item.flags, space_info, bytes_super));
        cache.lock_state().used = item.used;

        if item.used + bytes_super >= length {
            cache.set_cached(CacheState::Finished);
            cache.lock_state().last_byte_to_unpin = u64::MAX;
        } else if item.used == 0 {
            add_new_free_space(&fs.pinned, &cache, start, start + length)?;
            cache.set_cached(CacheState::Finished);
            cache.lock_state().last_byte_to_unpin = u64::MAX;
        }

        register_block_group(fs, cache, item.used)?;
        count += 1;
        cursor = BtrfsKey::new(start + length, item_type::BLOCK_GROUP_ITEM, 0);
    }

    let chunks = fs.chunks.lock().chunks().len();
    if chunks != count {
        return Err(BtrfsError::Corrupt(format!(
            "{} chunks but {} block groups",
            chunks, count
        )));
    }
    info!(count, "read block groups");
    Ok(count)
}

/// Moves bytes between a group's `used` and its reserved or pinned state
///
/// Allocation turns reserved bytes into used ones when the extent item is
/// inserted. Freeing turns used bytes into pinned ones and records the
/// range for unpinning at commit.
pub fn update_block_group(fs: &FsContext, bytenr: u64, num_bytes: u64, alloc: bool) -> Result<()> {
    let mut bytenr = bytenr;
    let mut total = num_bytes;
    let space_cache = fs.config().space_cache;

    while total > 0 {
        let cache = fs.lookup_block_group(bytenr).ok_or_else(|| {
            BtrfsError::Corrupt(format!("no block group for extent {}", bytenr))
        })?;
        let num = total.min(cache.end() - bytenr);

        // a freed range must not be reported free by a scan that starts later
        if !alloc && cache.cached() == CacheState::NotStarted {
            cache_block_group(fs, &cache, true)?;
        }

        let factor = chunk::profile_factor(cache.flags);
        {
            let sinfo = cache.space_info();
            let mut counters = sinfo.lock();
            let mut state = cache.lock_state();
            if space_cache && state.disk_cache == DiskCacheState::Written {
                state.disk_cache = DiskCacheState::Clear;
            }
            state.dirty = true;

            if alloc {
                if state.reserved < num || state.used + num > cache.length {
                    return Err(BtrfsError::Corrupt(format!(
                        "allocating {} bytes at {} without a reservation",
                        num, bytenr
                    )));
                }
                state.used += num;
                state.reserved -= num;
                counters.bytes_reserved = counters.bytes_reserved.saturating_sub(num);
                counters.bytes_used += num;
                counters.disk_used += num * factor;
            } else {
                if state.used < num {
                    return Err(BtrfsError::Corrupt(format!(
                        "freeing {} bytes at {} but group uses {}",
                        num, bytenr, state.used
                    )));
                }
                state.used -= num;
                state.pinned += num;
                counters.bytes_pinned += num;
                counters.bytes_used = counters.bytes_used.saturating_sub(num);
                counters.disk_used = counters.disk_used.saturating_sub(num * factor);
            }
        }

        if !alloc {
            fs.pinned.mark(bytenr, num);
        }
        fs.update_super_bytes_used(num, alloc);
        total -= num;
        bytenr += num;
    }
    Ok(())
}

/// How a reservation change is accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveType {
    /// Return reserved bytes
    Free,
    /// Reserve bytes, consuming the caller's `bytes_may_use` charge
    Alloc,
    /// Reserve bytes the caller never charged
    AllocNoAccount,
}

/// Adjusts a group's reserved bytes
///
/// Allocating from a read-only group fails with [`BtrfsError::Again`].
pub fn update_reserved_bytes(cache: &BlockGroupCache, num_bytes: u64, kind: ReserveType) -> Result<()> {
    let sinfo = cache.space_info();
    let mut counters = sinfo.lock();
    let mut state = cache.lock_state();
    match kind {
        ReserveType::Free => {
            if state.ro {
                counters.bytes_readonly += num_bytes;
            }
            state.reserved = state.reserved.saturating_sub(num_bytes);
            counters.bytes_reserved = counters.bytes_reserved.saturating_sub(num_bytes);
        }
        ReserveType::Alloc | ReserveType::AllocNoAccount => {
            if state.ro {
                return Err(BtrfsError::Again);
            }
            state.reserved += num_bytes;
            counters.bytes_reserved += num_bytes;
            if kind == ReserveType::Alloc {
                counters.bytes_may_use = counters.bytes_may_use.saturating_sub(num_bytes);
            }
        }
    }
    Ok(())
}

fn try_set_ro(cache: &BlockGroupCache, force: bool) -> Result<()> {
    let sinfo = cache.space_info();
    let mut counters = sinfo.lock();
    let mut state = cache.lock_state();
    if state.ro {
        return Ok(());
    }
    let num_bytes = ro_candidate_bytes(cache, &state);
    let min_allocable = if cache.flags & (chunk_type::SYSTEM | chunk_type::METADATA) != 0 {
        1024 * 1024
    } else {
        0
    };
    if force || counters.used_bytes(true) + num_bytes + min_allocable <= counters.total_bytes {
        counters.bytes_readonly += num_bytes;
        state.ro = true;
        return Ok(());
    }
    Err(BtrfsError::NoSpace)
}

/// Stops allocations from a group
///
/// Its free bytes move into the space info's read-only counter. If the rest
/// of the space info could not absorb that, a chunk is forced first.
pub fn set_block_group_ro(fs: &FsContext, cache: &Arc<BlockGroupCache>) -> Result<()> {
    fs.check_writable()?;
    super::alloc::release_clusters(fs, Some(cache.start))?;

    match try_set_ro(cache, false) {
        Err(BtrfsError::NoSpace) => {
            chunk::do_chunk_alloc(fs, 2 * 1024 * 1024, cache.flags, chunk::ChunkAllocForce::Force)?;
            try_set_ro(cache, false)?;
        }
        other => other?,
    }
    info!(start = cache.start, "block group set read-only");
    Ok(())
}

/// Re-enables allocations from a read-only group
pub fn set_block_group_rw(cache: &BlockGroupCache) {
    let sinfo = cache.space_info();
    let mut counters = sinfo.lock();
    let mut state = cache.lock_state();
    if !state.ro {
        return;
    }
    let num_bytes = ro_candidate_bytes(cache, &state);
    counters.bytes_readonly = counters.bytes_readonly.saturating_sub(num_bytes);
    state.ro = false;
}

/// Rewrites the items of groups whose usage changed
pub fn write_dirty_block_groups(fs: &FsContext) -> Result<usize> {
    let mut written = 0;
    for cache in fs.block_groups() {
        let used = {
            let mut state = cache.lock_state();
            if !state.dirty {
                continue;
            }
            state.dirty = false;
            state.used
        };
        let key = BtrfsKey::new(cache.start, item_type::BLOCK_GROUP_ITEM, cache.length);
        let item = BlockGroupItem {
            used,
            chunk_objectid: objectid::FIRST_CHUNK_TREE,
            flags: cache.flags,
        };
        if let Err(e) = fs.extent_root().replace(&key, item.to_bytes()) {
            cache.lock_state().dirty = true;
            return Err(e);
        }
        written += 1;
    }
    Ok(written)
}
