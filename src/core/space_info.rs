//! Space accounting per allocation class
//!
//! A [`SpaceInfo`] aggregates every block group of one type (data, metadata,
//! system, or mixed) and tracks how its bytes are spent. Reservations are
//! charged to `bytes_may_use` before any extent is chosen, so the counters
//! have to stay consistent under concurrent reservers, allocators and the
//! commit path.

use super::{
    block_group::BlockGroupCache,
    chunk::{self, chunk_type, ChunkAllocForce, NR_RAID_TYPES},
    free_space::align_up,
    transaction, BtrfsError, FsContext, Result,
};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters of a [`SpaceInfo`], guarded by its lock
#[derive(Debug, Clone, Default)]
pub struct SpaceCounters {
    /// Logical bytes in all block groups of this type
    pub total_bytes: u64,
    /// Raw device bytes behind `total_bytes`
    pub disk_total: u64,
    /// Bytes holding committed extents
    pub bytes_used: u64,
    /// Raw device bytes behind `bytes_used`
    pub disk_used: u64,
    /// Bytes freed in the running transaction, reusable after commit
    pub bytes_pinned: u64,
    /// Bytes handed to allocations whose extent items are not yet inserted
    pub bytes_reserved: u64,
    /// Bytes in read-only groups plus superblock stripes
    pub bytes_readonly: u64,
    /// Bytes promised to reservations not yet allocated
    pub bytes_may_use: u64,
    /// Chunk allocation failed for lack of device space
    pub full: bool,
    /// A chunk allocation is in flight
    pub chunk_alloc: bool,
    /// Urgency recorded for the next chunk allocation
    pub force_alloc: ChunkAllocForce,
    /// A reserver is flushing on behalf of this space info
    pub flush: bool,
}

impl SpaceCounters {
    /// Bytes spoken for, optionally including outstanding reservations
    pub fn used_bytes(&self, may_use_included: bool) -> u64 {
        let used = self.bytes_used + self.bytes_reserved + self.bytes_pinned + self.bytes_readonly;
        if may_use_included {
            used + self.bytes_may_use
        } else {
            used
        }
    }
}

/// Point-in-time copy of a space info, for reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceInfoSnapshot {
    pub flags: u64,
    pub total_bytes: u64,
    pub disk_total: u64,
    pub bytes_used: u64,
    pub disk_used: u64,
    pub bytes_pinned: u64,
    pub bytes_reserved: u64,
    pub bytes_readonly: u64,
    pub bytes_may_use: u64,
    pub full: bool,
    pub block_groups: usize,
}

/// Space accounting for one allocation class
pub struct SpaceInfo {
    /// Type bits (and profile bits seen so far)
    flags: Mutex<u64>,
    counters: Mutex<SpaceCounters>,
    flush_wait: Condvar,
    chunk_wait: Condvar,
    /// Block groups bucketed by RAID profile
    block_groups: RwLock<[Vec<Arc<BlockGroupCache>>; NR_RAID_TYPES]>,
}

impl SpaceInfo {
    /// Creates an empty space info for the given type bits
    pub fn new(flags: u64) -> Self {
        Self {
            flags: Mutex::new(flags & chunk_type::TYPE_MASK),
            counters: Mutex::new(SpaceCounters::default()),
            flush_wait: Condvar::new(),
            chunk_wait: Condvar::new(),
            block_groups: RwLock::new(Default::default()),
        }
    }

    /// Type bits this space info serves
    pub fn flags(&self) -> u64 {
        *self.flags.lock()
    }

    /// True if this space info accounts `flags`' type
    pub fn matches(&self, flags: u64) -> bool {
        (self.flags() & chunk_type::TYPE_MASK) == (flags & chunk_type::TYPE_MASK)
    }

    /// Locks the counters
    pub fn lock(&self) -> MutexGuard<'_, SpaceCounters> {
        self.counters.lock()
    }

    pub(crate) fn wait_chunk_alloc(&self, guard: &mut MutexGuard<'_, SpaceCounters>) {
        self.chunk_wait.wait(guard);
    }

    pub(crate) fn notify_chunk_waiters(&self) {
        self.chunk_wait.notify_all();
    }

    /// Adds a block group's size and usage to the totals
    pub(crate) fn add_block_group(&self, cache: Arc<BlockGroupCache>, used: u64) {
        let factor = chunk::profile_factor(cache.flags);
        {
            let mut c = self.counters.lock();
            c.total_bytes += cache.length;
            c.disk_total += cache.length * factor;
            c.bytes_used += used;
            c.disk_used += used * factor;
            c.bytes_readonly += cache.bytes_super();
            c.full = false;
        }
        *self.flags.lock() |= cache.flags & chunk_type::PROFILE_MASK;
        self.block_groups.write()[chunk::raid_index(cache.flags)].push(cache);
    }

    /// Block groups of one RAID bucket, in insertion order
    pub fn groups_in(&self, index: usize) -> Vec<Arc<BlockGroupCache>> {
        self.block_groups
            .read()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// All block groups of this space info
    pub fn all_groups(&self) -> Vec<Arc<BlockGroupCache>> {
        self.block_groups.read().iter().flatten().cloned().collect()
    }

    /// Drops the block group references, breaking the group/space-info cycle
    pub(crate) fn clear_groups(&self) {
        for bucket in self.block_groups.write().iter_mut() {
            bucket.clear();
        }
    }

    /// Returns `bytes` of outstanding reservation
    pub fn release_may_use(&self, bytes: u64) {
        let mut c = self.counters.lock();
        c.bytes_may_use = c.bytes_may_use.saturating_sub(bytes);
    }

    /// Copies the counters
    pub fn snapshot(&self) -> SpaceInfoSnapshot {
        let c = self.counters.lock().clone();
        SpaceInfoSnapshot {
            flags: self.flags(),
            total_bytes: c.total_bytes,
            disk_total: c.disk_total,
            bytes_used: c.bytes_used,
            disk_used: c.disk_used,
            bytes_pinned: c.bytes_pinned,
            bytes_reserved: c.bytes_reserved,
            bytes_readonly: c.bytes_readonly,
            bytes_may_use: c.bytes_may_use,
            full: c.full,
            block_groups: self.block_groups.read().iter().map(Vec::len).sum(),
        }
    }
}

/// How hard a reserver may work to find space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Fail immediately
    NoFlush,
    /// Flush delalloc but never commit
    FlushLimit,
    /// Flush delalloc and commit the transaction
    FlushAll,
}

/// Clears the flush flag when the flushing reserver is done
struct FlushGuard<'a> {
    space_info: &'a SpaceInfo,
    armed: bool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.space_info.lock().flush = false;
            self.space_info.flush_wait.notify_all();
        }
    }
}

/// Whether metadata may be promised beyond its current chunks
fn can_overcommit(
    fs: &FsContext,
    space_info: &SpaceInfo,
    counters: &SpaceCounters,
    bytes: u64,
    flush: FlushMode,
) -> bool {
    if space_info.flags() & chunk_type::DATA != 0 {
        return false;
    }
    let policy = &fs.config().policy;
    let mut avail = fs.chunks.lock().unallocated_bytes();
    let profile = chunk::get_alloc_profile(fs, chunk_type::METADATA);
    if chunk::profile_factor(profile) > 1 {
        avail >>= 1;
    }
    avail >>= if flush == FlushMode::FlushAll {
        policy.overcommit_shift_flush
    } else {
        policy.overcommit_shift_no_flush
    };
    counters.used_bytes(true) + bytes < counters.total_bytes + avail
}

/// Asks the embedder to write back dirty data so its reservations come back
fn shrink_delalloc(fs: &FsContext, space_info: &SpaceInfo, to_reclaim: u64) -> Result<()> {
    let before = space_info.lock().bytes_may_use;
    fs.hooks().flush_delalloc(fs, to_reclaim)?;
    let after = space_info.lock().bytes_may_use;
    debug!(to_reclaim, reclaimed = before.saturating_sub(after), "shrink delalloc");
    Ok(())
}

/// Commits the running transaction when that frees enough pinned space
fn may_commit_transaction(fs: &FsContext, space_info: &SpaceInfo, bytes: u64) -> Result<()> {
    if transaction::in_transaction() {
        return Err(BtrfsError::Again);
    }
    let pinned = space_info.lock().bytes_pinned;
    if pinned < bytes {
        return Err(BtrfsError::NoSpace);
    }
    debug!(pinned, bytes, "committing to reclaim pinned space");
    let trans = transaction::join_transaction(fs)?;
    trans.commit()
}

/// Reserves `orig_bytes` against a metadata space info
///
/// Succeeds once `bytes_may_use` has been charged. With a flush mode other
/// than [`FlushMode::NoFlush`] the reserver may flush delalloc and commit to
/// make room; only one reserver flushes at a time and the rest wait.
pub fn reserve_metadata_bytes(
    fs: &FsContext,
    space_info: &SpaceInfo,
    orig_bytes: u64,
    flush: FlushMode,
) -> Result<()> {
    let retries_max = fs.config().policy.flush_retries;
    let mut guard = FlushGuard {
        space_info,
        armed: false,
    };
    let mut retries = 0u32;

    loop {
        let mut counters = space_info.lock();
        if flush != FlushMode::NoFlush && !guard.armed {
            while counters.flush {
                space_info.flush_wait.wait(&mut counters);
            }
        }

        let used = counters.used_bytes(true);
        if used + orig_bytes <= counters.total_bytes
            || can_overcommit(fs, space_info, &counters, orig_bytes, flush)
        {
            counters.bytes_may_use += orig_bytes;
            return Ok(());
        }

        if flush == FlushMode::NoFlush || retries >= retries_max {
            drop(counters);
            if fs.config().enospc_debug {
                dump_space_info(fs, space_info, orig_bytes, false);
            }
            return Err(BtrfsError::NoSpace);
        }

        if !guard.armed {
            counters.flush = true;
            guard.armed = true;
        }
        let shortfall = (used + orig_bytes).saturating_sub(counters.total_bytes);
        drop(counters);
        retries += 1;

        shrink_delalloc(fs, space_info, shortfall)?;

        if flush != FlushMode::FlushAll {
            continue;
        }
        let still_short = {
            let c = space_info.lock();
            c.used_bytes(true) + orig_bytes > c.total_bytes
        };
        if still_short {
            match may_commit_transaction(fs, space_info, shortfall) {
                Ok(()) | Err(BtrfsError::Again) | Err(BtrfsError::NoSpace) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Charges a data write of `bytes` against the data space info
///
/// Allocates a data chunk or commits to unpin space before giving up.
pub fn check_data_free_space(fs: &FsContext, bytes: u64) -> Result<()> {
    fs.check_writable()?;
    let bytes = align_up(bytes, fs.config().sector_size as u64);
    let data_flags = chunk::get_alloc_profile(fs, chunk_type::DATA);
    let space_info = fs.get_or_create_space_info(data_flags);
    let mut committed = false;

    loop {
        let mut counters = space_info.lock();
        let used = counters.used_bytes(true);
        if used + bytes <= counters.total_bytes {
            counters.bytes_may_use += bytes;
            return Ok(());
        }

        if !counters.full {
            drop(counters);
            let alloc_target = bytes + 2 * 1024 * 1024;
            match chunk::do_chunk_alloc(fs, alloc_target, data_flags, ChunkAllocForce::NoForce) {
                Ok(true) => continue,
                Ok(false) | Err(BtrfsError::NoSpace) => {}
                Err(e) => return Err(e),
            }
            // heuristics declined; insist once the reservation cannot fit
            match chunk::do_chunk_alloc(fs, alloc_target, data_flags, ChunkAllocForce::Force) {
                Ok(true) => continue,
                Ok(false) | Err(BtrfsError::NoSpace) => {}
                Err(e) => return Err(e),
            }
        } else {
            drop(counters);
        }

        let pinned = space_info.lock().bytes_pinned;
        if !committed && pinned >= bytes && !transaction::in_transaction() {
            committed = true;
            let trans = transaction::join_transaction(fs)?;
            trans.commit()?;
            continue;
        }

        if fs.config().enospc_debug {
            dump_space_info(fs, &space_info, bytes, false);
        }
        return Err(BtrfsError::NoSpace);
    }
}

/// Returns a data reservation that was never used
pub fn free_reserved_data_space(fs: &FsContext, bytes: u64) {
    let bytes = align_up(bytes, fs.config().sector_size as u64);
    if let Some(space_info) = fs.find_space_info(chunk_type::DATA) {
        space_info.release_may_use(bytes);
    }
}

/// Logs the counters of a space info, and optionally of each block group
pub fn dump_space_info(fs: &FsContext, space_info: &SpaceInfo, bytes: u64, dump_block_groups: bool) {
    let snap = space_info.snapshot();
    let free = snap
        .total_bytes
        .saturating_sub(snap.bytes_used + snap.bytes_reserved + snap.bytes_pinned + snap.bytes_readonly + snap.bytes_may_use);
    info!(
        flags = format_args!("{:#x}", snap.flags),
        bytes,
        free,
        full = snap.full,
        "space info"
    );
    info!(
        total = snap.total_bytes,
        used = snap.bytes_used,
        pinned = snap.bytes_pinned,
        reserved = snap.bytes_reserved,
        may_use = snap.bytes_may_use,
        readonly = snap.bytes_readonly,
        "space info counters"
    );
    if !dump_block_groups {
        return;
    }
    for cache in space_info.all_groups() {
        let s = cache.snapshot();
        info!(
            start = cache.start,
            length = cache.length,
            used = s.used,
            pinned = s.pinned,
            reserved = s.reserved,
            free = cache.free_space(),
            ro = s.ro,
            "block group"
        );
    }
    if fs.is_errored() {
        warn!("filesystem is in an error state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_bytes() {
        let c = SpaceCounters {
            bytes_used: 10,
            bytes_reserved: 20,
            bytes_pinned: 30,
            bytes_readonly: 40,
            bytes_may_use: 50,
            ..Default::default()
        };
        assert_eq!(c.used_bytes(false), 100);
        assert_eq!(c.used_bytes(true), 150);
    }

    #[test]
    fn test_matches_type_bits_only() {
        let sinfo = SpaceInfo::new(chunk_type::METADATA | chunk_type::DUP);
        assert!(sinfo.matches(chunk_type::METADATA));
        assert!(sinfo.matches(chunk_type::METADATA | chunk_type::RAID1));
        assert!(!sinfo.matches(chunk_type::DATA));
        assert!(!sinfo.matches(chunk_type::DATA | chunk_type::METADATA));
    }

    #[test]
    fn test_release_may_use_saturates() {
        let sinfo = SpaceInfo::new(chunk_type::DATA);
        sinfo.lock().bytes_may_use = 4096;
        sinfo.release_may_use(8192);
        assert_eq!(sinfo.lock().bytes_may_use, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let sinfo = SpaceInfo::new(chunk_type::DATA);
        sinfo.lock().total_bytes = 1 << 30;
        let json = serde_json::to_string(&sinfo.snapshot()).unwrap();
        assert!(json.contains("\"total_bytes\":1073741824"));
    }
}
