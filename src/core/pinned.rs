//! Pinned extents
//!
//! Space freed inside a transaction stays pinned until the transaction
//! commits, because the committed trees may still point at it. Two range
//! sets alternate: the active one collects new pins while the other is being
//! unpinned by the commit that just finished.

use super::{
    block_group::{BlockGroupCache, CacheState},
    free_space::RangeTree,
    BtrfsError, FsContext, Result,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PinnedState {
    freed: [RangeTree; 2],
    active: usize,
}

/// The pinned-extent double buffer plus permanently excluded ranges
#[derive(Debug, Default)]
pub struct PinnedExtents {
    state: Mutex<PinnedState>,
    /// Superblock stripes and log-replay exclusions; never free space
    excluded: Mutex<RangeTree>,
}

impl PinnedExtents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pinned range in the active set
    pub fn mark(&self, start: u64, len: u64) {
        let mut state = self.state.lock();
        let active = state.active;
        state.freed[active].insert(start, len);
    }

    /// True if any byte of the range is pinned in the active set
    pub fn is_pinned(&self, start: u64, len: u64) -> bool {
        let state = self.state.lock();
        state.freed[state.active].overlaps(start, len)
    }

    /// Bytes pinned in the active set
    pub fn active_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.freed[state.active].total()
    }

    /// Active pins intersecting `[start, end)`
    pub fn active_within(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let state = self.state.lock();
        state.freed[state.active].iter_within(start, end).collect()
    }

    /// Marks a range as never free
    pub fn exclude(&self, start: u64, len: u64) {
        self.excluded.lock().insert(start, len);
    }

    /// Lifts an exclusion
    pub fn unexclude(&self, start: u64, len: u64) {
        self.excluded.lock().remove(start, len);
    }

    /// Ranges in `[start, end)` the caching scan must not report free
    pub(crate) fn busy_within(&self, start: u64, end: u64) -> RangeTree {
        let mut busy = RangeTree::new();
        for (s, e) in self.excluded.lock().iter_within(start, end) {
            busy.insert(s, e - s);
        }
        for (s, e) in self.active_within(start, end) {
            busy.insert(s, e - s);
        }
        busy
    }

    /// Flips the buffers; pins made from now on land in the other set
    fn swap(&self) {
        let mut state = self.state.lock();
        state.active ^= 1;
    }

    /// Drains the inactive set
    fn take_unpin(&self) -> RangeTree {
        let mut state = self.state.lock();
        let idx = state.active ^ 1;
        std::mem::take(&mut state.freed[idx])
    }
}

/// Moves `num_bytes` of a group into the pinned state
///
/// With `reserved` the bytes come out of the group's reservation (an
/// allocation that was never inserted); otherwise they were already moved
/// out of `used` by the caller.
pub fn pin_down_extent(
    fs: &FsContext,
    cache: &BlockGroupCache,
    bytenr: u64,
    num_bytes: u64,
    reserved: bool,
) {
    {
        let sinfo = cache.space_info();
        let mut counters = sinfo.lock();
        let mut state = cache.lock_state();
        state.pinned += num_bytes;
        counters.bytes_pinned += num_bytes;
        if reserved {
            state.reserved = state.reserved.saturating_sub(num_bytes);
            counters.bytes_reserved = counters.bytes_reserved.saturating_sub(num_bytes);
        }
    }
    fs.pinned.mark(bytenr, num_bytes);
}

/// Pins a range by address
pub fn pin_extent(fs: &FsContext, bytenr: u64, num_bytes: u64, reserved: bool) -> Result<()> {
    let cache = fs.lookup_block_group(bytenr).ok_or_else(|| {
        BtrfsError::Corrupt(format!("no block group for pinned extent {}", bytenr))
    })?;
    pin_down_extent(fs, &cache, bytenr, num_bytes, reserved);
    Ok(())
}

/// Pins an extent a log tree references so replay cannot reuse it
pub fn pin_extent_for_log_replay(fs: &FsContext, bytenr: u64, num_bytes: u64) -> Result<()> {
    let cache = fs.lookup_block_group(bytenr).ok_or_else(|| {
        BtrfsError::Corrupt(format!("no block group for log extent {}", bytenr))
    })?;
    // the free-space index must exist before the range can be carved out
    super::block_group::cache_block_group(fs, &cache, true)?;
    pin_down_extent(fs, &cache, bytenr, num_bytes, false);
    cache.free_space_ctl().remove_overlap(bytenr, num_bytes);
    Ok(())
}

/// Freezes each group's unpin watermark and flips the pinned buffers
///
/// Runs with the commit lock held, after the final delayed-ref run.
pub fn prepare_extent_commit(fs: &FsContext) {
    for cache in fs.block_groups() {
        let mut state = cache.lock_state();
        state.last_byte_to_unpin = match state.cached {
            CacheState::Finished => u64::MAX,
            CacheState::Started => state.progress,
            _ => state.last_byte_to_unpin,
        };
    }
    fs.pinned.swap();
    super::block_rsv::update_global_block_rsv(fs);
}

/// Returns unpinned bytes to their groups
///
/// Only the part below each group's watermark goes back to the free-space
/// index; the caching scan reports the rest itself.
pub fn unpin_extent_range(fs: &FsContext, start: u64, end: u64) -> Result<()> {
    let mut cursor = start;
    while cursor < end {
        let cache = fs.lookup_block_group(cursor).ok_or_else(|| {
            BtrfsError::Corrupt(format!("no block group for unpinned extent {}", cursor))
        })?;
        let mut len = end.min(cache.start + cache.length) - cursor;

        let watermark = cache.lock_state().last_byte_to_unpin;
        if cursor < watermark {
            len = len.min(watermark - cursor);
            cache.free_space_ctl().add_free_space(cursor, len)?;
        }

        let sinfo = cache.space_info();
        let mut counters = sinfo.lock();
        let mut state = cache.lock_state();
        state.pinned = state.pinned.saturating_sub(len);
        counters.bytes_pinned = counters.bytes_pinned.saturating_sub(len);
        if state.ro {
            counters.bytes_readonly += len;
        }
        drop(state);
        drop(counters);

        cursor += len;
    }
    Ok(())
}

/// Issues discards for a logical range on every copy
pub fn discard_extent(fs: &FsContext, bytenr: u64, num_bytes: u64) -> Result<u64> {
    let chunks = fs.chunks.lock();
    let mut discarded = 0;
    for (devid, physical, len) in chunks.map_range(bytenr, num_bytes)? {
        let Some(device) = chunks.device(devid) else {
            continue;
        };
        match device.discard(physical, len) {
            Ok(()) => discarded += len,
            Err(crate::blockdev::BlockDeviceError::DiscardUnsupported) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(discarded)
}

/// Drains the inactive pinned set after a commit reached disk
pub fn finish_extent_commit(fs: &FsContext) -> Result<()> {
    let unpin = fs.pinned.take_unpin();
    let discard = fs.config().discard;
    let mut unpinned = 0;

    for (start, end) in unpin.iter() {
        if discard {
            if let Err(e) = discard_extent(fs, start, end - start) {
                warn!(start, len = end - start, error = %e, "discard failed");
            }
        }
        unpin_extent_range(fs, start, end)?;
        unpinned += end - start;
    }
    debug!(unpinned, "finished extent commit");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_swap() {
        let pinned = PinnedExtents::new();
        pinned.mark(4096, 4096);
        assert!(pinned.is_pinned(4096, 1));
        assert_eq!(pinned.active_bytes(), 4096);

        pinned.swap();
        assert!(!pinned.is_pinned(4096, 1));
        pinned.mark(16384, 4096);

        let unpin = pinned.take_unpin();
        assert_eq!(unpin.total(), 4096);
        assert!(unpin.contains(4096, 4096));
        assert!(pinned.is_pinned(16384, 4096));
        assert!(pinned.take_unpin().is_empty());
    }

    #[test]
    fn test_busy_within_merges_exclusions() {
        let pinned = PinnedExtents::new();
        pinned.exclude(0x10000, 4096);
        pinned.mark(0x11000, 4096);
        pinned.mark(0x40000, 4096);

        let busy = pinned.busy_within(0, 0x20000);
        assert_eq!(busy.iter().collect::<Vec<_>>(), vec![(0x10000, 0x12000)]);

        pinned.unexclude(0x10000, 4096);
        assert_eq!(pinned.busy_within(0, 0x20000).total(), 4096);
    }
}
