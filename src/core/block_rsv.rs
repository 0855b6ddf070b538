//! Block reservations
//!
//! A [`BlockRsv`] is a named pool of metadata bytes already charged to its
//! space info's `bytes_may_use`. Operations that will dirty tree blocks move
//! bytes into a pool up front and consume them as blocks are allocated; the
//! global pool backs everyone else when their own pool runs dry.

use super::{
    chunk::chunk_type,
    free_space::align_up,
    space_info::{reserve_metadata_bytes, FlushMode, SpaceInfo},
    BtrfsError, FsContext, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a reservation pool is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRsvKind {
    Global,
    Delalloc,
    Trans,
    Chunk,
    Empty,
    Temp,
}

#[derive(Debug, Default)]
struct RsvInner {
    size: u64,
    reserved: u64,
    full: bool,
}

/// A pool of reserved metadata bytes
pub struct BlockRsv {
    kind: BlockRsvKind,
    inner: Mutex<RsvInner>,
    space_info: RwLock<Option<Arc<SpaceInfo>>>,
    /// Fail instead of falling back to an unreserved allocation
    failfast: bool,
}

impl BlockRsv {
    pub fn new(kind: BlockRsvKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(RsvInner {
                full: true,
                ..Default::default()
            }),
            space_info: RwLock::new(None),
            failfast: matches!(kind, BlockRsvKind::Temp),
        }
    }

    /// A temporary pool bound to `space_info`
    pub fn new_temp(space_info: Arc<SpaceInfo>) -> Self {
        let rsv = Self::new(BlockRsvKind::Temp);
        rsv.set_space_info(space_info);
        rsv
    }

    pub fn kind(&self) -> BlockRsvKind {
        self.kind
    }

    pub fn set_space_info(&self, space_info: Arc<SpaceInfo>) {
        *self.space_info.write() = Some(space_info);
    }

    pub fn space_info(&self) -> Option<Arc<SpaceInfo>> {
        self.space_info.read().clone()
    }

    /// Target size of the pool
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Bytes currently held
    pub fn reserved(&self) -> u64 {
        self.inner.lock().reserved
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().full
    }

    fn bound_space_info(&self) -> Result<Arc<SpaceInfo>> {
        self.space_info().ok_or_else(|| {
            BtrfsError::Corrupt(format!("{:?} reservation has no space info", self.kind))
        })
    }

    /// Credits `num_bytes` already charged to `bytes_may_use`
    pub fn add_bytes(&self, num_bytes: u64, update_size: bool) {
        let mut inner = self.inner.lock();
        inner.reserved += num_bytes;
        if update_size {
            inner.size += num_bytes;
        } else if inner.reserved >= inner.size {
            inner.full = true;
        }
    }

    /// Consumes `num_bytes` from the pool
    pub fn use_bytes(&self, num_bytes: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.reserved < num_bytes {
            return Err(BtrfsError::NoSpace);
        }
        inner.reserved -= num_bytes;
        if inner.reserved < inner.size {
            inner.full = false;
        }
        Ok(())
    }

    /// True once at least `min_factor` tenths of the target are held
    pub fn check(&self, min_factor: u64) -> bool {
        let inner = self.inner.lock();
        inner.reserved >= inner.size * min_factor / 10
    }

    /// Shrinks the target by `num_bytes` (`None` means all of it) and hands
    /// the excess to `dest`, returning the remainder to the space info
    fn release_bytes(&self, dest: Option<&BlockRsv>, num_bytes: Option<u64>) {
        let mut excess = {
            let mut inner = self.inner.lock();
            let n = num_bytes.unwrap_or(inner.size).min(inner.size);
            inner.size -= n;
            if inner.reserved >= inner.size {
                let excess = inner.reserved - inner.size;
                inner.reserved = inner.size;
                inner.full = true;
                excess
            } else {
                0
            }
        };
        if excess == 0 {
            return;
        }

        if let Some(dest) = dest {
            let mut d = dest.inner.lock();
            if !d.full {
                let to_add = (d.size - d.reserved.min(d.size)).min(excess);
                d.reserved += to_add;
                if d.reserved >= d.size {
                    d.full = true;
                }
                excess -= to_add;
            }
        }
        if excess > 0 {
            if let Some(sinfo) = self.space_info() {
                sinfo.release_may_use(excess);
            }
        }
    }
}

/// Reserves `num_bytes` into `rsv`, growing its target
pub fn block_rsv_add(fs: &FsContext, rsv: &BlockRsv, num_bytes: u64, flush: FlushMode) -> Result<()> {
    if num_bytes == 0 {
        return Ok(());
    }
    let sinfo = rsv.bound_space_info()?;
    reserve_metadata_bytes(fs, &sinfo, num_bytes, flush)?;
    rsv.add_bytes(num_bytes, true);
    Ok(())
}

/// Tops `rsv` up so it holds at least `min_reserved`
pub fn block_rsv_refill(fs: &FsContext, rsv: &BlockRsv, min_reserved: u64, flush: FlushMode) -> Result<()> {
    let held = rsv.reserved();
    if held >= min_reserved {
        return Ok(());
    }
    let sinfo = rsv.bound_space_info()?;
    let num_bytes = min_reserved - held;
    reserve_metadata_bytes(fs, &sinfo, num_bytes, flush)?;
    rsv.add_bytes(num_bytes, false);
    Ok(())
}

/// Moves `num_bytes` from one pool to another
pub fn block_rsv_migrate(src: &BlockRsv, dst: &BlockRsv, num_bytes: u64) -> Result<()> {
    src.use_bytes(num_bytes)?;
    dst.add_bytes(num_bytes, true);
    Ok(())
}

/// Returns `num_bytes` of a pool's target, topping up the global pool first
pub fn block_rsv_release(fs: &FsContext, rsv: &BlockRsv, num_bytes: Option<u64>) {
    let global = &fs.global_rsv;
    let same_sinfo = match (rsv.space_info(), global.space_info()) {
        (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
        _ => false,
    };
    let dest = if std::ptr::eq(rsv, global.as_ref()) || global.is_full() || !same_sinfo {
        None
    } else {
        Some(global.as_ref())
    };
    rsv.release_bytes(dest, num_bytes);
}

/// Picks the pool a tree-block allocation draws from and consumes
/// `blocksize` from it
///
/// Falls back to an unflushed reservation, then to the global pool.
pub fn use_block_rsv(fs: &FsContext, rsv: &Arc<BlockRsv>, blocksize: u64) -> Result<Arc<BlockRsv>> {
    let global = &fs.global_rsv;
    let sinfo = rsv.bound_space_info()?;

    if rsv.size() == 0 {
        return match reserve_metadata_bytes(fs, &sinfo, blocksize, FlushMode::NoFlush) {
            Ok(()) => Ok(rsv.clone()),
            Err(BtrfsError::NoSpace) if !Arc::ptr_eq(rsv, global) => {
                global.use_bytes(blocksize)?;
                Ok(global.clone())
            }
            Err(e) => Err(e),
        };
    }

    if rsv.use_bytes(blocksize).is_ok() {
        return Ok(rsv.clone());
    }
    if rsv.failfast {
        return Err(BtrfsError::NoSpace);
    }

    warn!(kind = ?rsv.kind(), blocksize, "block reservation exhausted, reserving directly");
    match reserve_metadata_bytes(fs, &sinfo, blocksize, FlushMode::NoFlush) {
        Ok(()) => Ok(rsv.clone()),
        Err(BtrfsError::NoSpace) if !Arc::ptr_eq(rsv, global) => {
            global.use_bytes(blocksize)?;
            Ok(global.clone())
        }
        Err(e) => Err(e),
    }
}

/// Gives back a block that was taken with [`use_block_rsv`] but not used
pub fn unuse_block_rsv(rsv: &BlockRsv, blocksize: u64) {
    rsv.add_bytes(blocksize, false);
    rsv.release_bytes(None, Some(0));
}

/// Size the global reservation should have
///
/// Scales with checksum and metadata usage, capped at a third of metadata
/// in use and at the policy maximum, rounded up to a thousand nodes.
pub fn calc_global_metadata_size(fs: &FsContext) -> u64 {
    let config = fs.config();
    let data_used = fs
        .find_space_info(chunk_type::DATA)
        .map(|s| s.lock().bytes_used)
        .unwrap_or(0);
    let meta_used = fs
        .find_space_info(chunk_type::METADATA)
        .map(|s| s.lock().bytes_used)
        .unwrap_or(0);

    let csum_size = config.csum_type.size() as u64;
    let mut num_bytes = (data_used / config.sector_size as u64) * csum_size;
    num_bytes += (data_used + meta_used) / 50;
    if num_bytes * 3 > meta_used {
        num_bytes = meta_used / 3;
    }
    num_bytes = num_bytes.min(config.policy.global_rsv_max);
    align_up(num_bytes, (config.node_size as u64) << 10).min(config.policy.global_rsv_max)
}

/// Resizes the global reservation and fills it from free metadata space
pub fn update_global_block_rsv(fs: &FsContext) {
    let rsv = &fs.global_rsv;
    let Some(sinfo) = rsv.space_info() else {
        return;
    };
    let size = calc_global_metadata_size(fs);

    let mut counters = sinfo.lock();
    let mut inner = rsv.inner.lock();
    inner.size = size;

    let used = counters.used_bytes(true);
    if counters.total_bytes > used {
        let fill = counters.total_bytes - used;
        inner.reserved += fill;
        counters.bytes_may_use += fill;
    }
    if inner.reserved >= inner.size {
        let excess = inner.reserved - inner.size;
        counters.bytes_may_use -= excess;
        inner.reserved = inner.size;
        inner.full = true;
    }
    debug!(size = inner.size, reserved = inner.reserved, "global block rsv updated");
}

/// Binds the built-in pools to their space infos and sizes the global one
pub fn init_global_block_rsv(fs: &FsContext) {
    if let Some(system) = fs.find_space_info(chunk_type::SYSTEM) {
        fs.chunk_rsv.set_space_info(system);
    }
    let Some(meta) = fs.find_space_info(chunk_type::METADATA) else {
        return;
    };
    for rsv in [&fs.global_rsv, &fs.delalloc_rsv, &fs.trans_rsv, &fs.empty_rsv] {
        rsv.set_space_info(meta.clone());
    }
    update_global_block_rsv(fs);
}

/// Empties every built-in pool
pub fn release_global_block_rsv(fs: &FsContext) {
    for rsv in [&fs.global_rsv, &fs.delalloc_rsv, &fs.trans_rsv, &fs.chunk_rsv] {
        rsv.release_bytes(None, None);
    }
}
