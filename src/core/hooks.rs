//! Callbacks into the rest of the filesystem

use super::{FsContext, Result};

/// Services the extent engine needs from layers above it
pub trait FsHooks: Send + Sync {
    /// Writes back dirty delayed-allocation data, releasing up to `bytes`
    /// of its metadata reservations. Returns the bytes actually released.
    fn flush_delalloc(&self, fs: &FsContext, bytes: u64) -> Result<u64>;

    /// Drops data checksums covering a freed extent
    fn delete_csums(&self, fs: &FsContext, bytenr: u64, len: u64) -> Result<()>;
}

/// Hooks for a filesystem with no file data layer attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl FsHooks for NoopHooks {
    fn flush_delalloc(&self, _fs: &FsContext, _bytes: u64) -> Result<u64> {
        Ok(0)
    }

    fn delete_csums(&self, _fs: &FsContext, _bytenr: u64, _len: u64) -> Result<()> {
        Ok(())
    }
}
