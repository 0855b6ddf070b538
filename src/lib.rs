//! BTRFS Extent Tree
//!
//! The allocation engine of a BTRFS filesystem in pure Rust.
//!
//! # Features
//!
//! - Per-type space accounting with over-commit and reservation flushing
//! - Block groups with lazily built, persistable free-space caches
//! - Clustered extent allocation with chunk allocation on demand
//! - Delayed reference counting with sequence-consistent readers
//! - Inline and standalone extent backrefs
//! - Pinned extents released at transaction commit, with optional discard
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - [`blockdev`]: Block device abstraction layer for image files and memory
//! - [`core`]: Space infos, block groups, allocator, reservations, delayed
//!   refs and transactions, all owned by [`FsContext`]

pub mod blockdev;
pub mod core;

pub use blockdev::{BlockDevice, BlockDeviceError};
pub use core::{
    BtrfsError, BtrfsKey, DeviceSpec, ExtentConfig, FsContext, FsHooks, KeyValueTree, MemTree,
    SpaceInfoSnapshot, TransHandle,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
