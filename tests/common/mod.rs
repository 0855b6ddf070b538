//! Shared fixtures for the integration tests
#![allow(dead_code)]

use btrfs_extent_tree::core::{alloc, objectid, start_transaction};
use btrfs_extent_tree::{BtrfsKey, DeviceSpec, ExtentConfig, FsContext, KeyValueTree, MemTree};
use std::sync::Arc;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Inode that owns test data extents
pub const TEST_INODE: u64 = objectid::FIRST_FREE + 1;

pub struct TestFs {
    pub fs: FsContext,
    pub extent_root: Arc<dyn KeyValueTree>,
    pub chunk_root: Arc<dyn KeyValueTree>,
}

/// Configuration with inline caching so tests stay deterministic
pub fn test_config() -> ExtentConfig {
    ExtentConfig {
        async_caching: false,
        ..Default::default()
    }
}

/// A freshly formatted filesystem over one device of `size` bytes
pub fn new_fs_sized(config: ExtentConfig, size: u64) -> TestFs {
    let extent_root: Arc<dyn KeyValueTree> = Arc::new(MemTree::new());
    let chunk_root: Arc<dyn KeyValueTree> = Arc::new(MemTree::new());
    let fs = FsContext::create(
        config,
        &[DeviceSpec::new(1, size)],
        extent_root.clone(),
        chunk_root.clone(),
    )
    .unwrap();
    TestFs {
        fs,
        extent_root,
        chunk_root,
    }
}

pub fn new_fs(config: ExtentConfig) -> TestFs {
    new_fs_sized(config, GIB)
}

/// Allocates a data extent referenced by [`TEST_INODE`] and commits it
pub fn committed_data_extent(fs: &FsContext, len: u64) -> BtrfsKey {
    let trans = start_transaction(fs, 1).unwrap();
    let ins = alloc::reserve_extent(fs, len, len, 0, 0, true).unwrap();
    alloc::alloc_reserved_file_extent(&trans, objectid::FS_TREE, TEST_INODE, 0, &ins).unwrap();
    trans.commit().unwrap();
    ins
}
