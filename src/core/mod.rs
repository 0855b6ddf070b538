//! BTRFS extent-tree core
//!
//! This module hosts the allocation side of a BTRFS filesystem: per-type
//! space accounting, block groups and their free-space caches, the extent
//! allocator, block reservations, delayed reference counting and the
//! transaction commit that ties them together. [`FsContext`] owns all of it.

pub mod alloc;
pub mod backref;
pub mod block_group;
pub mod block_rsv;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod delayed_ref;
pub mod extent;
pub mod free_space;
pub mod hooks;
pub mod pinned;
pub mod space_cache;
pub mod space_info;
pub mod transaction;
pub mod tree;
pub mod workers;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub use block_group::BlockGroupCache;
pub use block_rsv::{BlockRsv, BlockRsvKind};
pub use checksum::Checksum;
pub use chunk::{chunk_type, ChunkAllocForce, ChunkTree, DeviceSpec, RaidProfile};
pub use config::{ExtentConfig, SpacePolicy};
pub use delayed_ref::{DelayedRefRoot, ExtentOp, RefAction};
pub use hooks::{FsHooks, NoopHooks};
pub use space_info::{FlushMode, SpaceInfo, SpaceInfoSnapshot};
pub use transaction::{join_transaction, start_transaction, TransHandle};
pub use tree::{BtrfsKey, KeyValueTree, MemTree};

use free_space::FreeCluster;
use pinned::PinnedExtents;
use transaction::TransControl;
use workers::WorkerPool;

/// Primary superblock offset (64 KiB)
pub const SUPERBLOCK_OFFSET: u64 = 0x10000;

/// First superblock mirror offset (64 MiB)
pub const SUPERBLOCK_MIRROR1_OFFSET: u64 = 0x4000000;

/// Second superblock mirror offset (256 GiB)
pub const SUPERBLOCK_MIRROR2_OFFSET: u64 = 0x4000000000;

/// Bytes each superblock copy occupies
pub const SUPER_INFO_SIZE: u64 = 4096;

/// Default node size
pub const DEFAULT_NODE_SIZE: u32 = 16384;

/// Default sector size
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// Logical addresses below this are never handed out
pub const FIRST_LOGICAL_BYTE: u64 = 1024 * 1024;

/// Errors that can occur during BTRFS operations
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Block device error: {0}")]
    BlockDevice(#[from] crate::blockdev::BlockDeviceError),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("No space left")]
    NoSpace,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Resource busy, try again")]
    Again,

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, BtrfsError>;

/// Superblock fields the extent engine maintains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SuperCounters {
    /// Last committed transaction
    pub generation: u64,
    /// Generation the free-space caches were written in (0 when invalid)
    pub cache_generation: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
}

impl SuperCounters {
    const SIZE: usize = 32;

    fn key() -> BtrfsKey {
        BtrfsKey::new(0, item_type::PERSISTENT_ITEM, 0)
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.generation);
        LittleEndian::write_u64(&mut buf[8..16], self.cache_generation);
        LittleEndian::write_u64(&mut buf[16..24], self.total_bytes);
        LittleEndian::write_u64(&mut buf[24..32], self.bytes_used);
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(BtrfsError::Corrupt(format!(
                "Super counters too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            generation: LittleEndian::read_u64(&data[0..8]),
            cache_generation: LittleEndian::read_u64(&data[8..16]),
            total_bytes: LittleEndian::read_u64(&data[16..24]),
            bytes_used: LittleEndian::read_u64(&data[24..32]),
        })
    }
}

/// Profile bits seen per allocation type
#[derive(Debug, Default, Clone, Copy)]
struct AvailAllocBits {
    data: u64,
    metadata: u64,
    system: u64,
}

/// A mounted extent engine
///
/// Owns the space infos, the block-group cache, the built-in reservation
/// pools, the delayed-ref tree and the transaction state. Persistent
/// items live in two [`KeyValueTree`]s supplied by the caller: the extent
/// store (extent and block-group items, free-space caches) and the chunk
/// store (chunk items and the super counters).
pub struct FsContext {
    config: ExtentConfig,
    extent_root: Arc<dyn KeyValueTree>,
    chunk_root: Arc<dyn KeyValueTree>,
    hooks: Arc<dyn FsHooks>,

    /// Block groups keyed by start offset
    block_groups: RwLock<BTreeMap<u64, Arc<BlockGroupCache>>>,
    space_infos: RwLock<Vec<Arc<SpaceInfo>>>,
    avail_alloc_bits: Mutex<AvailAllocBits>,
    super_copy: Mutex<SuperCounters>,
    /// First fatal error, after which the filesystem is read-only
    fs_error: Mutex<Option<String>>,
    data_chunk_allocations: AtomicU64,

    pub(crate) chunks: Mutex<ChunkTree>,
    pub(crate) pinned: Arc<PinnedExtents>,
    pub(crate) workers: WorkerPool,
    pub(crate) global_rsv: Arc<BlockRsv>,
    pub(crate) delalloc_rsv: Arc<BlockRsv>,
    pub(crate) trans_rsv: Arc<BlockRsv>,
    pub(crate) chunk_rsv: Arc<BlockRsv>,
    pub(crate) empty_rsv: Arc<BlockRsv>,
    pub(crate) delayed_refs: DelayedRefRoot,
    pub(crate) meta_cluster: Mutex<FreeCluster>,
    pub(crate) data_cluster: Mutex<FreeCluster>,
    pub(crate) trans: TransControl,
}

impl FsContext {
    fn new(
        config: ExtentConfig,
        chunks: ChunkTree,
        super_copy: SuperCounters,
        extent_root: Arc<dyn KeyValueTree>,
        chunk_root: Arc<dyn KeyValueTree>,
    ) -> Result<Self> {
        let workers = WorkerPool::new("btrfs-cache", config.caching_workers)?;
        Ok(Self {
            config,
            extent_root,
            chunk_root,
            hooks: Arc::new(NoopHooks),
            block_groups: RwLock::new(BTreeMap::new()),
            space_infos: RwLock::new(Vec::new()),
            avail_alloc_bits: Mutex::new(AvailAllocBits::default()),
            super_copy: Mutex::new(super_copy),
            fs_error: Mutex::new(None),
            data_chunk_allocations: AtomicU64::new(0),
            chunks: Mutex::new(chunks),
            pinned: Arc::new(PinnedExtents::new()),
            workers,
            global_rsv: Arc::new(BlockRsv::new(BlockRsvKind::Global)),
            delalloc_rsv: Arc::new(BlockRsv::new(BlockRsvKind::Delalloc)),
            trans_rsv: Arc::new(BlockRsv::new(BlockRsvKind::Trans)),
            chunk_rsv: Arc::new(BlockRsv::new(BlockRsvKind::Chunk)),
            empty_rsv: Arc::new(BlockRsv::new(BlockRsvKind::Empty)),
            delayed_refs: DelayedRefRoot::new(),
            meta_cluster: Mutex::new(FreeCluster::new()),
            data_cluster: Mutex::new(FreeCluster::new()),
            trans: TransControl::new(super_copy.generation),
        })
    }

    /// Formats empty stores over `devices`
    ///
    /// Allocates one system, one metadata and one data chunk and persists
    /// their chunk and block-group items.
    pub fn create(
        config: ExtentConfig,
        devices: &[DeviceSpec],
        extent_root: Arc<dyn KeyValueTree>,
        chunk_root: Arc<dyn KeyValueTree>,
    ) -> Result<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(BtrfsError::InvalidConfig("no devices".to_string()));
        }
        if chunk_root.lookup(&SuperCounters::key())?.is_some() {
            return Err(BtrfsError::InvalidConfig(
                "chunk store already holds a filesystem".to_string(),
            ));
        }

        let super_copy = SuperCounters {
            total_bytes: devices.iter().map(|d| d.total_bytes).sum(),
            ..Default::default()
        };
        let fs = Self::new(config, ChunkTree::new(devices), super_copy, extent_root, chunk_root)?;

        for type_flags in [chunk_type::SYSTEM, chunk_type::METADATA, chunk_type::DATA] {
            let flags = chunk::get_alloc_profile(&fs, type_flags);
            chunk::btrfs_alloc_chunk(&fs, flags)?;
        }
        block_rsv::init_global_block_rsv(&fs);
        fs.commit_super(0, 0)?;

        info!(
            devices = devices.len(),
            total_bytes = super_copy.total_bytes,
            "created filesystem"
        );
        Ok(fs)
    }

    /// Mounts stores previously written by [`FsContext::create`]
    pub fn open(
        config: ExtentConfig,
        devices: &[DeviceSpec],
        extent_root: Arc<dyn KeyValueTree>,
        chunk_root: Arc<dyn KeyValueTree>,
    ) -> Result<Self> {
        config.validate()?;
        let data = chunk_root
            .lookup(&SuperCounters::key())?
            .ok_or_else(|| BtrfsError::NotFound("super counters".to_string()))?;
        let super_copy = SuperCounters::from_bytes(&data)?;
        let chunks = ChunkTree::load(chunk_root.as_ref(), devices)?;

        let fs = Self::new(config, chunks, super_copy, extent_root, chunk_root)?;
        let groups = block_group::read_block_groups(&fs)?;
        block_rsv::init_global_block_rsv(&fs);

        info!(
            generation = super_copy.generation,
            groups,
            bytes_used = super_copy.bytes_used,
            "opened filesystem"
        );
        Ok(fs)
    }

    /// Installs the callbacks into the layers above
    pub fn with_hooks(mut self, hooks: Arc<dyn FsHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Stops background work and drops every reservation
    ///
    /// Uncommitted changes are lost; commit a transaction first.
    pub fn close(self) -> Result<()> {
        if let Some(transid) = self.trans.running_transid() {
            warn!(transid, "closing with an uncommitted transaction");
        }
        self.workers.shutdown();
        for cache in self.block_groups() {
            if let Err(e) = block_group::wait_block_group_cache_done(&cache) {
                warn!(start = cache.start, error = %e, "caching failed during close");
            }
        }
        alloc::release_clusters(&self, None)?;
        block_rsv::release_global_block_rsv(&self);
        info!(generation = self.trans.last_committed(), "closed filesystem");
        Ok(())
    }

    pub fn config(&self) -> &ExtentConfig {
        &self.config
    }

    /// Store holding extent items, block-group items and free-space caches
    pub fn extent_root(&self) -> &Arc<dyn KeyValueTree> {
        &self.extent_root
    }

    /// Store holding chunk items
    pub fn chunk_root(&self) -> &Arc<dyn KeyValueTree> {
        &self.chunk_root
    }

    pub fn hooks(&self) -> &dyn FsHooks {
        self.hooks.as_ref()
    }

    /// The block group containing `bytenr`
    pub fn lookup_block_group(&self, bytenr: u64) -> Option<Arc<BlockGroupCache>> {
        self.block_groups
            .read()
            .range(..=bytenr)
            .next_back()
            .filter(|(_, cache)| bytenr < cache.end())
            .map(|(_, cache)| cache.clone())
    }

    /// Every block group in address order
    pub fn block_groups(&self) -> Vec<Arc<BlockGroupCache>> {
        self.block_groups.read().values().cloned().collect()
    }

    pub(crate) fn insert_block_group(&self, cache: Arc<BlockGroupCache>) -> Result<()> {
        let mut groups = self.block_groups.write();
        let overlaps_prev = groups
            .range(..=cache.start)
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > cache.start);
        let overlaps_next = groups
            .range(cache.start..)
            .next()
            .is_some_and(|(&start, _)| start < cache.end());
        if overlaps_prev || overlaps_next {
            return Err(BtrfsError::Corrupt(format!(
                "Block group {}+{} overlaps an existing group",
                cache.start, cache.length
            )));
        }
        groups.insert(cache.start, cache);
        Ok(())
    }

    /// The space info accounting `flags`' type, if one exists yet
    pub fn find_space_info(&self, flags: u64) -> Option<Arc<SpaceInfo>> {
        self.space_infos
            .read()
            .iter()
            .find(|s| s.matches(flags))
            .cloned()
    }

    pub(crate) fn get_or_create_space_info(&self, flags: u64) -> Arc<SpaceInfo> {
        if let Some(found) = self.find_space_info(flags) {
            return found;
        }
        let mut infos = self.space_infos.write();
        if let Some(found) = infos.iter().find(|s| s.matches(flags)) {
            return found.clone();
        }
        let created = Arc::new(SpaceInfo::new(flags));
        infos.push(created.clone());
        created
    }

    pub(crate) fn set_avail_alloc_bits(&self, flags: u64) {
        let profile = flags & chunk_type::PROFILE_MASK;
        let mut bits = self.avail_alloc_bits.lock();
        if flags & chunk_type::DATA != 0 {
            bits.data |= profile;
        }
        if flags & chunk_type::METADATA != 0 {
            bits.metadata |= profile;
        }
        if flags & chunk_type::SYSTEM != 0 {
            bits.system |= profile;
        }
    }

    /// Profile bits present among block groups of `type_flags`
    pub fn avail_alloc_bits(&self, type_flags: u64) -> u64 {
        let bits = self.avail_alloc_bits.lock();
        if type_flags & chunk_type::DATA != 0 {
            bits.data
        } else if type_flags & chunk_type::SYSTEM != 0 {
            bits.system
        } else {
            bits.metadata
        }
    }

    pub fn super_total_bytes(&self) -> u64 {
        self.super_copy.lock().total_bytes
    }

    pub fn super_counters(&self) -> SuperCounters {
        *self.super_copy.lock()
    }

    pub(crate) fn update_super_bytes_used(&self, num_bytes: u64, alloc: bool) {
        let mut sb = self.super_copy.lock();
        sb.bytes_used = if alloc {
            sb.bytes_used + num_bytes
        } else {
            sb.bytes_used.saturating_sub(num_bytes)
        };
    }

    /// Persists the super counters for a finished commit
    pub(crate) fn commit_super(&self, transid: u64, cache_generation: u64) -> Result<()> {
        let sb = {
            let mut sb = self.super_copy.lock();
            sb.generation = transid;
            sb.cache_generation = cache_generation;
            *sb
        };
        let key = SuperCounters::key();
        if self.chunk_root.lookup(&key)?.is_some() {
            self.chunk_root.replace(&key, sb.to_bytes())
        } else {
            self.chunk_root.insert(key, sb.to_bytes())
        }
    }

    /// Fails with [`BtrfsError::ReadOnly`] once a fatal error was recorded
    pub fn check_writable(&self) -> Result<()> {
        if self.is_errored() {
            return Err(BtrfsError::ReadOnly);
        }
        Ok(())
    }

    pub fn is_errored(&self) -> bool {
        self.fs_error.lock().is_some()
    }

    /// The first fatal error recorded
    pub fn fs_error(&self) -> Option<String> {
        self.fs_error.lock().clone()
    }

    /// Records a fatal error and forces the filesystem read-only
    pub fn handle_fs_error(&self, err: &BtrfsError) {
        let mut slot = self.fs_error.lock();
        if slot.is_none() {
            error!(error = %err, "filesystem forced read-only");
            *slot = Some(err.to_string());
        }
    }

    /// Counts a data chunk allocation, returning the new total
    pub(crate) fn note_data_chunk(&self) -> u64 {
        self.data_chunk_allocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Makes the next metadata chunk allocation unconditional
    pub(crate) fn force_metadata_allocation(&self) {
        for sinfo in self.space_infos.read().iter() {
            if sinfo.flags() & chunk_type::METADATA != 0 {
                sinfo.lock().force_alloc = ChunkAllocForce::Force;
            }
        }
    }

    pub fn first_logical_byte(&self) -> u64 {
        FIRST_LOGICAL_BYTE
    }

    /// Last committed transaction id
    pub fn generation(&self) -> u64 {
        self.trans.last_committed()
    }

    /// Delayed reference tree
    pub fn delayed_refs(&self) -> &DelayedRefRoot {
        &self.delayed_refs
    }

    /// Extents pinned in the running transaction
    pub fn pinned_extents(&self) -> &PinnedExtents {
        &self.pinned
    }

    pub fn global_rsv(&self) -> &Arc<BlockRsv> {
        &self.global_rsv
    }

    pub fn delalloc_rsv(&self) -> &Arc<BlockRsv> {
        &self.delalloc_rsv
    }

    /// Unallocated device bytes
    pub fn unallocated_bytes(&self) -> u64 {
        self.chunks.lock().unallocated_bytes()
    }

    /// Point-in-time usage of every space info
    pub fn space_report(&self) -> Vec<SpaceInfoSnapshot> {
        self.space_infos.read().iter().map(|s| s.snapshot()).collect()
    }
}

impl Drop for FsContext {
    fn drop(&mut self) {
        self.workers.shutdown();
        // groups point back at their space info
        for sinfo in self.space_infos.read().iter() {
            sinfo.clear_groups();
        }
    }
}

/// Object IDs for well-known trees
pub mod objectid {
    /// Root tree object ID
    pub const ROOT_TREE: u64 = 1;
    /// Extent tree object ID
    pub const EXTENT_TREE: u64 = 2;
    /// Chunk tree object ID
    pub const CHUNK_TREE: u64 = 3;
    /// Dev tree object ID
    pub const DEV_TREE: u64 = 4;
    /// FS tree object ID
    pub const FS_TREE: u64 = 5;
    /// Checksum tree object ID
    pub const CSUM_TREE: u64 = 7;
    /// First free object ID for subvolumes
    pub const FIRST_FREE: u64 = 256;
    /// Object ID of chunk items
    pub const FIRST_CHUNK_TREE: u64 = 256;
    /// Object ID of device items
    pub const DEV_ITEMS: u64 = 1;
    /// Object ID of free-space cache items
    pub const FREE_SPACE_OBJECTID: u64 = u64::MAX - 10;
    /// Tree log object ID
    pub const TREE_LOG: u64 = u64::MAX - 5;
    /// Last free object ID
    pub const LAST_FREE: u64 = u64::MAX - 256;
}

/// Item types in BTRFS trees
pub mod item_type {
    pub const INODE_ITEM: u8 = 0x01;
    pub const EXTENT_DATA: u8 = 0x6C;
    pub const EXTENT_CSUM: u8 = 0x80;
    pub const ROOT_ITEM: u8 = 0x84;
    pub const EXTENT_ITEM: u8 = 0xA8;
    pub const METADATA_ITEM: u8 = 0xA9;
    pub const TREE_BLOCK_REF: u8 = 0xB0;
    pub const EXTENT_DATA_REF: u8 = 0xB2;
    pub const SHARED_BLOCK_REF: u8 = 0xB6;
    pub const SHARED_DATA_REF: u8 = 0xB8;
    pub const BLOCK_GROUP_ITEM: u8 = 0xC0;
    pub const DEV_EXTENT: u8 = 0xCC;
    pub const DEV_ITEM: u8 = 0xD8;
    pub const CHUNK_ITEM: u8 = 0xE4;
    pub const PERSISTENT_ITEM: u8 = 0xF9;
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn small_config() -> ExtentConfig {
        ExtentConfig {
            async_caching: false,
            ..Default::default()
        }
    }

    fn stores() -> (Arc<dyn KeyValueTree>, Arc<dyn KeyValueTree>) {
        (Arc::new(MemTree::new()), Arc::new(MemTree::new()))
    }

    #[test]
    fn test_btrfs_constants() {
        assert_eq!(SUPERBLOCK_OFFSET, 0x10000);
        assert_eq!(SUPERBLOCK_MIRROR1_OFFSET, 0x4000000);
        assert_eq!(SUPERBLOCK_MIRROR2_OFFSET, 0x4000000000);
        assert_eq!(DEFAULT_NODE_SIZE, 16384);
        assert_eq!(DEFAULT_SECTOR_SIZE, 4096);
    }

    #[test]
    fn test_objectid_constants() {
        assert_eq!(objectid::ROOT_TREE, 1);
        assert_eq!(objectid::EXTENT_TREE, 2);
        assert_eq!(objectid::CHUNK_TREE, 3);
        assert_eq!(objectid::DEV_TREE, 4);
        assert_eq!(objectid::FS_TREE, 5);
        assert_eq!(objectid::CSUM_TREE, 7);
        assert_eq!(objectid::FIRST_FREE, 256);
        assert_eq!(objectid::FREE_SPACE_OBJECTID, u64::MAX - 10);
        assert_eq!(objectid::TREE_LOG, u64::MAX - 5);
    }

    #[test]
    fn test_item_type_constants() {
        assert_eq!(item_type::EXTENT_ITEM, 0xA8);
        assert_eq!(item_type::METADATA_ITEM, 0xA9);
        assert_eq!(item_type::TREE_BLOCK_REF, 0xB0);
        assert_eq!(item_type::EXTENT_DATA_REF, 0xB2);
        assert_eq!(item_type::SHARED_BLOCK_REF, 0xB6);
        assert_eq!(item_type::SHARED_DATA_REF, 0xB8);
        assert_eq!(item_type::BLOCK_GROUP_ITEM, 0xC0);
        assert_eq!(item_type::CHUNK_ITEM, 0xE4);
        assert_eq!(item_type::PERSISTENT_ITEM, 0xF9);
    }

    #[test]
    fn test_btrfs_error_display() {
        let err = BtrfsError::ChecksumMismatch {
            expected: 0x12345678,
            actual: 0x87654321,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("12345678"));
        assert!(msg.contains("87654321"));

        let err = BtrfsError::Corrupt("corruption details".to_string());
        assert!(format!("{}", err).contains("corruption details"));

        let err = BtrfsError::Aborted("earlier failure".to_string());
        assert!(format!("{}", err).contains("earlier failure"));

        let err = BtrfsError::ReadOnly;
        assert!(format!("{}", err).contains("Read-only"));

        let err = BtrfsError::NoSpace;
        assert!(format!("{}", err).contains("space"));
    }

    #[test]
    fn test_btrfs_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let btrfs_err: BtrfsError = io_err.into();
        match btrfs_err {
            BtrfsError::Io(_) => (),
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_btrfs_error_from_block_device() {
        let bd_err = crate::blockdev::BlockDeviceError::ReadOnly;
        let btrfs_err: BtrfsError = bd_err.into();
        match btrfs_err {
            BtrfsError::BlockDevice(_) => (),
            _ => panic!("Expected BlockDevice error variant"),
        }
    }

    #[test]
    fn test_super_counters_encoding() {
        let sb = SuperCounters {
            generation: 7,
            cache_generation: 6,
            total_bytes: 1 << 30,
            bytes_used: 12345,
        };
        assert_eq!(SuperCounters::from_bytes(&sb.to_bytes()).unwrap(), sb);
        assert!(SuperCounters::from_bytes(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_create_allocates_one_chunk_per_type() {
        let (extent_root, chunk_root) = stores();
        let fs = FsContext::create(
            small_config(),
            &[DeviceSpec::new(1, 1024 * MIB)],
            extent_root,
            chunk_root,
        )
        .unwrap();

        for type_flags in [chunk_type::SYSTEM, chunk_type::METADATA, chunk_type::DATA] {
            let sinfo = fs.find_space_info(type_flags).unwrap();
            assert!(sinfo.lock().total_bytes > 0);
            assert_eq!(sinfo.all_groups().len(), 1);
        }
        assert_eq!(fs.block_groups().len(), 3);
        assert_eq!(fs.generation(), 0);
        assert_eq!(fs.super_counters().bytes_used, 0);
    }

    #[test]
    fn test_lookup_block_group_bounds() {
        let (extent_root, chunk_root) = stores();
        let fs = FsContext::create(
            small_config(),
            &[DeviceSpec::new(1, 1024 * MIB)],
            extent_root,
            chunk_root,
        )
        .unwrap();

        let first = fs.block_groups()[0].clone();
        assert!(first.start >= FIRST_LOGICAL_BYTE);
        assert!(fs.lookup_block_group(first.start).is_some());
        assert!(fs.lookup_block_group(first.end() - 1).is_some());
        assert!(fs.lookup_block_group(first.start - 1).is_none());
    }

    #[test]
    fn test_create_refuses_used_store() {
        let (extent_root, chunk_root) = stores();
        let fs = FsContext::create(
            small_config(),
            &[DeviceSpec::new(1, 1024 * MIB)],
            extent_root.clone(),
            chunk_root.clone(),
        )
        .unwrap();
        fs.close().unwrap();

        let again = FsContext::create(
            small_config(),
            &[DeviceSpec::new(1, 1024 * MIB)],
            extent_root,
            chunk_root,
        );
        assert!(matches!(again, Err(BtrfsError::InvalidConfig(_))));
    }

    #[test]
    fn test_fs_error_makes_read_only() {
        let (extent_root, chunk_root) = stores();
        let fs = FsContext::create(
            small_config(),
            &[DeviceSpec::new(1, 1024 * MIB)],
            extent_root,
            chunk_root,
        )
        .unwrap();
        assert!(fs.check_writable().is_ok());

        fs.handle_fs_error(&BtrfsError::Corrupt("first".to_string()));
        fs.handle_fs_error(&BtrfsError::Corrupt("second".to_string()));
        assert!(matches!(fs.check_writable(), Err(BtrfsError::ReadOnly)));
        assert!(fs.fs_error().unwrap().contains("first"));
    }
}
