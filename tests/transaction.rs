//! Commit, abort and reopen

mod common;

use btrfs_extent_tree::core::backref::lookup_extent_info;
use btrfs_extent_tree::core::block_group::cache_block_group;
use btrfs_extent_tree::core::extent::extent_flags;
use btrfs_extent_tree::core::transaction::in_transaction;
use btrfs_extent_tree::core::{alloc, chunk_type, join_transaction, objectid, start_transaction};
use btrfs_extent_tree::{BtrfsError, DeviceSpec, FsContext, FsHooks};
use common::{committed_data_extent, new_fs, test_config, GIB, MIB, TEST_INODE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[test]
fn test_commit_advances_generation() {
    let t = new_fs(test_config());
    let before = t.fs.generation();

    let trans = start_transaction(&t.fs, 1).unwrap();
    assert_eq!(trans.transid(), before + 1);
    trans.commit().unwrap();
    assert_eq!(t.fs.generation(), before + 1);
    assert_eq!(t.fs.super_counters().generation, before + 1);

    let trans = join_transaction(&t.fs).unwrap();
    assert_eq!(trans.transid(), before + 2);
    trans.commit().unwrap();
    assert_eq!(t.fs.generation(), before + 2);
}

#[test]
fn test_handles_join_the_running_transaction() {
    let t = new_fs(test_config());
    assert!(!in_transaction());

    let a = start_transaction(&t.fs, 1).unwrap();
    assert!(in_transaction());
    let b = join_transaction(&t.fs).unwrap();
    assert_eq!(a.transid(), b.transid());
    b.end().unwrap();
    assert!(in_transaction());
    a.commit().unwrap();
    assert!(!in_transaction());
}

#[test]
fn test_transaction_reservation_is_returned() {
    let t = new_fs(test_config());
    let meta = t.fs.find_space_info(chunk_type::METADATA).unwrap();
    let before = meta.snapshot().bytes_may_use;

    let trans = start_transaction(&t.fs, 4).unwrap();
    assert!(trans.bytes_reserved() > 0);
    assert!(meta.snapshot().bytes_may_use > before);
    trans.end().unwrap();
    assert_eq!(meta.snapshot().bytes_may_use, before);
}

#[test]
fn test_failed_ref_update_aborts() {
    let t = new_fs(test_config());
    let bytenr = t.fs.first_logical_byte() + 512 * MIB;

    let trans = start_transaction(&t.fs, 1).unwrap();
    alloc::free_extent(&trans, bytenr, MIB, 0, objectid::FS_TREE, TEST_INODE, 0, false).unwrap();
    assert!(trans.commit().is_err());

    assert!(t.fs.is_errored());
    assert!(t.fs.fs_error().is_some());
    assert!(matches!(start_transaction(&t.fs, 1), Err(BtrfsError::ReadOnly)));
}

#[test]
fn test_explicit_abort() {
    let t = new_fs(test_config());
    let trans = start_transaction(&t.fs, 1).unwrap();
    trans.abort(&BtrfsError::Corrupt("bad leaf".to_string()));
    assert!(matches!(trans.check_aborted(), Err(BtrfsError::Aborted(_))));
    assert!(matches!(trans.commit(), Err(BtrfsError::Aborted(_))));
    assert!(t.fs.is_errored());
}

#[test]
fn test_concurrent_handles_commit_together() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let threads = 8u64;

    std::thread::scope(|s| {
        for i in 0..threads {
            let fs = &t.fs;
            s.spawn(move || {
                let trans = join_transaction(fs).unwrap();
                alloc::inc_extent_ref(
                    &trans,
                    ins.objectid,
                    ins.offset,
                    0,
                    objectid::FS_TREE,
                    TEST_INODE + 1 + i,
                    0,
                    false,
                )
                .unwrap();
                trans.end().unwrap();
            });
        }
    });

    let trans = join_transaction(&t.fs).unwrap();
    trans.commit().unwrap();
    assert!(t.fs.delayed_refs().is_empty());
    assert_eq!(
        lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0,
        threads + 1
    );
}

#[test]
fn test_reopen_restores_state() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let generation = t.fs.generation();
    let groups = t.fs.block_groups().len();
    let data_free = {
        let cache = t.fs.lookup_block_group(ins.objectid).unwrap();
        cache_block_group(&t.fs, &cache, false).unwrap();
        cache.free_space()
    };
    let extent_root = t.extent_root.clone();
    let chunk_root = t.chunk_root.clone();
    t.fs.close().unwrap();

    let fs = FsContext::open(test_config(), &[DeviceSpec::new(1, GIB)], extent_root, chunk_root).unwrap();
    assert_eq!(fs.generation(), generation);
    assert_eq!(fs.super_counters().cache_generation, generation);
    assert_eq!(fs.super_counters().bytes_used, MIB);
    assert_eq!(fs.block_groups().len(), groups);

    let cache = fs.lookup_block_group(ins.objectid).unwrap();
    assert!(cache.flags & chunk_type::DATA != 0);
    assert_eq!(cache.lock_state().used, MIB);
    cache_block_group(&fs, &cache, false).unwrap();
    assert_eq!(cache.free_space(), data_free);

    let (refs, flags) = lookup_extent_info(&fs, ins.objectid, ins.offset).unwrap();
    assert_eq!(refs, 1);
    assert!(flags & extent_flags::DATA != 0);

    let next = alloc::reserve_extent(&fs, MIB, MIB, 0, 0, true).unwrap();
    assert!(next.objectid >= ins.objectid + ins.offset || next.objectid + next.offset <= ins.objectid);
    alloc::free_reserved_extent(&fs, next.objectid, next.offset).unwrap();
    fs.close().unwrap();
}

#[test]
fn test_open_without_super_fails() {
    let store: Arc<dyn btrfs_extent_tree::KeyValueTree> = Arc::new(btrfs_extent_tree::MemTree::new());
    let chunks: Arc<dyn btrfs_extent_tree::KeyValueTree> = Arc::new(btrfs_extent_tree::MemTree::new());
    assert!(matches!(
        FsContext::open(test_config(), &[DeviceSpec::new(1, GIB)], store, chunks),
        Err(BtrfsError::NotFound(_))
    ));
}

#[derive(Default)]
struct CsumCounter {
    deleted: AtomicU64,
}

impl FsHooks for CsumCounter {
    fn flush_delalloc(&self, _fs: &FsContext, _bytes: u64) -> btrfs_extent_tree::core::Result<u64> {
        Ok(0)
    }

    fn delete_csums(&self, _fs: &FsContext, _bytenr: u64, len: u64) -> btrfs_extent_tree::core::Result<()> {
        self.deleted.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn test_freeing_data_drops_checksums() {
    let t = new_fs(test_config());
    let hooks = Arc::new(CsumCounter::default());
    let fs = t.fs.with_hooks(hooks.clone());
    let ins = committed_data_extent(&fs, MIB);

    let trans = start_transaction(&fs, 1).unwrap();
    alloc::free_extent(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE, 0, false).unwrap();
    trans.commit().unwrap();

    assert_eq!(hooks.deleted.load(Ordering::Relaxed), MIB);
    assert_eq!(lookup_extent_info(&fs, ins.objectid, ins.offset).unwrap(), (0, 0));
}
