//! Delayed reference queueing, merging and application

mod common;

use btrfs_extent_tree::core::backref::{extent_backrefs, lookup_extent_info};
use btrfs_extent_tree::core::delayed_ref::run_delayed_refs;
use btrfs_extent_tree::core::extent::{extent_flags, BackrefKind};
use btrfs_extent_tree::core::{alloc, item_type, objectid, start_transaction, BtrfsKey};
use common::{committed_data_extent, new_fs, test_config, MIB, TEST_INODE};

#[test]
fn test_add_then_drop_in_one_transaction_is_a_no_op() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let refs = t.fs.delayed_refs();

    let trans = start_transaction(&t.fs, 1).unwrap();
    alloc::inc_extent_ref(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE + 1, 0, false)
        .unwrap();
    assert_eq!(refs.num_refs_for(ins.objectid), 1);
    alloc::free_extent(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE + 1, 0, false)
        .unwrap();
    assert_eq!(refs.num_refs_for(ins.objectid), 0);
    assert_eq!(refs.find_head(ins.objectid).map(|h| h.ref_mod), Some(0));
    trans.commit().unwrap();

    assert!(refs.is_empty());
    assert_eq!(lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0, 1);
    let backrefs = extent_backrefs(&t.fs, ins.objectid, ins.offset).unwrap();
    assert_eq!(backrefs.len(), 1);
    assert_eq!(
        backrefs[0].kind,
        BackrefKind::ExtentData {
            root: objectid::FS_TREE,
            objectid: TEST_INODE,
            offset: 0,
        }
    );
}

#[test]
fn test_pending_refs_show_in_lookup() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);

    let trans = start_transaction(&t.fs, 1).unwrap();
    alloc::inc_extent_ref(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE, 4096, false)
        .unwrap();
    let (refs, flags) = lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap();
    assert_eq!(refs, 2);
    assert!(flags & extent_flags::DATA != 0);
    trans.commit().unwrap();

    assert_eq!(lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0, 2);
    assert_eq!(extent_backrefs(&t.fs, ins.objectid, ins.offset).unwrap().len(), 2);
}

#[test]
fn test_reader_defers_later_refs() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let refs = t.fs.delayed_refs();

    let trans = start_transaction(&t.fs, 1).unwrap();
    let reader = refs.register_reader();
    alloc::inc_extent_ref(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE + 1, 0, false)
        .unwrap();

    // queued after the reader, so it must wait for the reader to go
    assert_eq!(run_delayed_refs(&t.fs, &trans, 1).unwrap(), 0);
    assert_eq!(refs.num_refs_for(ins.objectid), 1);
    assert_eq!(extent_backrefs(&t.fs, ins.objectid, ins.offset).unwrap().len(), 1);

    drop(reader);
    assert!(run_delayed_refs(&t.fs, &trans, 0).unwrap() > 0);
    assert!(refs.is_empty());
    assert_eq!(extent_backrefs(&t.fs, ins.objectid, ins.offset).unwrap().len(), 2);
    trans.commit().unwrap();
}

#[test]
fn test_cow_refs_ignore_readers() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let refs = t.fs.delayed_refs();

    let trans = start_transaction(&t.fs, 1).unwrap();
    let _reader = refs.register_reader();
    alloc::inc_extent_ref(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE + 1, 0, true)
        .unwrap();
    assert!(run_delayed_refs(&t.fs, &trans, 1).unwrap() > 0);
    assert_eq!(refs.num_refs_for(ins.objectid), 0);
    assert_eq!(lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0, 2);
}

#[test]
fn test_many_refs_spill_to_standalone_items() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let extra = 200u64;

    let trans = start_transaction(&t.fs, 1).unwrap();
    for inode in 0..extra {
        alloc::inc_extent_ref(
            &trans,
            ins.objectid,
            ins.offset,
            0,
            objectid::FS_TREE,
            TEST_INODE + 1 + inode,
            0,
            false,
        )
        .unwrap();
    }
    trans.commit().unwrap();

    assert_eq!(lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0, extra + 1);
    assert_eq!(
        extent_backrefs(&t.fs, ins.objectid, ins.offset).unwrap().len() as u64,
        extra + 1
    );
    let standalone = t
        .extent_root
        .range(
            &BtrfsKey::new(ins.objectid, item_type::EXTENT_DATA_REF, 0),
            &BtrfsKey::new(ins.objectid, item_type::EXTENT_DATA_REF, u64::MAX),
        )
        .unwrap();
    assert!(!standalone.is_empty());

    let trans = start_transaction(&t.fs, 1).unwrap();
    for inode in 0..extra {
        alloc::free_extent(
            &trans,
            ins.objectid,
            ins.offset,
            0,
            objectid::FS_TREE,
            TEST_INODE + 1 + inode,
            0,
            false,
        )
        .unwrap();
    }
    trans.commit().unwrap();

    assert_eq!(lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0, 1);
    assert_eq!(extent_backrefs(&t.fs, ins.objectid, ins.offset).unwrap().len(), 1);
}

#[test]
fn test_extent_flags_update() {
    let t = new_fs(test_config());
    let node = t.fs.config().node_size as u64;
    let key = BtrfsKey::new(TEST_INODE, item_type::INODE_ITEM, 0);

    let trans = start_transaction(&t.fs, 1).unwrap();
    let block = alloc::alloc_tree_block(&trans, 0, objectid::FS_TREE, &key, 0, 0, 0).unwrap();
    trans.commit().unwrap();
    let (_, flags) = lookup_extent_info(&t.fs, block.bytenr, node).unwrap();
    assert_eq!(flags & extent_flags::FULL_BACKREF, 0);

    let trans = start_transaction(&t.fs, 1).unwrap();
    alloc::set_disk_extent_flags(&trans, block.bytenr, node, extent_flags::FULL_BACKREF, false).unwrap();
    let (refs, pending) = lookup_extent_info(&t.fs, block.bytenr, node).unwrap();
    assert_eq!(refs, 1);
    assert!(pending & extent_flags::FULL_BACKREF != 0);
    trans.commit().unwrap();

    let (refs, flags) = lookup_extent_info(&t.fs, block.bytenr, node).unwrap();
    assert_eq!(refs, 1);
    assert!(flags & extent_flags::FULL_BACKREF != 0);
    assert!(flags & extent_flags::TREE_BLOCK != 0);
}

#[test]
fn test_handle_end_runs_batch_of_refs() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let batch = t.fs.config().policy.delayed_ref_batch;

    let trans = start_transaction(&t.fs, 1).unwrap();
    for inode in 0..=batch {
        alloc::inc_extent_ref(
            &trans,
            ins.objectid,
            ins.offset,
            0,
            objectid::FS_TREE,
            TEST_INODE + 1 + inode,
            0,
            false,
        )
        .unwrap();
    }
    assert!(trans.ref_updates().load(std::sync::atomic::Ordering::Relaxed) > batch);
    trans.end().unwrap();

    assert!(t.fs.delayed_refs().num_entries() < (batch as usize) + 1);
    assert_eq!(
        lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0,
        batch + 2
    );
}

#[test]
fn test_full_run_sleeps_until_reader_leaves() {
    let t = new_fs(test_config());
    let ins = committed_data_extent(&t.fs, MIB);
    let refs = t.fs.delayed_refs();

    let trans = start_transaction(&t.fs, 1).unwrap();
    let reader = refs.register_reader();
    alloc::inc_extent_ref(&trans, ins.objectid, ins.offset, 0, objectid::FS_TREE, TEST_INODE + 1, 0, false)
        .unwrap();

    std::thread::scope(|s| {
        s.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            drop(reader);
        });
        assert!(run_delayed_refs(&t.fs, &trans, 0).unwrap() > 0);
    });

    assert!(refs.is_empty());
    assert_eq!(lookup_extent_info(&t.fs, ins.objectid, ins.offset).unwrap().0, 2);
    trans.commit().unwrap();
}
