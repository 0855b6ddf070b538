//! Admission control: metadata and data reservations, block reservation
//! pools and chunk allocation triggers

mod common;

use btrfs_extent_tree::core::block_rsv::{block_rsv_add, block_rsv_release};
use btrfs_extent_tree::core::chunk::do_chunk_alloc;
use btrfs_extent_tree::core::space_info::{
    check_data_free_space, free_reserved_data_space, reserve_metadata_bytes, SpaceCounters,
};
use btrfs_extent_tree::core::{chunk_type, BlockRsv, BtrfsError, ChunkAllocForce, FlushMode};
use common::{new_fs, test_config, GIB, MIB};
use std::sync::Arc;

#[test]
fn test_no_flush_reservation_fails_past_total() {
    let mut config = test_config();
    // no room to over-commit into unallocated device space
    config.policy.overcommit_shift_no_flush = 63;
    let t = new_fs(config);
    let sinfo = t.fs.find_space_info(chunk_type::METADATA).unwrap();
    *sinfo.lock() = SpaceCounters {
        total_bytes: GIB,
        ..Default::default()
    };

    reserve_metadata_bytes(&t.fs, &sinfo, 512 * MIB, FlushMode::NoFlush).unwrap();
    let err = reserve_metadata_bytes(&t.fs, &sinfo, 600 * MIB, FlushMode::NoFlush).unwrap_err();
    assert!(matches!(err, BtrfsError::NoSpace));
    assert_eq!(sinfo.lock().bytes_may_use, 512 * MIB);
}

#[test]
fn test_metadata_overcommits_into_unallocated_space() {
    let t = new_fs(test_config());
    let sinfo = t.fs.find_space_info(chunk_type::METADATA).unwrap();
    *sinfo.lock() = SpaceCounters {
        total_bytes: 64 * MIB,
        ..Default::default()
    };

    // beyond the chunks, but well inside a quarter of the free device
    reserve_metadata_bytes(&t.fs, &sinfo, 70 * MIB, FlushMode::NoFlush).unwrap();
    assert_eq!(sinfo.lock().bytes_may_use, 70 * MIB);
}

#[test]
fn test_block_rsv_add_and_release_round_trip() {
    let t = new_fs(test_config());
    let sinfo = t.fs.find_space_info(chunk_type::METADATA).unwrap();
    let before = sinfo.lock().bytes_may_use;

    let rsv = BlockRsv::new_temp(sinfo.clone());
    block_rsv_add(&t.fs, &rsv, 4 * MIB, FlushMode::NoFlush).unwrap();
    assert_eq!(rsv.reserved(), 4 * MIB);
    assert_eq!(rsv.size(), 4 * MIB);
    assert_eq!(sinfo.lock().bytes_may_use, before + 4 * MIB);

    block_rsv_release(&t.fs, &rsv, None);
    assert_eq!(rsv.reserved(), 0);
    assert_eq!(sinfo.lock().bytes_may_use, before);
}

#[test]
fn test_data_reservation_round_trip() {
    let t = new_fs(test_config());
    let data = t.fs.find_space_info(chunk_type::DATA).unwrap();
    let before = data.lock().bytes_may_use;

    check_data_free_space(&t.fs, 3 * MIB + 1).unwrap();
    // rounded up to the sector size
    assert_eq!(data.lock().bytes_may_use, before + 3 * MIB + 4096);

    free_reserved_data_space(&t.fs, 3 * MIB + 1);
    assert_eq!(data.lock().bytes_may_use, before);
}

#[test]
fn test_data_reservation_allocates_chunks() {
    let t = new_fs(test_config());
    let data = t.fs.find_space_info(chunk_type::DATA).unwrap();
    let total = data.lock().total_bytes;

    check_data_free_space(&t.fs, total + MIB).unwrap();
    assert!(data.lock().total_bytes > total);
    assert!(data.all_groups().len() >= 2);
}

#[test]
fn test_data_reservation_fails_when_device_full() {
    let t = new_fs(test_config());
    let err = check_data_free_space(&t.fs, 2 * GIB).unwrap_err();
    assert!(matches!(err, BtrfsError::NoSpace));
    let data = t.fs.find_space_info(chunk_type::DATA).unwrap();
    assert!(data.lock().full);
}

#[test]
fn test_forced_chunk_allocation() {
    let t = new_fs(test_config());
    let data = t.fs.find_space_info(chunk_type::DATA).unwrap();
    let before = data.lock().total_bytes;

    // an almost empty group does not justify another chunk
    assert!(!do_chunk_alloc(&t.fs, 2 * MIB, chunk_type::DATA, ChunkAllocForce::NoForce).unwrap());
    assert_eq!(data.lock().total_bytes, before);

    assert!(do_chunk_alloc(&t.fs, 2 * MIB, chunk_type::DATA, ChunkAllocForce::Force).unwrap());
    assert!(data.lock().total_bytes > before);
    assert_eq!(data.all_groups().len(), 2);
    assert!(!data.lock().chunk_alloc);
}

#[test]
fn test_concurrent_chunk_allocations_are_serialized() {
    let t = Arc::new(new_fs(test_config()));
    let data = t.fs.find_space_info(chunk_type::DATA).unwrap();
    let groups_before = data.all_groups().len();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let t = Arc::clone(&t);
            std::thread::spawn(move || {
                do_chunk_alloc(&t.fs, 2 * MIB, chunk_type::DATA, ChunkAllocForce::Force).unwrap()
            })
        })
        .collect();
    let created = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&made| made)
        .count();

    assert_eq!(data.all_groups().len(), groups_before + created);
    let groups = t.fs.block_groups();
    for pair in groups.windows(2) {
        assert!(pair[0].end() <= pair[1].start);
    }
}

#[test]
fn test_space_report_lists_every_type() {
    let t = new_fs(test_config());
    let report = t.fs.space_report();
    assert_eq!(report.len(), 3);
    for snap in &report {
        assert!(snap.total_bytes > 0);
        assert_eq!(snap.block_groups, 1);
    }
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("bytes_may_use"));
}
