//! Extent engine benchmarks using Criterion
//!
//! Run with: cargo bench
//! Run specific: cargo bench -- free_space

use btrfs_extent_tree::core::checksum::hash_extent_data_ref;
use btrfs_extent_tree::core::free_space::FreeSpaceCtl;
use btrfs_extent_tree::core::{alloc, DelayedRefRoot, RefAction};
use btrfs_extent_tree::{DeviceSpec, ExtentConfig, FsContext, KeyValueTree, MemTree};
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Free Space Index Benchmarks
// ============================================================================

/// Builds an index with `count` free ranges separated by used holes
fn fragmented_ctl(count: u64) -> FreeSpaceCtl {
    let mut ctl = FreeSpaceCtl::new();
    for i in 0..count {
        ctl.add_free_space(i * 64 * 1024, 32 * 1024).unwrap();
    }
    ctl
}

fn free_space_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_space");

    for count in [64u64, 1024, 16384] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("insert", count), &count, |b, &count| {
            b.iter(|| black_box(fragmented_ctl(count)))
        });

        group.bench_with_input(BenchmarkId::new("find_and_take", count), &count, |b, &count| {
            b.iter_batched(
                || fragmented_ctl(count),
                |mut ctl| {
                    while let Some(start) = ctl.find_space_for_alloc(0, 16 * 1024, 0, 4096) {
                        black_box(start);
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// ============================================================================
// Delayed Ref Benchmarks
// ============================================================================

fn delayed_ref_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("delayed_ref");

    group.bench_function("queue_distinct_extents", |b| {
        b.iter(|| {
            let root = DelayedRefRoot::new();
            let updates = AtomicU64::new(0);
            for i in 0..1000u64 {
                root.add_data_ref(&updates, MIB + i * 4096, 4096, 0, 5, 256 + i, 0, RefAction::Add, None, false)
                    .unwrap();
            }
            black_box(root.num_entries())
        })
    });

    group.bench_function("merge_add_drop", |b| {
        b.iter(|| {
            let root = DelayedRefRoot::new();
            let updates = AtomicU64::new(0);
            for _ in 0..500 {
                root.add_data_ref(&updates, MIB, 4096, 0, 5, 256, 0, RefAction::Add, None, false)
                    .unwrap();
                root.add_data_ref(&updates, MIB, 4096, 0, 5, 256, 0, RefAction::Drop, None, false)
                    .unwrap();
            }
            black_box(root.num_refs_for(MIB))
        })
    });

    group.bench_function("hash_extent_data_ref", |b| {
        b.iter(|| black_box(hash_extent_data_ref(black_box(5), black_box(257), black_box(8192))))
    });

    group.finish();
}

// ============================================================================
// Allocator Benchmarks
// ============================================================================

fn new_fs() -> FsContext {
    let extent_root: Arc<dyn KeyValueTree> = Arc::new(MemTree::new());
    let chunk_root: Arc<dyn KeyValueTree> = Arc::new(MemTree::new());
    let config = ExtentConfig {
        async_caching: false,
        ..Default::default()
    };
    FsContext::create(config, &[DeviceSpec::new(1, 4 * 1024 * MIB)], extent_root, chunk_root).unwrap()
}

fn allocator_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocator");
    let fs = new_fs();

    for size in [4096u64, 64 * 1024, MIB] {
        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::new("reserve_free_data", size), &size, |b, &size| {
            b.iter(|| {
                let ins = alloc::reserve_extent(&fs, size, size, 0, 0, true).unwrap();
                alloc::free_reserved_extent(&fs, ins.objectid, ins.offset).unwrap();
                black_box(ins)
            })
        });
    }

    group.finish();
}

criterion_group!(
    name = index_benches;
    config = Criterion::default();
    targets = free_space_benchmarks, delayed_ref_benchmarks
);

criterion_group!(
    name = allocator_benches;
    config = Criterion::default().sample_size(50);
    targets = allocator_benchmarks
);

criterion_main!(index_benches, allocator_benches);
