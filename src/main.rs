//! BTRFS Extent Tree CLI
//!
//! Formats an in-memory extent engine over an image file, runs a small
//! allocation workload through one transaction and prints the resulting
//! space report as JSON.

use anyhow::{bail, Context};
use btrfs_extent_tree::{
    blockdev::ImageFile,
    core::{alloc, objectid, start_transaction},
    BlockDevice, BtrfsKey, DeviceSpec, ExtentConfig, FsContext, KeyValueTree, MemTree,
};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("BTRFS Extent Tree v{}", btrfs_extent_tree::VERSION);
        eprintln!();
        eprintln!("Usage: {} <image> [config.json]", args[0]);
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  image        Image file to allocate from (discards land here)");
        eprintln!("  config.json  Optional extent engine configuration");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  {} ./btrfs.img", args[0]);
        eprintln!("  {} ./btrfs.img ./ssd.json", args[0]);
        std::process::exit(1);
    }

    let config = match args.get(2) {
        Some(path) => ExtentConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path))?,
        None => ExtentConfig::default(),
    };

    let image = ImageFile::open(&args[1], false)
        .with_context(|| format!("failed to open image {}", args[1]))?;
    if image.is_read_only() {
        bail!("image {} is read-only", args[1]);
    }
    let device: Arc<dyn BlockDevice> = Arc::new(image);
    tracing::info!(
        "Image size: {} bytes ({:.2} GB)",
        device.size(),
        device.size() as f64 / 1_073_741_824.0
    );

    let extent_root: Arc<dyn KeyValueTree> = Arc::new(MemTree::new());
    let chunk_root: Arc<dyn KeyValueTree> = Arc::new(MemTree::new());
    let fs = FsContext::create(
        config,
        &[DeviceSpec::with_device(1, device)],
        extent_root,
        chunk_root,
    )?;

    let trans = start_transaction(&fs, 4)?;
    let data = alloc::reserve_extent(&fs, 1024 * 1024, 64 * 1024, 0, 0, true)?;
    alloc::alloc_reserved_file_extent(&trans, objectid::FS_TREE, objectid::FIRST_FREE, 0, &data)?;
    let block = alloc::alloc_tree_block(
        &trans,
        0,
        objectid::FS_TREE,
        &BtrfsKey::new(objectid::FIRST_FREE, 0, 0),
        0,
        0,
        0,
    )?;
    tracing::info!(
        "Allocated data extent {}+{} and tree block {}",
        data.objectid,
        data.offset,
        block.bytenr
    );
    trans.commit()?;

    println!("{}", serde_json::to_string_pretty(&fs.space_report())?);
    fs.close()?;
    Ok(())
}
