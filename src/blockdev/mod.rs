//! Block device abstraction layer
//!
//! The extent engine only touches devices to discard freed ranges. Image
//! files and in-memory devices both implement [`BlockDevice`].

pub mod image;
pub mod memory;

use thiserror::Error;

pub use image::ImageFile;
pub use memory::MemDevice;

/// Errors that can occur during block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid offset: {offset} (device size: {size})")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("Device is read-only")]
    ReadOnly,

    #[error("Discard not supported")]
    DiscardUnsupported,
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device access
pub trait BlockDevice: Send + Sync {
    /// Returns the total size of the device in bytes
    fn size(&self) -> u64;

    /// Returns the sector size of the device
    fn sector_size(&self) -> u32;

    /// Returns true if the device is read-only
    fn is_read_only(&self) -> bool;

    /// Reads data at the specified offset
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes data at the specified offset
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Tells the device a range no longer holds data
    fn discard(&self, offset: u64, len: u64) -> Result<()>;

    /// Flushes any buffered data to the device
    fn flush_device(&self) -> Result<()>;
}

/// Checks that `[offset, offset + len)` lies inside a device of `size` bytes
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    if offset >= size || len > size - offset {
        return Err(BlockDeviceError::InvalidOffset { offset, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_device_error_display() {
        let err = BlockDeviceError::InvalidOffset {
            offset: 1000,
            size: 500,
        };
        assert!(format!("{}", err).contains("1000"));
        assert!(format!("{}", err).contains("500"));

        let err = BlockDeviceError::ReadOnly;
        assert!(format!("{}", err).contains("read-only"));

        let err = BlockDeviceError::DiscardUnsupported;
        assert!(format!("{}", err).contains("Discard"));
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 512, 1024).is_ok());
        assert!(check_range(512, 512, 1024).is_ok());
        assert!(check_range(512, 513, 1024).is_err());
        assert!(check_range(1024, 0, 1024).is_err());
    }
}
