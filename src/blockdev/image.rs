//! Image file access
//!
//! Backs a device with a regular file. Reads go through a memory map when
//! one could be established; writes and discards use positioned file I/O.

use super::{check_range, BlockDevice, BlockDeviceError, Result};
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Default sector size for image files
const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Largest zero buffer written per discard step
const DISCARD_CHUNK: usize = 1024 * 1024;

/// An image file backed block device
pub struct ImageFile {
    file: Mutex<File>,
    mmap: Option<Mmap>,
    size: u64,
    read_only: bool,
}

impl ImageFile {
    /// Opens an image file
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(Self::from_file(file, size, read_only))
    }

    /// Creates a new, zeroed image file with the specified size
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        Ok(Self::from_file(file, size, false))
    }

    fn from_file(file: File, size: u64, read_only: bool) -> Self {
        // SAFETY: the map is only read, and every write goes through `file`
        // which the kernel keeps coherent with shared mappings
        let mmap = if size > 0 {
            unsafe { MmapOptions::new().map(&file) }.ok()
        } else {
            None
        };
        Self {
            file: Mutex::new(file),
            mmap,
            size,
            read_only,
        }
    }
}

impl BlockDevice for ImageFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let bytes_to_read = std::cmp::min(buf.len() as u64, self.size - offset) as usize;

        if let Some(ref mmap) = self.mmap {
            let src = &mmap[offset as usize..offset as usize + bytes_to_read];
            buf[..bytes_to_read].copy_from_slice(src);
            return Ok(bytes_to_read);
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(&mut buf[..bytes_to_read])?;
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }

        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let bytes_to_write = std::cmp::min(buf.len() as u64, self.size - offset) as usize;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let n = file.write(&buf[..bytes_to_write])?;
        Ok(n)
    }

    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_range(offset, len, self.size)?;

        // plain files have no trim; zero the range instead
        let zeros = vec![0u8; DISCARD_CHUNK.min(len as usize)];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut left = len;
        while left > 0 {
            let n = (left as usize).min(zeros.len());
            file.write_all(&zeros[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    fn flush_device(&self) -> Result<()> {
        self.file.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        // Create a 1MB image
        let size = 1024 * 1024;
        let img = ImageFile::create(path, size).unwrap();

        assert_eq!(img.size(), size);
        assert!(!img.is_read_only());

        let data = b"extent data";
        img.write_at(4096, data).unwrap();

        let mut buf = vec![0u8; data.len()];
        img.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_discard_zeroes_range() {
        let temp = NamedTempFile::new().unwrap();
        let img = ImageFile::create(temp.path(), 64 * 1024).unwrap();
        img.write_at(8192, &[0xAB; 4096]).unwrap();

        img.discard(8192, 4096).unwrap();
        let mut buf = vec![0xFFu8; 4096];
        img.read_at(8192, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        assert!(img.discard(60 * 1024, 8192).is_err());
    }

    #[test]
    fn test_read_only() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        let _img = ImageFile::create(path, 1024).unwrap();

        let img = ImageFile::open(path, true).unwrap();
        assert!(img.is_read_only());
        assert!(img.write_at(0, b"test").is_err());
        assert!(img.discard(0, 512).is_err());
    }
}
