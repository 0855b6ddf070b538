//! In-memory block device

use super::{check_range, BlockDevice, BlockDeviceError, Result};
use parking_lot::Mutex;

/// A RAM-backed device that remembers every discard it receives
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    sector_size: u32,
    discards: Mutex<Vec<(u64, u64)>>,
}

impl MemDevice {
    /// Creates a zeroed device of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            data: Mutex::new(vec![0; size as usize]),
            sector_size: 4096,
            discards: Mutex::new(Vec::new()),
        }
    }

    /// Discarded `(offset, len)` ranges, in arrival order
    pub fn discards(&self) -> Vec<(u64, u64)> {
        self.discards.lock().clone()
    }

    /// Total bytes discarded so far
    pub fn discarded_bytes(&self) -> u64 {
        self.discards.lock().iter().map(|&(_, len)| len).sum()
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let size = data.len() as u64;
        if offset >= size {
            return Err(BlockDeviceError::InvalidOffset { offset, size });
        }
        let n = buf.len().min((size - offset) as usize);
        buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let size = data.len() as u64;
        if offset >= size {
            return Err(BlockDeviceError::InvalidOffset { offset, size });
        }
        let n = buf.len().min((size - offset) as usize);
        data[offset as usize..offset as usize + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        let mut data = self.data.lock();
        check_range(offset, len, data.len() as u64)?;
        data[offset as usize..(offset + len) as usize].fill(0);
        self.discards.lock().push((offset, len));
        Ok(())
    }

    fn flush_device(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_discard_tracking() {
        let dev = MemDevice::new(1 << 20);
        dev.write_at(0, &[1; 8192]).unwrap();
        dev.discard(4096, 4096).unwrap();

        let mut buf = [0xFFu8; 8192];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[4096], 0);
        assert_eq!(dev.discards(), vec![(4096, 4096)]);
        assert_eq!(dev.discarded_bytes(), 4096);
        assert!(dev.discard(1 << 20, 1).is_err());
    }
}
