//! Checksum utilities for the extent tree
//!
//! BTRFS uses CRC32c both for data integrity and for the on-disk key offset
//! of standalone `EXTENT_DATA_REF` items.

use super::{BtrfsError, Result};
use serde::{Deserialize, Serialize};

/// Checksum algorithms a filesystem may be formatted with
///
/// Only the per-sector size matters here: it drives the global
/// reservation estimate for checksum items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checksum {
    /// CRC32c (Castagnoli)
    #[default]
    Crc32c,
    /// XXHash64
    XxHash64,
    /// SHA256
    Sha256,
    /// Blake2b
    Blake2b,
}

impl Checksum {
    /// Returns the size of the checksum in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::Crc32c => 4,
            Self::XxHash64 => 8,
            Self::Sha256 | Self::Blake2b => 32,
        }
    }
}

/// Computes a CRC32c checksum
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Raw CRC32c update without the pre/post inversion
///
/// This is the kernel's `crc32c(seed, data, len)` primitive. The crate API
/// inverts on the way in and out, so undo both.
#[inline]
pub fn crc32c_raw(seed: u32, data: &[u8]) -> u32 {
    !crc32c::crc32c_append(!seed, data)
}

/// Verifies a CRC32c checksum
#[inline]
pub fn verify_crc32c(data: &[u8], expected: u32) -> Result<()> {
    let actual = crc32c(data);
    if actual != expected {
        return Err(BtrfsError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Hash used as the key offset of a standalone `EXTENT_DATA_REF` item
///
/// Collisions are resolved by probing forward from the hash, so the value
/// only needs to be stable, not unique.
pub fn hash_extent_data_ref(root_objectid: u64, owner: u64, offset: u64) -> u64 {
    let high_crc = crc32c_raw(!0, &root_objectid.to_le_bytes());
    let low_crc = crc32c_raw(!0, &owner.to_le_bytes());
    let low_crc = crc32c_raw(low_crc, &offset.to_le_bytes());

    ((high_crc as u64) << 31) ^ (low_crc as u64)
}
