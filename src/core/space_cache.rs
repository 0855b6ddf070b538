//! Persisted free-space cache
//!
//! At commit every fully cached block group writes its free ranges into the
//! extent store under `(FREE_SPACE_OBJECTID, 0, group start)`. Loading one
//! skips the extent-tree scan, but only if the cache is internally sound and
//! was written by the same commit the superblock records.
//!
//! Layout, little endian:
//!
//! | Offset | Size  | Field                |
//! |--------|-------|----------------------|
//! | 0      | 8     | generation           |
//! | 8      | 8     | entry count `n`      |
//! | 16     | 16*n  | `(start, len)` pairs |
//! | 16+16n | 4     | crc32c of the above  |

use super::{
    block_group::{BlockGroupCache, CacheState, DiskCacheState},
    checksum,
    free_space::RangeTree,
    objectid,
    tree::BtrfsKey,
    BtrfsError, FsContext, Result,
};
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 16;

/// Key of a group's cache item
pub fn cache_key(group_start: u64) -> BtrfsKey {
    BtrfsKey::new(objectid::FREE_SPACE_OBJECTID, 0, group_start)
}

/// A decoded cache item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSpaceCache {
    pub generation: u64,
    pub entries: Vec<(u64, u64)>,
}

impl FreeSpaceCache {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_SIZE + self.entries.len() * ENTRY_SIZE + 4];
        LittleEndian::write_u64(&mut data[0..8], self.generation);
        LittleEndian::write_u64(&mut data[8..16], self.entries.len() as u64);
        for (i, &(start, len)) in self.entries.iter().enumerate() {
            let off = HEADER_SIZE + i * ENTRY_SIZE;
            LittleEndian::write_u64(&mut data[off..off + 8], start);
            LittleEndian::write_u64(&mut data[off + 8..off + 16], len);
        }
        let body = data.len() - 4;
        let crc = checksum::crc32c(&data[..body]);
        LittleEndian::write_u32(&mut data[body..], crc);
        data
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + 4 {
            return Err(BtrfsError::Corrupt("free space cache truncated".to_string()));
        }
        let body = data.len() - 4;
        checksum::verify_crc32c(&data[..body], LittleEndian::read_u32(&data[body..]))?;

        let generation = LittleEndian::read_u64(&data[0..8]);
        let count = LittleEndian::read_u64(&data[8..16]) as usize;
        if HEADER_SIZE + count.saturating_mul(ENTRY_SIZE) != body {
            return Err(BtrfsError::Corrupt(format!(
                "free space cache claims {} entries in {} bytes",
                count,
                data.len()
            )));
        }
        let entries = (0..count)
            .map(|i| {
                let off = HEADER_SIZE + i * ENTRY_SIZE;
                (
                    LittleEndian::read_u64(&data[off..off + 8]),
                    LittleEndian::read_u64(&data[off + 8..off + 16]),
                )
            })
            .collect();
        Ok(Self {
            generation,
            entries,
        })
    }
}

fn validate(fs: &FsContext, cache: &BlockGroupCache, item: &FreeSpaceCache) -> Result<u64> {
    let expected_gen = fs.super_counters().cache_generation;
    if item.generation != expected_gen {
        return Err(BtrfsError::Corrupt(format!(
            "cache generation {} does not match {}",
            item.generation, expected_gen
        )));
    }
    let end = cache.start + cache.length;
    let mut free = 0;
    for &(start, len) in &item.entries {
        if len == 0 || start < cache.start || start + len > end {
            return Err(BtrfsError::Corrupt(format!(
                "cache entry {}+{} outside group {}",
                start, len, cache.start
            )));
        }
        free += len;
    }
    let used = cache.lock_state().used;
    if free + used + cache.bytes_super() != cache.length {
        return Err(BtrfsError::Corrupt(format!(
            "cache holds {} free bytes but group {} has {} used of {}",
            free, cache.start, used, cache.length
        )));
    }
    Ok(free)
}

/// Loads a group's persisted cache into its free-space index
///
/// Returns `false` when no usable cache exists; the caller then scans.
pub fn load_free_space_cache(fs: &FsContext, cache: &BlockGroupCache) -> bool {
    let key = cache_key(cache.start);
    let data = match fs.extent_root().lookup(&key) {
        Ok(Some(data)) => data,
        Ok(None) => return false,
        Err(e) => {
            warn!(start = cache.start, error = %e, "failed to read free space cache");
            return false;
        }
    };

    let loaded = FreeSpaceCache::from_bytes(&data).and_then(|item| {
        validate(fs, cache, &item)?;
        let mut ctl = cache.free_space_ctl();
        for &(start, len) in &item.entries {
            if let Err(e) = ctl.add_free_space(start, len) {
                ctl.take_all();
                return Err(e);
            }
        }
        Ok(item.entries.len())
    });

    match loaded {
        Ok(entries) => {
            debug!(start = cache.start, entries, "loaded free space cache");
            true
        }
        Err(e) => {
            warn!(start = cache.start, error = %e, "free space cache invalid, rebuilding");
            cache.lock_state().disk_cache = DiskCacheState::Error;
            false
        }
    }
}

/// Persists a group's free ranges for `generation`
///
/// Pins still held by the committing transaction count as free, since they
/// are released once the commit reaches disk. Groups that are not fully
/// cached, or whose ranges do not fit one item, get their stale cache
/// removed instead.
pub fn write_free_space_cache(fs: &FsContext, cache: &BlockGroupCache, generation: u64) -> Result<bool> {
    let key = cache_key(cache.start);
    let end = cache.start + cache.length;

    let payload = {
        let state = cache.lock_state();
        if state.cached != CacheState::Finished {
            None
        } else {
            let mut ranges: RangeTree = cache.free_space_ctl().ranges().clone();
            for (s, e) in fs.pinned.active_within(cache.start, end) {
                ranges.insert(s, e - s);
            }
            let item = FreeSpaceCache {
                generation,
                entries: ranges.iter().map(|(s, e)| (s, e - s)).collect(),
            };
            let balanced = ranges.total() + state.used + cache.bytes_super() == cache.length;
            (balanced && state.reserved == 0).then(|| item.to_bytes())
        }
    };

    let store = fs.extent_root();
    let existing = store.lookup(&key)?.is_some();
    match payload {
        Some(data) if data.len() <= store.max_item_size() => {
            if existing {
                store.replace(&key, data)?;
            } else {
                store.insert(key, data)?;
            }
            cache.lock_state().disk_cache = DiskCacheState::Written;
            Ok(true)
        }
        _ => {
            if existing {
                store.delete(&key)?;
            }
            cache.lock_state().disk_cache = DiskCacheState::Clear;
            debug!(start = cache.start, "free space cache not written");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_item_round_trip() {
        let item = FreeSpaceCache {
            generation: 7,
            entries: vec![(1 << 20, 4096), (2 << 20, 65536)],
        };
        let bytes = item.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 2 * ENTRY_SIZE + 4);
        assert_eq!(FreeSpaceCache::from_bytes(&bytes).unwrap(), item);
    }

    #[test]
    fn test_cache_item_crc_detects_damage() {
        let item = FreeSpaceCache {
            generation: 3,
            entries: vec![(0, 4096)],
        };
        let mut bytes = item.to_bytes();
        bytes[HEADER_SIZE] ^= 1;
        assert!(matches!(
            FreeSpaceCache::from_bytes(&bytes),
            Err(BtrfsError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_cache_item_count_mismatch() {
        let item = FreeSpaceCache {
            generation: 3,
            entries: vec![(0, 4096)],
        };
        let mut bytes = item.to_bytes();
        LittleEndian::write_u64(&mut bytes[8..16], 5);
        let body = bytes.len() - 4;
        let crc = checksum::crc32c(&bytes[..body]);
        LittleEndian::write_u32(&mut bytes[body..], crc);
        assert!(matches!(
            FreeSpaceCache::from_bytes(&bytes),
            Err(BtrfsError::Corrupt(_))
        ));
        assert!(FreeSpaceCache::from_bytes(&[0u8; 8]).is_err());
    }
}
