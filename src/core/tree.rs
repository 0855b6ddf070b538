//! Ordered key-value tree interface
//!
//! The extent code treats the on-disk B-trees as an abstract indexed store
//! keyed by `(objectid, type, offset)`. [`KeyValueTree`] is that seam and
//! [`MemTree`] is the in-memory implementation used by the engine and tests.

use super::{BtrfsError, Result};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Size of a key structure
pub const KEY_SIZE: usize = 0x11;

/// Default largest item payload a leaf can hold (16KiB node minus headers)
pub const DEFAULT_MAX_ITEM_SIZE: usize = 16384 - 0x65 - 0x19;

/// A BTRFS key used for B-tree lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BtrfsKey {
    /// Object ID
    pub objectid: u64,
    /// Item type
    pub item_type: u8,
    /// Offset (meaning depends on item type)
    pub offset: u64,
}

impl BtrfsKey {
    /// Creates a new key
    #[inline]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Parses a key from bytes
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < KEY_SIZE {
            return Err(BtrfsError::Corrupt("Key data too small".to_string()));
        }

        Ok(Self {
            objectid: LittleEndian::read_u64(&data[0..8]),
            item_type: data[8],
            offset: LittleEndian::read_u64(&data[9..17]),
        })
    }

    /// Serializes the key into its 17-byte disk form
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; KEY_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.objectid);
        buf[8] = self.item_type;
        LittleEndian::write_u64(&mut buf[9..17], self.offset);
        out.extend_from_slice(&buf);
    }

    /// Returns the minimum possible key
    #[inline]
    pub const fn min() -> Self {
        Self::new(0, 0, 0)
    }

    /// Returns the maximum possible key
    #[inline]
    pub const fn max() -> Self {
        Self::new(u64::MAX, u8::MAX, u64::MAX)
    }
}

/// Generic ordered key-value tree with copy-on-write semantics hidden
/// behind it
///
/// Implementations must be internally synchronized.
pub trait KeyValueTree: Send + Sync {
    /// Looks up an exact key
    fn lookup(&self, key: &BtrfsKey) -> Result<Option<Vec<u8>>>;

    /// Inserts a new item, failing if the key already exists
    fn insert(&self, key: BtrfsKey, data: Vec<u8>) -> Result<()>;

    /// Replaces the payload of an existing item (extend/truncate)
    fn replace(&self, key: &BtrfsKey, data: Vec<u8>) -> Result<()>;

    /// Deletes an existing item
    fn delete(&self, key: &BtrfsKey) -> Result<()>;

    /// Returns all items with `min <= key <= max`, in key order
    fn range(&self, min: &BtrfsKey, max: &BtrfsKey) -> Result<Vec<(BtrfsKey, Vec<u8>)>>;

    /// Returns the first item with key `>= from`
    fn next_item(&self, from: &BtrfsKey) -> Result<Option<(BtrfsKey, Vec<u8>)>>;

    /// Largest payload a single item may carry
    fn max_item_size(&self) -> usize;
}

/// In-memory [`KeyValueTree`]
pub struct MemTree {
    items: RwLock<BTreeMap<BtrfsKey, Vec<u8>>>,
    max_item_size: usize,
}

impl MemTree {
    /// Creates an empty tree with the default item size limit
    pub fn new() -> Self {
        Self::with_max_item_size(DEFAULT_MAX_ITEM_SIZE)
    }

    /// Creates an empty tree whose items may not exceed `max_item_size`
    pub fn with_max_item_size(max_item_size: usize) -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            max_item_size,
        }
    }

    /// Number of items in the tree
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Returns true if the tree holds no items
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn check_size(&self, key: &BtrfsKey, data: &[u8]) -> Result<()> {
        if data.len() > self.max_item_size {
            return Err(BtrfsError::Corrupt(format!(
                "Item {:?} of {} bytes exceeds leaf capacity {}",
                key,
                data.len(),
                self.max_item_size
            )));
        }
        Ok(())
    }
}

impl Default for MemTree {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueTree for MemTree {
    fn lookup(&self, key: &BtrfsKey) -> Result<Option<Vec<u8>>> {
        Ok(self.items.read().get(key).cloned())
    }

    fn insert(&self, key: BtrfsKey, data: Vec<u8>) -> Result<()> {
        self.check_size(&key, &data)?;
        let mut items = self.items.write();
        if items.contains_key(&key) {
            return Err(BtrfsError::Corrupt(format!("Item {:?} already exists", key)));
        }
        items.insert(key, data);
        Ok(())
    }

    fn replace(&self, key: &BtrfsKey, data: Vec<u8>) -> Result<()> {
        self.check_size(key, &data)?;
        match self.items.write().get_mut(key) {
            Some(slot) => {
                *slot = data;
                Ok(())
            }
            None => Err(BtrfsError::NotFound(format!("Item {:?}", key))),
        }
    }

    fn delete(&self, key: &BtrfsKey) -> Result<()> {
        match self.items.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(BtrfsError::NotFound(format!("Item {:?}", key))),
        }
    }

    fn range(&self, min: &BtrfsKey, max: &BtrfsKey) -> Result<Vec<(BtrfsKey, Vec<u8>)>> {
        if min > max {
            return Ok(Vec::new());
        }
        Ok(self
            .items
            .read()
            .range(*min..=*max)
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    fn next_item(&self, from: &BtrfsKey) -> Result<Option<(BtrfsKey, Vec<u8>)>> {
        Ok(self
            .items
            .read()
            .range(*from..)
            .next()
            .map(|(k, v)| (*k, v.clone())))
    }

    fn max_item_size(&self) -> usize {
        self.max_item_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btrfs_key_ordering() {
        let key1 = BtrfsKey::new(100, 0x01, 0);
        let key2 = BtrfsKey::new(100, 0x01, 1);
        let key3 = BtrfsKey::new(100, 0x02, 0);
        let key4 = BtrfsKey::new(200, 0x01, 0);

        assert!(key1 < key2);
        assert!(key2 < key3);
        assert!(key3 < key4);
        assert!(BtrfsKey::min() < BtrfsKey::max());
    }

    #[test]
    fn test_btrfs_key_bytes() {
        let key = BtrfsKey::new(256, 0xA8, 4096);
        let mut buf = Vec::new();
        key.write_to(&mut buf);
        assert_eq!(buf.len(), KEY_SIZE);
        assert_eq!(BtrfsKey::from_bytes(&buf).unwrap(), key);
        assert!(BtrfsKey::from_bytes(&buf[..10]).is_err());
    }

    #[test]
    fn test_mem_tree_insert_lookup_delete() {
        let tree = MemTree::new();
        let key = BtrfsKey::new(1, 2, 3);
        tree.insert(key, vec![1, 2, 3]).unwrap();
        assert!(tree.insert(key, vec![4]).is_err());
        assert_eq!(tree.lookup(&key).unwrap(), Some(vec![1, 2, 3]));

        tree.replace(&key, vec![9]).unwrap();
        assert_eq!(tree.lookup(&key).unwrap(), Some(vec![9]));

        tree.delete(&key).unwrap();
        assert!(tree.lookup(&key).unwrap().is_none());
        assert!(tree.delete(&key).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_mem_tree_range_and_next() {
        let tree = MemTree::new();
        for i in 0..10u64 {
            tree.insert(BtrfsKey::new(i * 10, 0xA8, 4), vec![]).unwrap();
        }
        let found = tree
            .range(&BtrfsKey::new(20, 0, 0), &BtrfsKey::new(50, u8::MAX, u64::MAX))
            .unwrap();
        assert_eq!(found.len(), 4);
        assert_eq!(found[0].0.objectid, 20);

        let next = tree.next_item(&BtrfsKey::new(21, 0, 0)).unwrap().unwrap();
        assert_eq!(next.0.objectid, 30);
        assert!(tree.next_item(&BtrfsKey::new(91, 0, 0)).unwrap().is_none());
    }

    #[test]
    fn test_mem_tree_item_size_limit() {
        let tree = MemTree::with_max_item_size(8);
        assert!(tree.insert(BtrfsKey::new(1, 1, 1), vec![0; 9]).is_err());
        tree.insert(BtrfsKey::new(1, 1, 1), vec![0; 8]).unwrap();
        assert!(tree.replace(&BtrfsKey::new(1, 1, 1), vec![0; 9]).is_err());
    }
}
