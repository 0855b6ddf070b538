//! Extent items and their backrefs
//!
//! Every allocated extent has an item at `(bytenr, EXTENT_ITEM, num_bytes)`
//! holding its reference count and, while they fit, the backrefs naming its
//! referrers. Once the inline area would grow past a sixteenth of a leaf,
//! new backrefs become standalone items keyed under the same bytenr:
//!
//! | Backref         | Key offset                          | Payload        |
//! |-----------------|-------------------------------------|----------------|
//! | TREE_BLOCK_REF  | owning root                         | none           |
//! | SHARED_BLOCK_REF| parent block                        | none           |
//! | EXTENT_DATA_REF | hash of (root, inode, offset), +1 on collision | [`ExtentDataRef`] |
//! | SHARED_DATA_REF | parent leaf                         | u32 count      |
//!
//! Standalone items sort after the extent item and before any block group
//! item, so one forward probe tells whether an extent has any.

use super::{
    block_group,
    checksum::hash_extent_data_ref,
    delayed_ref::ExtentOp,
    extent::{BackrefKind, ExtentDataRef, ExtentItem, InlineRef, TreeBlockInfo, SHARED_DATA_REF_SIZE},
    extent::shared_data_ref_count,
    item_type,
    tree::{BtrfsKey, KeyValueTree},
    BtrfsError, FsContext, Result,
};
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

/// Key of an extent item
pub fn extent_key(bytenr: u64, num_bytes: u64) -> BtrfsKey {
    BtrfsKey::new(bytenr, item_type::EXTENT_ITEM, num_bytes)
}

/// Largest extent item that may still take inline backrefs
fn max_extent_item_size(store: &dyn KeyValueTree) -> usize {
    store.max_item_size() >> 4
}

/// Where an existing backref lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackrefLocation {
    /// Index into the extent item's inline refs
    Inline(usize),
    /// A standalone item and the count it carries
    Standalone { key: BtrfsKey, count: u32 },
}

/// Reads an extent item, upgrading a legacy v0 item on the way
///
/// `owner` decides whether a v0 item describes a tree block or data; v0
/// items carry nothing else.
fn read_extent_item(
    store: &dyn KeyValueTree,
    bytenr: u64,
    num_bytes: u64,
    owner: u64,
    transid: Option<u64>,
) -> Result<Option<ExtentItem>> {
    let key = extent_key(bytenr, num_bytes);
    let Some(data) = store.lookup(&key)? else {
        return Ok(None);
    };
    if !ExtentItem::is_v0(&data) {
        return ExtentItem::from_bytes(&data).map(Some);
    }

    let item = ExtentItem::from_v0(&data, owner, transid.unwrap_or(0))?;
    if let Some(transid) = transid {
        debug!(bytenr, transid, "upgrading v0 extent item");
        store.replace(&key, item.to_bytes())?;
    }
    Ok(Some(item))
}

fn missing_extent(bytenr: u64, num_bytes: u64) -> BtrfsError {
    BtrfsError::Corrupt(format!("extent item {}+{} not found", bytenr, num_bytes))
}

/// True if any standalone backref item exists for `bytenr`
fn has_standalone_refs(store: &dyn KeyValueTree, bytenr: u64) -> Result<bool> {
    let probe = BtrfsKey::new(bytenr, item_type::TREE_BLOCK_REF, 0);
    Ok(match store.next_item(&probe)? {
        Some((key, _)) => key.objectid == bytenr && key.item_type < item_type::BLOCK_GROUP_ITEM,
        None => false,
    })
}

/// Finds the standalone data ref for an identity by scanning up from its hash
fn lookup_extent_data_ref(
    store: &dyn KeyValueTree,
    bytenr: u64,
    root: u64,
    owner: u64,
    offset: u64,
) -> Result<Option<(BtrfsKey, ExtentDataRef)>> {
    let mut from = BtrfsKey::new(bytenr, item_type::EXTENT_DATA_REF, hash_extent_data_ref(root, owner, offset));
    while let Some((key, data)) = store.next_item(&from)? {
        if key.objectid != bytenr || key.item_type != item_type::EXTENT_DATA_REF {
            break;
        }
        let dref = ExtentDataRef::from_bytes(&data)?;
        if dref.matches(root, owner, offset) {
            return Ok(Some((key, dref)));
        }
        if key.offset == u64::MAX {
            break;
        }
        from = BtrfsKey::new(bytenr, item_type::EXTENT_DATA_REF, key.offset + 1);
    }
    Ok(None)
}

fn standalone_key(bytenr: u64, kind: &BackrefKind) -> BtrfsKey {
    BtrfsKey::new(bytenr, kind.type_key(), kind.sort_offset())
}

/// Locates an existing backref, inline first
pub fn lookup_extent_backref(
    store: &dyn KeyValueTree,
    item: &ExtentItem,
    bytenr: u64,
    kind: &BackrefKind,
) -> Result<Option<BackrefLocation>> {
    if let Some(idx) = item.find_inline(kind) {
        return Ok(Some(BackrefLocation::Inline(idx)));
    }

    match *kind {
        BackrefKind::ExtentData {
            root,
            objectid,
            offset,
        } => Ok(lookup_extent_data_ref(store, bytenr, root, objectid, offset)?
            .map(|(key, dref)| BackrefLocation::Standalone { key, count: dref.count })),
        BackrefKind::SharedData { .. } => {
            let key = standalone_key(bytenr, kind);
            match store.lookup(&key)? {
                Some(data) => Ok(Some(BackrefLocation::Standalone {
                    key,
                    count: shared_data_ref_count(&data)?,
                })),
                None => Ok(None),
            }
        }
        BackrefKind::TreeBlock { .. } | BackrefKind::SharedBlock { .. } => {
            let key = standalone_key(bytenr, kind);
            Ok(store
                .lookup(&key)?
                .map(|_| BackrefLocation::Standalone { key, count: 1 }))
        }
    }
}

fn insert_standalone_backref(store: &dyn KeyValueTree, bytenr: u64, kind: &BackrefKind, count: u32) -> Result<()> {
    match *kind {
        BackrefKind::ExtentData {
            root,
            objectid,
            offset,
        } => {
            let mut key = standalone_key(bytenr, kind);
            while store.lookup(&key)?.is_some() {
                key.offset = key.offset.wrapping_add(1);
            }
            let dref = ExtentDataRef {
                root,
                objectid,
                offset,
                count,
            };
            store.insert(key, dref.to_bytes())
        }
        BackrefKind::SharedData { .. } => {
            let mut payload = vec![0u8; SHARED_DATA_REF_SIZE];
            LittleEndian::write_u32(&mut payload, count);
            store.insert(standalone_key(bytenr, kind), payload)
        }
        BackrefKind::TreeBlock { .. } | BackrefKind::SharedBlock { .. } => {
            store.insert(standalone_key(bytenr, kind), Vec::new())
        }
    }
}

fn update_standalone_backref(
    store: &dyn KeyValueTree,
    key: &BtrfsKey,
    kind: &BackrefKind,
    count: u32,
) -> Result<()> {
    if count == 0 {
        return store.delete(key);
    }
    match *kind {
        BackrefKind::ExtentData {
            root,
            objectid,
            offset,
        } => {
            let dref = ExtentDataRef {
                root,
                objectid,
                offset,
                count,
            };
            store.replace(key, dref.to_bytes())
        }
        BackrefKind::SharedData { .. } => {
            let mut payload = vec![0u8; SHARED_DATA_REF_SIZE];
            LittleEndian::write_u32(&mut payload, count);
            store.replace(key, payload)
        }
        BackrefKind::TreeBlock { .. } | BackrefKind::SharedBlock { .. } => Err(BtrfsError::Corrupt(format!(
            "tree block backref {:?} cannot carry count {}",
            key, count
        ))),
    }
}

fn to_count(ref_mod: u64) -> Result<u32> {
    u32::try_from(ref_mod).map_err(|_| BtrfsError::Corrupt(format!("backref count {} overflows", ref_mod)))
}

fn apply_extent_op(item: &mut ExtentItem, op: &ExtentOp) {
    item.flags |= op.flags_to_set;
    if let (Some(key), Some(info)) = (op.key, item.tree_block.as_mut()) {
        info.key = key;
    }
}

/// Inserts the item for a reserved data extent along with its first backref
pub(crate) fn alloc_reserved_file_extent(
    fs: &FsContext,
    transid: u64,
    bytenr: u64,
    num_bytes: u64,
    kind: BackrefKind,
    flags: u64,
    count: u32,
) -> Result<()> {
    let mut item = ExtentItem::new_data(transid, InlineRef { kind, count });
    item.flags |= flags;
    fs.extent_root().insert(extent_key(bytenr, num_bytes), item.to_bytes())?;
    block_group::update_block_group(fs, bytenr, num_bytes, true)?;
    trace!(bytenr, num_bytes, "inserted file extent");
    Ok(())
}

/// Inserts the item for a reserved tree block along with its first backref
#[allow(clippy::too_many_arguments)]
pub(crate) fn alloc_reserved_tree_block(
    fs: &FsContext,
    transid: u64,
    bytenr: u64,
    num_bytes: u64,
    kind: BackrefKind,
    flags: u64,
    key: BtrfsKey,
    level: u8,
) -> Result<()> {
    let item = ExtentItem::new_tree_block(transid, flags, TreeBlockInfo { key, level }, kind);
    fs.extent_root().insert(extent_key(bytenr, num_bytes), item.to_bytes())?;
    block_group::update_block_group(fs, bytenr, num_bytes, true)?;
    trace!(bytenr, level, "inserted tree block");
    Ok(())
}

/// Adds `ref_mod` references from `kind` to an existing extent
#[allow(clippy::too_many_arguments)]
pub(crate) fn inc_extent_ref(
    fs: &FsContext,
    transid: u64,
    bytenr: u64,
    num_bytes: u64,
    kind: BackrefKind,
    owner: u64,
    ref_mod: u64,
    extent_op: Option<&ExtentOp>,
) -> Result<()> {
    let store: &dyn KeyValueTree = fs.extent_root().as_ref();
    let key = extent_key(bytenr, num_bytes);
    let mut item =
        read_extent_item(store, bytenr, num_bytes, owner, Some(transid))?.ok_or_else(|| missing_extent(bytenr, num_bytes))?;
    let count = to_count(ref_mod)?;

    item.refs += ref_mod;
    if let Some(op) = extent_op {
        apply_extent_op(&mut item, op);
    }

    match lookup_extent_backref(store, &item, bytenr, &kind)? {
        Some(_) if kind.is_tree() => {
            return Err(BtrfsError::Corrupt(format!(
                "tree block {} already has backref {:?}",
                bytenr, kind
            )));
        }
        Some(BackrefLocation::Inline(idx)) => {
            let iref = &mut item.inline_refs[idx];
            iref.count = iref.count.checked_add(count).ok_or_else(|| {
                BtrfsError::Corrupt(format!("backref count overflow on {}", bytenr))
            })?;
        }
        Some(BackrefLocation::Standalone { key: ref_key, count: old }) => {
            update_standalone_backref(store, &ref_key, &kind, old.saturating_add(count))?;
        }
        None => {
            let fits = item.encoded_size() + kind.inline_size() < max_extent_item_size(store);
            if fits && !has_standalone_refs(store, bytenr)? {
                let pos = item.inline_insert_pos(&kind);
                item.inline_refs.insert(pos, InlineRef { kind, count });
            } else {
                insert_standalone_backref(store, bytenr, &kind, count)?;
            }
        }
    }

    store.replace(&key, item.to_bytes())
}

/// Drops `ref_mod` references from `kind`, freeing the extent at zero
///
/// The freed range is pinned until the transaction commits.
#[allow(clippy::too_many_arguments)]
pub(crate) fn free_extent(
    fs: &FsContext,
    transid: u64,
    bytenr: u64,
    num_bytes: u64,
    kind: BackrefKind,
    owner: u64,
    ref_mod: u64,
    extent_op: Option<&ExtentOp>,
) -> Result<()> {
    let store: &dyn KeyValueTree = fs.extent_root().as_ref();
    let key = extent_key(bytenr, num_bytes);
    let mut item =
        read_extent_item(store, bytenr, num_bytes, owner, Some(transid))?.ok_or_else(|| missing_extent(bytenr, num_bytes))?;
    let count = to_count(ref_mod)?;

    let location = lookup_extent_backref(store, &item, bytenr, &kind)?.ok_or_else(|| {
        BtrfsError::Corrupt(format!("extent {} has no backref {:?}", bytenr, kind))
    })?;
    if item.refs < ref_mod {
        return Err(BtrfsError::Corrupt(format!(
            "dropping {} refs from extent {} holding {}",
            ref_mod, bytenr, item.refs
        )));
    }

    match location {
        BackrefLocation::Inline(idx) => {
            let iref = &mut item.inline_refs[idx];
            if iref.count < count {
                return Err(BtrfsError::Corrupt(format!(
                    "backref {:?} of {} holds {} refs, dropping {}",
                    kind, bytenr, iref.count, count
                )));
            }
            iref.count -= count;
            if iref.count == 0 {
                item.inline_refs.remove(idx);
            }
        }
        BackrefLocation::Standalone { key: ref_key, count: old } => {
            if old < count {
                return Err(BtrfsError::Corrupt(format!(
                    "backref {:?} of {} holds {} refs, dropping {}",
                    kind, bytenr, old, count
                )));
            }
            update_standalone_backref(store, &ref_key, &kind, old - count)?;
        }
    }

    item.refs -= ref_mod;
    if item.refs > 0 {
        if let Some(op) = extent_op {
            apply_extent_op(&mut item, op);
        }
        return store.replace(&key, item.to_bytes());
    }

    if !item.inline_refs.is_empty() {
        return Err(BtrfsError::Corrupt(format!(
            "extent {} reached zero refs with {} inline backrefs left",
            bytenr,
            item.inline_refs.len()
        )));
    }
    store.delete(&key)?;
    if !item.is_tree_block() {
        fs.hooks().delete_csums(fs, bytenr, num_bytes)?;
    }
    block_group::update_block_group(fs, bytenr, num_bytes, false)?;
    debug!(bytenr, num_bytes, "freed extent");
    Ok(())
}

/// Applies a flags/key update to an existing extent item
pub(crate) fn run_delayed_extent_op(
    fs: &FsContext,
    transid: u64,
    bytenr: u64,
    num_bytes: u64,
    op: &ExtentOp,
) -> Result<()> {
    let store: &dyn KeyValueTree = fs.extent_root().as_ref();
    let mut item = read_extent_item(store, bytenr, num_bytes, 0, Some(transid))?
        .ok_or_else(|| missing_extent(bytenr, num_bytes))?;
    apply_extent_op(&mut item, op);
    store.replace(&extent_key(bytenr, num_bytes), item.to_bytes())
}

/// Reference count and flags of an extent, including queued changes
///
/// Waits for any processor currently applying the extent's delayed refs so
/// the on-disk item and the pending head are read as one state. Unknown
/// extents report `(0, 0)`.
pub fn lookup_extent_info(fs: &FsContext, bytenr: u64, num_bytes: u64) -> Result<(u64, u64)> {
    let store: &dyn KeyValueTree = fs.extent_root().as_ref();
    fs.delayed_refs.with_idle_head(bytenr, |head| -> Result<(u64, u64)> {
        let (mut refs, mut flags) = match read_extent_item(store, bytenr, num_bytes, 0, None)? {
            Some(item) => (item.refs as i64, item.flags),
            None => (0, 0),
        };
        if let Some(head) = head {
            refs += head.ref_mod;
            if let Some(op) = &head.extent_op {
                flags |= op.flags_to_set;
            }
        }
        if refs < 0 {
            return Err(BtrfsError::Corrupt(format!(
                "extent {} has negative pending refs {}",
                bytenr, refs
            )));
        }
        Ok((refs as u64, flags))
    })
}

/// Every backref of an extent, inline and standalone, with its count
pub fn extent_backrefs(fs: &FsContext, bytenr: u64, num_bytes: u64) -> Result<Vec<InlineRef>> {
    let store: &dyn KeyValueTree = fs.extent_root().as_ref();
    let item = read_extent_item(store, bytenr, num_bytes, 0, None)?.ok_or_else(|| missing_extent(bytenr, num_bytes))?;
    let mut refs = item.inline_refs;

    let min = BtrfsKey::new(bytenr, item_type::TREE_BLOCK_REF, 0);
    let max = BtrfsKey::new(bytenr, item_type::BLOCK_GROUP_ITEM - 1, u64::MAX);
    for (key, data) in store.range(&min, &max)? {
        let iref = match key.item_type {
            item_type::TREE_BLOCK_REF => InlineRef {
                kind: BackrefKind::TreeBlock { root: key.offset },
                count: 1,
            },
            item_type::SHARED_BLOCK_REF => InlineRef {
                kind: BackrefKind::SharedBlock { parent: key.offset },
                count: 1,
            },
            item_type::EXTENT_DATA_REF => {
                let dref = ExtentDataRef::from_bytes(&data)?;
                InlineRef {
                    kind: BackrefKind::ExtentData {
                        root: dref.root,
                        objectid: dref.objectid,
                        offset: dref.offset,
                    },
                    count: dref.count,
                }
            }
            item_type::SHARED_DATA_REF => InlineRef {
                kind: BackrefKind::SharedData { parent: key.offset },
                count: shared_data_ref_count(&data)?,
            },
            _ => continue,
        };
        refs.push(iref);
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tree::MemTree;

    fn data_kind(owner: u64) -> BackrefKind {
        BackrefKind::data(0, 5, owner, 0)
    }

    #[test]
    fn test_standalone_data_ref_hash_collision() {
        let store = MemTree::new();
        let bytenr = 1 << 20;
        let a = data_kind(257);
        let b = data_kind(258);
        insert_standalone_backref(&store, bytenr, &a, 2).unwrap();

        // occupy b's hash slot with a stranger so b has to probe
        let squatter = ExtentDataRef {
            root: 9,
            objectid: 9,
            offset: 9,
            count: 1,
        };
        let b_slot = standalone_key(bytenr, &b);
        store.insert(b_slot, squatter.to_bytes()).unwrap();
        insert_standalone_backref(&store, bytenr, &b, 3).unwrap();

        let (key, dref) = lookup_extent_data_ref(&store, bytenr, 5, 258, 0).unwrap().unwrap();
        assert_eq!(key.offset, b_slot.offset.wrapping_add(1));
        assert_eq!(dref.count, 3);
        let (_, dref) = lookup_extent_data_ref(&store, bytenr, 5, 257, 0).unwrap().unwrap();
        assert_eq!(dref.count, 2);
        assert!(lookup_extent_data_ref(&store, bytenr, 5, 300, 0).unwrap().is_none());
    }

    #[test]
    fn test_has_standalone_refs_stays_within_extent() {
        let store = MemTree::new();
        store
            .insert(BtrfsKey::new(8192, item_type::TREE_BLOCK_REF, 5), Vec::new())
            .unwrap();
        store
            .insert(BtrfsKey::new(4096, item_type::BLOCK_GROUP_ITEM, 4096), Vec::new())
            .unwrap();
        assert!(!has_standalone_refs(&store, 4096).unwrap());
        assert!(has_standalone_refs(&store, 8192).unwrap());
    }

    #[test]
    fn test_v0_item_upgraded_on_write() {
        let store = MemTree::new();
        let mut v0 = vec![0u8; 4];
        LittleEndian::write_u32(&mut v0, 3);
        store.insert(extent_key(4096, 4096), v0).unwrap();

        let read_only = read_extent_item(&store, 4096, 4096, 300, None).unwrap().unwrap();
        assert_eq!(read_only.refs, 3);
        assert_eq!(store.lookup(&extent_key(4096, 4096)).unwrap().unwrap().len(), 4);

        let upgraded = read_extent_item(&store, 4096, 4096, 300, Some(7)).unwrap().unwrap();
        assert!(!upgraded.is_tree_block());
        assert_eq!(upgraded.generation, 7);
        let stored = store.lookup(&extent_key(4096, 4096)).unwrap().unwrap();
        assert_eq!(ExtentItem::from_bytes(&stored).unwrap(), upgraded);
    }

    #[test]
    fn test_lookup_prefers_inline() {
        let store = MemTree::new();
        let kind = data_kind(257);
        let item = ExtentItem::new_data(1, InlineRef { kind, count: 1 });
        assert_eq!(
            lookup_extent_backref(&store, &item, 4096, &kind).unwrap(),
            Some(BackrefLocation::Inline(0))
        );

        let tree = BackrefKind::TreeBlock { root: 2 };
        assert_eq!(lookup_extent_backref(&store, &item, 4096, &tree).unwrap(), None);
        insert_standalone_backref(&store, 4096, &tree, 1).unwrap();
        assert!(matches!(
            lookup_extent_backref(&store, &item, 4096, &tree).unwrap(),
            Some(BackrefLocation::Standalone { count: 1, .. })
        ));
    }
}
