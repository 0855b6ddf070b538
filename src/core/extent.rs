//! On-disk extent tree items
//!
//! An extent item carries the reference count and flags of one allocated
//! range, optionally a [`TreeBlockInfo`], then a packed run of inline
//! backrefs. Backrefs that do not fit inline live in standalone items keyed
//! by `(bytenr, ref type, root/parent/hash)`.

use super::{checksum, item_type, objectid, tree::BtrfsKey, BtrfsError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the fixed extent item header (refs, generation, flags)
pub const EXTENT_ITEM_SIZE: usize = 24;

/// Size of a legacy v0 extent item (a bare 32-bit refcount)
pub const EXTENT_ITEM_V0_SIZE: usize = 4;

/// Size of the tree block info that follows a metadata extent item
pub const TREE_BLOCK_INFO_SIZE: usize = 18;

/// Size of an inline ref holding a type and a 64-bit offset
pub const INLINE_REF_SIZE: usize = 9;

/// Size of an `EXTENT_DATA_REF` payload (root, objectid, offset, count)
pub const EXTENT_DATA_REF_SIZE: usize = 28;

/// Size of a `SHARED_DATA_REF` payload (count)
pub const SHARED_DATA_REF_SIZE: usize = 4;

/// Size of a block group item
pub const BLOCK_GROUP_ITEM_SIZE: usize = 24;

/// Extent flags
pub mod extent_flags {
    pub const DATA: u64 = 1 << 0;
    pub const TREE_BLOCK: u64 = 1 << 1;
    pub const FULL_BACKREF: u64 = 1 << 8;
}

/// Who points at an extent
///
/// Tree blocks are referenced either by the owning root or, once shared
/// between snapshots, by the parent block. Data extents are referenced by
/// `(root, inode, file offset)` or by the parent leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackrefKind {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    ExtentData { root: u64, objectid: u64, offset: u64 },
    SharedData { parent: u64 },
}

impl BackrefKind {
    /// Builds the backref identity for a tree block
    pub fn tree(parent: u64, root: u64) -> Self {
        if parent > 0 {
            Self::SharedBlock { parent }
        } else {
            Self::TreeBlock { root }
        }
    }

    /// Builds the backref identity for a data extent
    pub fn data(parent: u64, root: u64, owner: u64, offset: u64) -> Self {
        if parent > 0 {
            Self::SharedData { parent }
        } else {
            Self::ExtentData {
                root,
                objectid: owner,
                offset,
            }
        }
    }

    /// The item type used for this backref
    pub const fn type_key(&self) -> u8 {
        match self {
            Self::TreeBlock { .. } => item_type::TREE_BLOCK_REF,
            Self::SharedBlock { .. } => item_type::SHARED_BLOCK_REF,
            Self::ExtentData { .. } => item_type::EXTENT_DATA_REF,
            Self::SharedData { .. } => item_type::SHARED_DATA_REF,
        }
    }

    /// True for tree block backrefs
    pub const fn is_tree(&self) -> bool {
        matches!(self, Self::TreeBlock { .. } | Self::SharedBlock { .. })
    }

    /// Offset used to order inline refs and key standalone items
    pub fn sort_offset(&self) -> u64 {
        match *self {
            Self::TreeBlock { root } => root,
            Self::SharedBlock { parent } | Self::SharedData { parent } => parent,
            Self::ExtentData {
                root,
                objectid,
                offset,
            } => checksum::hash_extent_data_ref(root, objectid, offset),
        }
    }

    /// Encoded size of this backref when stored inline
    pub const fn inline_size(&self) -> usize {
        match self {
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => INLINE_REF_SIZE,
            Self::ExtentData { .. } => 1 + EXTENT_DATA_REF_SIZE,
            Self::SharedData { .. } => INLINE_REF_SIZE + SHARED_DATA_REF_SIZE,
        }
    }
}

/// A backref stored inside the extent item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineRef {
    pub kind: BackrefKind,
    /// Reference count carried by this backref (always 1 for tree blocks)
    pub count: u32,
}

impl InlineRef {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind.type_key());
        match self.kind {
            BackrefKind::TreeBlock { root } => push_u64(out, root),
            BackrefKind::SharedBlock { parent } => push_u64(out, parent),
            BackrefKind::ExtentData {
                root,
                objectid,
                offset,
            } => {
                push_u64(out, root);
                push_u64(out, objectid);
                push_u64(out, offset);
                push_u32(out, self.count);
            }
            BackrefKind::SharedData { parent } => {
                push_u64(out, parent);
                push_u32(out, self.count);
            }
        }
    }

    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let need = |n: usize| -> Result<()> {
            if data.len() < n {
                Err(BtrfsError::Corrupt("Inline backref truncated".to_string()))
            } else {
                Ok(())
            }
        };
        need(1)?;
        match data[0] {
            item_type::TREE_BLOCK_REF | item_type::SHARED_BLOCK_REF => {
                need(INLINE_REF_SIZE)?;
                let off = LittleEndian::read_u64(&data[1..9]);
                let kind = if data[0] == item_type::TREE_BLOCK_REF {
                    BackrefKind::TreeBlock { root: off }
                } else {
                    BackrefKind::SharedBlock { parent: off }
                };
                Ok((Self { kind, count: 1 }, INLINE_REF_SIZE))
            }
            item_type::EXTENT_DATA_REF => {
                need(1 + EXTENT_DATA_REF_SIZE)?;
                let kind = BackrefKind::ExtentData {
                    root: LittleEndian::read_u64(&data[1..9]),
                    objectid: LittleEndian::read_u64(&data[9..17]),
                    offset: LittleEndian::read_u64(&data[17..25]),
                };
                let count = LittleEndian::read_u32(&data[25..29]);
                Ok((Self { kind, count }, 1 + EXTENT_DATA_REF_SIZE))
            }
            item_type::SHARED_DATA_REF => {
                need(INLINE_REF_SIZE + SHARED_DATA_REF_SIZE)?;
                let kind = BackrefKind::SharedData {
                    parent: LittleEndian::read_u64(&data[1..9]),
                };
                let count = LittleEndian::read_u32(&data[9..13]);
                Ok((Self { kind, count }, INLINE_REF_SIZE + SHARED_DATA_REF_SIZE))
            }
            other => Err(BtrfsError::Corrupt(format!(
                "Unknown inline backref type {:#x}",
                other
            ))),
        }
    }
}

/// Level and first key of a tree block, stored after its extent item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeBlockInfo {
    pub key: BtrfsKey,
    pub level: u8,
}

/// An extent item describing allocated space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentItem {
    /// Reference count
    pub refs: u64,
    /// Generation
    pub generation: u64,
    /// Flags
    pub flags: u64,
    /// Present for tree blocks
    pub tree_block: Option<TreeBlockInfo>,
    /// Inline backrefs, ordered by type then offset
    pub inline_refs: Vec<InlineRef>,
}

impl ExtentItem {
    /// Creates an item for a freshly allocated data extent
    pub fn new_data(generation: u64, backref: InlineRef) -> Self {
        Self {
            refs: backref.count as u64,
            generation,
            flags: extent_flags::DATA,
            tree_block: None,
            inline_refs: vec![backref],
        }
    }

    /// Creates an item for a freshly allocated tree block
    pub fn new_tree_block(generation: u64, flags: u64, info: TreeBlockInfo, kind: BackrefKind) -> Self {
        let mut flags = flags | extent_flags::TREE_BLOCK;
        if matches!(kind, BackrefKind::SharedBlock { .. }) {
            flags |= extent_flags::FULL_BACKREF;
        }
        Self {
            refs: 1,
            generation,
            flags,
            tree_block: Some(info),
            inline_refs: vec![InlineRef { kind, count: 1 }],
        }
    }

    /// Returns true if the payload is a legacy v0 item
    pub fn is_v0(data: &[u8]) -> bool {
        data.len() == EXTENT_ITEM_V0_SIZE
    }

    /// Upgrades a legacy v0 item
    ///
    /// The v0 format only carried a refcount; the tree-vs-data decision comes
    /// from the owner recorded by the caller.
    pub fn from_v0(data: &[u8], owner: u64, generation: u64) -> Result<Self> {
        if !Self::is_v0(data) {
            return Err(BtrfsError::Corrupt(format!(
                "v0 extent item has {} bytes",
                data.len()
            )));
        }
        let refs = LittleEndian::read_u32(data) as u64;
        let (flags, tree_block) = if owner < objectid::FIRST_FREE {
            (
                extent_flags::TREE_BLOCK | extent_flags::FULL_BACKREF,
                Some(TreeBlockInfo::default()),
            )
        } else {
            (extent_flags::DATA, None)
        };
        Ok(Self {
            refs,
            generation,
            flags,
            tree_block,
            inline_refs: Vec::new(),
        })
    }

    /// Parses an extent item from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < EXTENT_ITEM_SIZE {
            return Err(BtrfsError::Corrupt(format!(
                "ExtentItem too small: {} bytes",
                data.len()
            )));
        }

        let refs = LittleEndian::read_u64(&data[0..8]);
        let generation = LittleEndian::read_u64(&data[8..16]);
        let flags = LittleEndian::read_u64(&data[16..24]);
        let mut offset = EXTENT_ITEM_SIZE;

        let tree_block = if flags & extent_flags::TREE_BLOCK != 0 {
            if data.len() < offset + TREE_BLOCK_INFO_SIZE {
                return Err(BtrfsError::Corrupt("TreeBlockInfo truncated".to_string()));
            }
            let key = BtrfsKey::from_bytes(&data[offset..])?;
            let level = data[offset + 17];
            offset += TREE_BLOCK_INFO_SIZE;
            Some(TreeBlockInfo { key, level })
        } else {
            None
        };

        let mut inline_refs = Vec::new();
        while offset < data.len() {
            let (iref, used) = InlineRef::decode(&data[offset..])?;
            inline_refs.push(iref);
            offset += used;
        }

        Ok(Self {
            refs,
            generation,
            flags,
            tree_block,
            inline_refs,
        })
    }

    /// Serializes the item
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        push_u64(&mut out, self.refs);
        push_u64(&mut out, self.generation);
        push_u64(&mut out, self.flags);
        if let Some(info) = &self.tree_block {
            info.key.write_to(&mut out);
            out.push(info.level);
        }
        for iref in &self.inline_refs {
            iref.encode(&mut out);
        }
        out
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        let mut size = EXTENT_ITEM_SIZE;
        if self.tree_block.is_some() {
            size += TREE_BLOCK_INFO_SIZE;
        }
        size + self.inline_refs.iter().map(|r| r.kind.inline_size()).sum::<usize>()
    }

    /// Returns true for tree block extents
    pub fn is_tree_block(&self) -> bool {
        self.flags & extent_flags::TREE_BLOCK != 0
    }

    /// Finds an inline backref with this identity
    pub fn find_inline(&self, kind: &BackrefKind) -> Option<usize> {
        self.inline_refs.iter().position(|r| r.kind == *kind)
    }

    /// Position at which a new inline ref keeps the run sorted
    pub fn inline_insert_pos(&self, kind: &BackrefKind) -> usize {
        let wanted = (kind.type_key(), kind.sort_offset());
        self.inline_refs
            .iter()
            .position(|r| (r.kind.type_key(), r.kind.sort_offset()) > wanted)
            .unwrap_or(self.inline_refs.len())
    }
}

/// Payload of a standalone `EXTENT_DATA_REF` item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

impl ExtentDataRef {
    /// Parses the payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < EXTENT_DATA_REF_SIZE {
            return Err(BtrfsError::Corrupt("ExtentDataRef too small".to_string()));
        }
        Ok(Self {
            root: LittleEndian::read_u64(&data[0..8]),
            objectid: LittleEndian::read_u64(&data[8..16]),
            offset: LittleEndian::read_u64(&data[16..24]),
            count: LittleEndian::read_u32(&data[24..28]),
        })
    }

    /// Serializes the payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EXTENT_DATA_REF_SIZE);
        push_u64(&mut out, self.root);
        push_u64(&mut out, self.objectid);
        push_u64(&mut out, self.offset);
        push_u32(&mut out, self.count);
        out
    }

    /// True if this payload belongs to the given identity
    pub fn matches(&self, root: u64, objectid: u64, offset: u64) -> bool {
        self.root == root && self.objectid == objectid && self.offset == offset
    }
}

/// Reads the count of a standalone `SHARED_DATA_REF` item
pub fn shared_data_ref_count(data: &[u8]) -> Result<u32> {
    if data.len() < SHARED_DATA_REF_SIZE {
        return Err(BtrfsError::Corrupt("SharedDataRef too small".to_string()));
    }
    Ok(LittleEndian::read_u32(&data[0..4]))
}

/// Block group item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGroupItem {
    /// Used bytes in this block group
    pub used: u64,
    /// Chunk object ID
    pub chunk_objectid: u64,
    /// Flags
    pub flags: u64,
}

impl BlockGroupItem {
    /// Parses a block group item from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_GROUP_ITEM_SIZE {
            return Err(BtrfsError::Corrupt("BlockGroupItem too small".to_string()));
        }

        Ok(Self {
            used: LittleEndian::read_u64(&data[0..8]),
            chunk_objectid: LittleEndian::read_u64(&data[8..16]),
            flags: LittleEndian::read_u64(&data[16..24]),
        })
    }

    /// Serializes the item
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_GROUP_ITEM_SIZE);
        push_u64(&mut out, self.used);
        push_u64(&mut out, self.chunk_objectid);
        push_u64(&mut out, self.flags);
        out
    }
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
