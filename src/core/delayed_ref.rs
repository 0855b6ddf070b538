//! Delayed reference updates
//!
//! Reference count changes are queued here instead of touching the extent
//! tree immediately. All pending work for one extent hangs off a head node;
//! opposite updates to the same backref cancel out before they ever reach
//! disk. Heads are processed one at a time: whoever claims a head applies
//! every ref queued under it and then the head itself.
//!
//! Nodes live in one ordered map. For each bytenr the head sorts first,
//! followed by its refs ordered by backref type, identity and sequence.

use super::{
    backref, extent::BackrefKind, objectid, pinned, tree::BtrfsKey, transaction::TransHandle,
    BtrfsError, FsContext, Result,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// What a queued update does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    /// Add a reference
    Add,
    /// Drop a reference
    Drop,
    /// Add the first reference of a freshly reserved extent, inserting its
    /// extent item
    AddExtent,
    /// Only update flags or key of the extent item
    UpdateHead,
}

impl RefAction {
    fn count_mod(self) -> i64 {
        match self {
            Self::Add | Self::AddExtent => 1,
            Self::Drop => -1,
            Self::UpdateHead => 0,
        }
    }
}

/// A pending change to an extent item's flags or tree-block key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentOp {
    /// Flags to OR into the item
    pub flags_to_set: u64,
    /// New first key for a tree block
    pub key: Option<BtrfsKey>,
}

impl ExtentOp {
    pub fn flags(flags_to_set: u64) -> Self {
        Self {
            flags_to_set,
            key: None,
        }
    }

    fn merge(&mut self, other: ExtentOp) {
        if other.key.is_some() {
            self.key = other.key;
        }
        self.flags_to_set |= other.flags_to_set;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Head,
    Ref {
        type_key: u8,
        first: u64,
        second: u64,
        third: u64,
        seq: u64,
    },
}

/// Map key: bytenr, then head before refs, then type, identity and seq
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedRefKey {
    bytenr: u64,
    slot: Slot,
}

impl DelayedRefKey {
    fn head(bytenr: u64) -> Self {
        Self {
            bytenr,
            slot: Slot::Head,
        }
    }

    fn for_ref(bytenr: u64, kind: &BackrefKind, seq: u64) -> Self {
        let (first, second, third) = match *kind {
            BackrefKind::TreeBlock { root } => (root, 0, 0),
            BackrefKind::SharedBlock { parent } | BackrefKind::SharedData { parent } => (parent, 0, 0),
            BackrefKind::ExtentData {
                root,
                objectid,
                offset,
            } => (root, objectid, offset),
        };
        Self {
            bytenr,
            slot: Slot::Ref {
                type_key: kind.type_key(),
                first,
                second,
                third,
                seq,
            },
        }
    }

    fn with_seq(mut self, new_seq: u64) -> Self {
        if let Slot::Ref { ref mut seq, .. } = self.slot {
            *seq = new_seq;
        }
        self
    }

    fn is_head(&self) -> bool {
        self.slot == Slot::Head
    }
}

/// A queued backref update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedRefNode {
    pub bytenr: u64,
    pub num_bytes: u64,
    /// Number of references added or dropped, always positive
    pub ref_mod: u64,
    pub action: RefAction,
    pub kind: BackrefKind,
    /// Root the reference is accounted to
    pub ref_root: u64,
    /// Tree level for tree blocks, inode number for data
    pub owner: u64,
    /// File offset for data, 0 for tree blocks
    pub offset: u64,
    /// Ordering against registered readers; 0 is never deferred
    pub seq: u64,
}

/// Per-extent aggregate of queued updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedRefHead {
    pub bytenr: u64,
    pub num_bytes: u64,
    /// Net count change of everything queued so far
    pub ref_mod: i64,
    /// The first ref must also insert the extent item
    pub must_insert_reserved: bool,
    pub is_data: bool,
    pub extent_op: Option<ExtentOp>,
    processing: bool,
}

#[derive(Debug, Clone)]
enum DelayedNode {
    Head(DelayedRefHead),
    Ref(DelayedRefNode),
}

#[derive(Debug, Default)]
struct DelayedRefs {
    tree: BTreeMap<DelayedRefKey, DelayedNode>,
    /// Heads plus refs
    num_entries: usize,
    num_heads: usize,
    num_heads_ready: usize,
    seq: u64,
    /// Registered reader sequences and how many readers hold each
    readers: BTreeMap<u64, usize>,
    run_delayed_start: u64,
    /// Bumped on every change a waiter might care about
    events: u64,
}

impl DelayedRefs {
    fn oldest_reader(&self) -> Option<u64> {
        self.readers.keys().next().copied()
    }

    fn head_mut(&mut self, bytenr: u64) -> Option<&mut DelayedRefHead> {
        match self.tree.get_mut(&DelayedRefKey::head(bytenr)) {
            Some(DelayedNode::Head(head)) => Some(head),
            _ => None,
        }
    }

    fn add_head(
        &mut self,
        updates: &AtomicU64,
        bytenr: u64,
        num_bytes: u64,
        action: RefAction,
        is_data: bool,
        extent_op: Option<ExtentOp>,
    ) {
        let must_insert = action == RefAction::AddExtent;
        if let Some(head) = self.head_mut(bytenr) {
            if must_insert {
                head.must_insert_reserved = true;
                head.num_bytes = num_bytes;
            }
            if let Some(op) = extent_op {
                match head.extent_op.as_mut() {
                    Some(existing) => existing.merge(op),
                    None => head.extent_op = Some(op),
                }
            }
            head.ref_mod += action.count_mod();
            return;
        }

        self.tree.insert(
            DelayedRefKey::head(bytenr),
            DelayedNode::Head(DelayedRefHead {
                bytenr,
                num_bytes,
                ref_mod: action.count_mod(),
                must_insert_reserved: must_insert,
                is_data,
                extent_op,
                processing: false,
            }),
        );
        self.num_heads += 1;
        self.num_heads_ready += 1;
        self.num_entries += 1;
        updates.fetch_add(1, Ordering::Relaxed);
    }

    fn add_ref(&mut self, updates: &AtomicU64, node: DelayedRefNode) -> Result<()> {
        let key = DelayedRefKey::for_ref(node.bytenr, &node.kind, node.seq);
        let lo = key.with_seq(0);
        let hi = key.with_seq(u64::MAX);

        let latest = self
            .tree
            .range(lo..=hi)
            .next_back()
            .map(|(k, n)| (*k, n.clone()));
        if let Some((existing_key, DelayedNode::Ref(existing))) = latest {
            // a reader registered between the two updates must see them apart
            let separated = existing.seq < node.seq
                && self.readers.range(existing.seq + 1..=node.seq).next().is_some();
            if !separated {
                self.merge_ref(updates, existing_key, existing, &node)?;
                return Ok(());
            }
        }

        if self.tree.insert(key, DelayedNode::Ref(node)).is_some() {
            return Err(BtrfsError::Corrupt("duplicate delayed ref".to_string()));
        }
        self.num_entries += 1;
        updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn merge_ref(
        &mut self,
        updates: &AtomicU64,
        key: DelayedRefKey,
        mut existing: DelayedRefNode,
        update: &DelayedRefNode,
    ) -> Result<()> {
        if existing.action == update.action {
            existing.ref_mod += update.ref_mod;
        } else if existing.ref_mod > update.ref_mod {
            existing.ref_mod -= update.ref_mod;
        } else if existing.ref_mod == update.ref_mod {
            self.tree.remove(&key);
            self.num_entries -= 1;
            let _ = updates.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
            return Ok(());
        } else {
            existing.ref_mod = update.ref_mod - existing.ref_mod;
            existing.action = update.action;
        }
        if existing.kind.is_tree() && existing.ref_mod > 1 {
            warn!(
                bytenr = existing.bytenr,
                ref_mod = existing.ref_mod,
                "tree block ref queued more than once"
            );
        }
        self.tree.insert(key, DelayedNode::Ref(existing));
        Ok(())
    }

    /// Claims up to `max` idle heads, scanning forward from the last cluster
    fn find_ref_cluster(&mut self, max: usize) -> Vec<u64> {
        let mut picked = Vec::new();
        let start = self.run_delayed_start;
        let passes = [(start, u64::MAX), (0, start)];

        'outer: for (from, to) in passes {
            let heads: Vec<u64> = self
                .tree
                .range(DelayedRefKey::head(from)..)
                .filter_map(|(k, n)| match n {
                    DelayedNode::Head(h) if k.bytenr < to && !h.processing => Some(k.bytenr),
                    _ => None,
                })
                .take(max - picked.len())
                .collect();
            for bytenr in heads {
                if let Some(head) = self.head_mut(bytenr) {
                    head.processing = true;
                    picked.push(bytenr);
                }
                if picked.len() >= max {
                    break 'outer;
                }
            }
            if from == 0 {
                break;
            }
        }

        self.num_heads_ready -= picked.len().min(self.num_heads_ready);
        self.run_delayed_start = picked.last().map_or(0, |b| b + 1);
        picked
    }

    /// Ref of a head to run next: adds before drops, nearest first
    fn select_delayed_ref(&self, bytenr: u64) -> Option<DelayedRefKey> {
        let refs = || {
            self.tree
                .range(DelayedRefKey::head(bytenr)..)
                .skip(1)
                .take_while(move |(k, _)| k.bytenr == bytenr)
        };
        for action in [RefAction::Add, RefAction::Drop] {
            let found = refs().find_map(|(k, n)| match n {
                DelayedNode::Ref(r) if r.action == action => Some(*k),
                _ => None,
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Hands a claimed head back without counting it as progress
    ///
    /// A head deferred for a reader only becomes runnable once that reader
    /// unregisters, which bumps `events` itself.
    fn release_head(&mut self, bytenr: u64) {
        if let Some(head) = self.head_mut(bytenr) {
            if head.processing {
                head.processing = false;
                self.num_heads_ready += 1;
            }
        }
    }

    fn next_step(&mut self, bytenr: u64) -> Step {
        let Some(selected) = self.select_delayed_ref(bytenr) else {
            return match self.tree.remove(&DelayedRefKey::head(bytenr)) {
                Some(DelayedNode::Head(head)) => {
                    self.num_heads -= 1;
                    self.num_entries -= 1;
                    self.events += 1;
                    Step::Head(head)
                }
                _ => Step::Gone,
            };
        };

        let seq = match self.tree.get(&selected) {
            Some(DelayedNode::Ref(r)) => r.seq,
            _ => 0,
        };
        if seq != 0 && self.oldest_reader().is_some_and(|r| seq >= r) {
            self.release_head(bytenr);
            return Step::Blocked;
        }

        let (extent_op, insert_reserved) = match self.head_mut(bytenr) {
            Some(head) => (
                head.extent_op.take(),
                std::mem::take(&mut head.must_insert_reserved),
            ),
            None => (None, false),
        };
        match self.tree.remove(&selected) {
            Some(DelayedNode::Ref(node)) => {
                self.num_entries -= 1;
                Step::Ref {
                    node,
                    extent_op,
                    insert_reserved,
                }
            }
            _ => Step::Gone,
        }
    }
}

enum Step {
    Ref {
        node: DelayedRefNode,
        extent_op: Option<ExtentOp>,
        insert_reserved: bool,
    },
    Head(DelayedRefHead),
    Blocked,
    Gone,
}

/// Registration of a reader that must not see refs queued after it
///
/// Dropping the guard unregisters the reader and wakes deferred processing.
pub struct SeqGuard<'a> {
    root: &'a DelayedRefRoot,
    seq: u64,
}

impl SeqGuard<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for SeqGuard<'_> {
    fn drop(&mut self) {
        let mut refs = self.root.inner.lock();
        if let Some(count) = refs.readers.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                refs.readers.remove(&self.seq);
            }
        }
        refs.events += 1;
        drop(refs);
        self.root.changed.notify_all();
    }
}

/// The queue of pending reference updates
#[derive(Default)]
pub struct DelayedRefRoot {
    inner: Mutex<DelayedRefs>,
    changed: Condvar,
}

/// Whether refs to `root` need ordering against readers
fn need_ref_seq(for_cow: bool, ref_root: u64) -> bool {
    !for_cow && (ref_root == objectid::FS_TREE || ref_root >= objectid::FIRST_FREE)
}

impl DelayedRefRoot {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    fn add(
        &self,
        updates: &AtomicU64,
        bytenr: u64,
        num_bytes: u64,
        kind: BackrefKind,
        ref_root: u64,
        owner: u64,
        offset: u64,
        action: RefAction,
        extent_op: Option<ExtentOp>,
        for_cow: bool,
    ) -> Result<()> {
        if action == RefAction::UpdateHead {
            return Err(BtrfsError::Corrupt("update head queued as a ref".to_string()));
        }
        let mut refs = self.inner.lock();
        let seq = if need_ref_seq(for_cow, ref_root) {
            refs.seq += 1;
            refs.seq
        } else {
            0
        };
        refs.add_head(updates, bytenr, num_bytes, action, !kind.is_tree(), extent_op);
        let node = DelayedRefNode {
            bytenr,
            num_bytes,
            ref_mod: 1,
            action: if action == RefAction::AddExtent {
                RefAction::Add
            } else {
                action
            },
            kind,
            ref_root,
            owner,
            offset,
            seq,
        };
        refs.add_ref(updates, node)?;
        refs.events += 1;
        drop(refs);
        self.changed.notify_all();
        Ok(())
    }

    /// Queues a tree-block reference change
    #[allow(clippy::too_many_arguments)]
    pub fn add_tree_ref(
        &self,
        updates: &AtomicU64,
        bytenr: u64,
        num_bytes: u64,
        parent: u64,
        ref_root: u64,
        level: u8,
        action: RefAction,
        extent_op: Option<ExtentOp>,
        for_cow: bool,
    ) -> Result<()> {
        let kind = BackrefKind::tree(parent, ref_root);
        self.add(
            updates, bytenr, num_bytes, kind, ref_root, level as u64, 0, action, extent_op, for_cow,
        )
    }

    /// Queues a data reference change
    #[allow(clippy::too_many_arguments)]
    pub fn add_data_ref(
        &self,
        updates: &AtomicU64,
        bytenr: u64,
        num_bytes: u64,
        parent: u64,
        ref_root: u64,
        owner: u64,
        offset: u64,
        action: RefAction,
        extent_op: Option<ExtentOp>,
        for_cow: bool,
    ) -> Result<()> {
        let kind = BackrefKind::data(parent, ref_root, owner, offset);
        self.add(
            updates, bytenr, num_bytes, kind, ref_root, owner, offset, action, extent_op, for_cow,
        )
    }

    /// Queues a flags/key update without changing the reference count
    pub fn add_extent_op(
        &self,
        updates: &AtomicU64,
        bytenr: u64,
        num_bytes: u64,
        extent_op: ExtentOp,
        is_data: bool,
    ) {
        let mut refs = self.inner.lock();
        refs.add_head(updates, bytenr, num_bytes, RefAction::UpdateHead, is_data, Some(extent_op));
        refs.events += 1;
    }

    /// Registers a reader at the current sequence
    pub fn register_reader(&self) -> SeqGuard<'_> {
        let mut refs = self.inner.lock();
        refs.seq += 1;
        let seq = refs.seq;
        *refs.readers.entry(seq).or_default() += 1;
        SeqGuard { root: self, seq }
    }

    /// Heads plus refs queued
    pub fn num_entries(&self) -> usize {
        self.inner.lock().num_entries
    }

    pub fn num_heads(&self) -> usize {
        self.inner.lock().num_heads
    }

    /// Heads not claimed by a processor
    pub fn num_heads_ready(&self) -> usize {
        self.inner.lock().num_heads_ready
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tree.is_empty()
    }

    /// Refs (not counting the head) queued for one extent
    pub fn num_refs_for(&self, bytenr: u64) -> usize {
        self.inner
            .lock()
            .tree
            .range(DelayedRefKey::head(bytenr)..)
            .take_while(|(k, _)| k.bytenr == bytenr)
            .filter(|(k, _)| !k.is_head())
            .count()
    }

    /// Copy of the queued refs for one extent, in processing order
    pub fn refs_for(&self, bytenr: u64) -> Vec<DelayedRefNode> {
        self.inner
            .lock()
            .tree
            .range(DelayedRefKey::head(bytenr)..)
            .take_while(|(k, _)| k.bytenr == bytenr)
            .filter_map(|(_, n)| match n {
                DelayedNode::Ref(r) => Some(r.clone()),
                DelayedNode::Head(_) => None,
            })
            .collect()
    }

    /// Copy of an extent's head
    pub fn find_head(&self, bytenr: u64) -> Option<DelayedRefHead> {
        self.inner.lock().head_mut(bytenr).map(|h| h.clone())
    }

    /// Runs `f` while the head for `bytenr`, if any, is idle and cannot be
    /// claimed
    pub(crate) fn with_idle_head<T>(&self, bytenr: u64, f: impl FnOnce(Option<&DelayedRefHead>) -> T) -> T {
        let mut refs = self.inner.lock();
        while refs.head_mut(bytenr).is_some_and(|h| h.processing) {
            self.changed.wait(&mut refs);
        }
        let head = refs.head_mut(bytenr).map(|h| &*h);
        f(head)
    }

    /// Drops a head whose refs all cancelled
    ///
    /// Returns true when the extent was never inserted, in which case its
    /// reservation belongs to the caller again.
    pub fn check_ref_cleanup(&self, bytenr: u64) -> bool {
        let mut refs = self.inner.lock();
        if refs.num_refs_left(bytenr) > 0 {
            return false;
        }
        let Some(head) = refs.head_mut(bytenr) else {
            return false;
        };
        if head.processing || (head.extent_op.is_some() && !head.must_insert_reserved) {
            return false;
        }
        let must_insert = head.must_insert_reserved;
        refs.tree.remove(&DelayedRefKey::head(bytenr));
        refs.num_heads -= 1;
        refs.num_heads_ready = refs.num_heads_ready.saturating_sub(1);
        refs.num_entries -= 1;
        refs.events += 1;
        drop(refs);
        self.changed.notify_all();
        must_insert
    }

    fn claim_cluster(&self, max: usize) -> (Vec<u64>, u64) {
        let mut refs = self.inner.lock();
        let cluster = refs.find_ref_cluster(max);
        (cluster, refs.events)
    }

    fn step(&self, bytenr: u64) -> Step {
        let step = self.inner.lock().next_step(bytenr);
        if matches!(step, Step::Blocked | Step::Head(_)) {
            self.changed.notify_all();
        }
        step
    }

    fn release(&self, heads: &[u64]) {
        let mut refs = self.inner.lock();
        for &bytenr in heads {
            refs.release_head(bytenr);
        }
        refs.events += 1;
        drop(refs);
        self.changed.notify_all();
    }

    /// Blocks until something changed since `since`
    fn wait_for_change(&self, since: u64) {
        let mut refs = self.inner.lock();
        while refs.events == since && !refs.tree.is_empty() {
            self.changed.wait(&mut refs);
        }
    }
}

impl DelayedRefs {
    fn num_refs_left(&self, bytenr: u64) -> usize {
        self.tree
            .range(DelayedRefKey::head(bytenr)..)
            .take_while(|(k, _)| k.bytenr == bytenr)
            .filter(|(k, _)| !k.is_head())
            .count()
    }
}

/// Applies one ref to the extent tree
fn run_one_delayed_ref(
    fs: &FsContext,
    trans: &TransHandle<'_>,
    node: &DelayedRefNode,
    extent_op: Option<&ExtentOp>,
    insert_reserved: bool,
) -> Result<()> {
    trace!(bytenr = node.bytenr, action = ?node.action, kind = ?node.kind, "running delayed ref");
    match node.action {
        RefAction::Add if insert_reserved => {
            if node.kind.is_tree() {
                let op = extent_op.ok_or_else(|| {
                    BtrfsError::Corrupt(format!("tree block {} inserted without key", node.bytenr))
                })?;
                backref::alloc_reserved_tree_block(
                    fs,
                    trans.transid(),
                    node.bytenr,
                    node.num_bytes,
                    node.kind,
                    op.flags_to_set,
                    op.key.unwrap_or_default(),
                    node.owner as u8,
                )
            } else {
                let flags = extent_op.map_or(0, |op| op.flags_to_set);
                backref::alloc_reserved_file_extent(
                    fs,
                    trans.transid(),
                    node.bytenr,
                    node.num_bytes,
                    node.kind,
                    flags,
                    node.ref_mod as u32,
                )
            }
        }
        RefAction::Add => backref::inc_extent_ref(
            fs,
            trans.transid(),
            node.bytenr,
            node.num_bytes,
            node.kind,
            node.owner,
            node.ref_mod,
            extent_op,
        ),
        RefAction::Drop => backref::free_extent(
            fs,
            trans.transid(),
            node.bytenr,
            node.num_bytes,
            node.kind,
            node.owner,
            node.ref_mod,
            extent_op,
        ),
        RefAction::AddExtent | RefAction::UpdateHead => Err(BtrfsError::Corrupt(format!(
            "unexpected {:?} node for {}",
            node.action, node.bytenr
        ))),
    }
}

/// Applies a head once its refs are gone
fn run_delayed_head(fs: &FsContext, trans: &TransHandle<'_>, head: &DelayedRefHead) -> Result<()> {
    if head.must_insert_reserved {
        // the extent was reserved and dropped before ever being inserted
        pinned::pin_extent(fs, head.bytenr, head.num_bytes, true)?;
        if head.is_data {
            fs.hooks().delete_csums(fs, head.bytenr, head.num_bytes)?;
        }
        return Ok(());
    }
    if let Some(op) = &head.extent_op {
        backref::run_delayed_extent_op(fs, trans.transid(), head.bytenr, head.num_bytes, op)?;
    }
    Ok(())
}

/// Processes every ref under each claimed head
///
/// Returns the number of nodes applied.
fn run_clustered_refs(fs: &FsContext, trans: &TransHandle<'_>, cluster: &[u64]) -> Result<usize> {
    let root = &fs.delayed_refs;
    let mut count = 0;

    for (i, &bytenr) in cluster.iter().enumerate() {
        loop {
            let result = match root.step(bytenr) {
                Step::Ref {
                    node,
                    extent_op,
                    insert_reserved,
                } => run_one_delayed_ref(fs, trans, &node, extent_op.as_ref(), insert_reserved),
                Step::Head(head) => match run_delayed_head(fs, trans, &head) {
                    Ok(()) => {
                        count += 1;
                        Err(BtrfsError::Again)
                    }
                    Err(e) => Err(e),
                },
                Step::Blocked | Step::Gone => Err(BtrfsError::Again),
            };
            match result {
                Ok(()) => count += 1,
                Err(BtrfsError::Again) => break,
                Err(e) => {
                    root.release(&cluster[i..]);
                    return Err(e);
                }
            }
        }
    }
    Ok(count)
}

/// Applies queued reference updates
///
/// `count == 0` runs until the queue is empty, waiting out heads other
/// threads hold and refs deferred for readers. Otherwise roughly `count`
/// nodes are applied. Returns the number of nodes applied.
pub fn run_delayed_refs(fs: &FsContext, trans: &TransHandle<'_>, count: usize) -> Result<usize> {
    trans.check_aborted()?;
    let run_all = count == 0;
    let mut remaining = if run_all { usize::MAX } else { count };
    let cluster_size = fs.config().policy.delayed_ref_cluster;
    let root = &fs.delayed_refs;
    let mut total = 0;

    loop {
        let (cluster, events) = root.claim_cluster(cluster_size);
        if cluster.is_empty() {
            if !run_all || root.is_empty() {
                break;
            }
            root.wait_for_change(events);
            continue;
        }

        let ran = match run_clustered_refs(fs, trans, &cluster) {
            Ok(ran) => ran,
            Err(e) => {
                trans.abort(&e);
                return Err(e);
            }
        };
        total += ran;
        remaining = remaining.saturating_sub(ran);
        if remaining == 0 {
            break;
        }
        if ran == 0 {
            if !run_all {
                break;
            }
            root.wait_for_change(events);
        }
    }

    if total > 0 {
        debug!(total, left = root.num_entries(), "ran delayed refs");
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item_type;

    fn data_add(root: &DelayedRefRoot, updates: &AtomicU64, bytenr: u64, action: RefAction) {
        root.add_data_ref(updates, bytenr, 4096, 0, 5, 256, 0, action, None, false)
            .unwrap();
    }

    #[test]
    fn test_head_sorts_before_refs() {
        let head = DelayedRefKey::head(1000);
        let tree_ref = DelayedRefKey::for_ref(1000, &BackrefKind::TreeBlock { root: 1 }, 0);
        let data_ref = DelayedRefKey::for_ref(
            1000,
            &BackrefKind::ExtentData {
                root: 5,
                objectid: 256,
                offset: 0,
            },
            0,
        );
        let next_head = DelayedRefKey::head(1001);
        assert!(head < tree_ref);
        assert!(tree_ref < data_ref);
        assert!(data_ref < next_head);
        assert!(tree_ref.with_seq(1) < tree_ref.with_seq(2));
    }

    #[test]
    fn test_add_then_drop_cancels() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        data_add(&root, &updates, 1000, RefAction::Add);
        assert_eq!(root.num_refs_for(1000), 1);
        assert_eq!(updates.load(Ordering::Relaxed), 2);

        data_add(&root, &updates, 1000, RefAction::Drop);
        assert_eq!(root.num_refs_for(1000), 0);
        assert_eq!(root.num_heads(), 1);
        assert_eq!(root.find_head(1000).unwrap().ref_mod, 0);
        assert_eq!(updates.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_same_action_merges() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        data_add(&root, &updates, 1000, RefAction::Add);
        data_add(&root, &updates, 1000, RefAction::Add);
        let refs = root.refs_for(1000);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].ref_mod, 2);

        // a larger opposite update flips the action
        for _ in 0..3 {
            data_add(&root, &updates, 1000, RefAction::Drop);
        }
        let refs = root.refs_for(1000);
        assert_eq!(refs[0].action, RefAction::Drop);
        assert_eq!(refs[0].ref_mod, 1);
        assert_eq!(root.find_head(1000).unwrap().ref_mod, -1);
    }

    #[test]
    fn test_reader_prevents_merge() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        data_add(&root, &updates, 1000, RefAction::Add);
        let guard = root.register_reader();
        data_add(&root, &updates, 1000, RefAction::Drop);
        assert_eq!(root.num_refs_for(1000), 2);

        let refs = root.refs_for(1000);
        assert!(refs[0].seq < guard.seq());
        assert!(refs[1].seq > guard.seq());
    }

    #[test]
    fn test_deferred_head_is_not_progress() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        let guard = root.register_reader();
        data_add(&root, &updates, 1000, RefAction::Add);

        let (cluster, events) = root.claim_cluster(32);
        assert_eq!(cluster, vec![1000]);
        assert!(matches!(root.step(1000), Step::Blocked));
        // a waiter keyed on `events` must sleep until the reader leaves
        assert_eq!(root.inner.lock().events, events);

        drop(guard);
        assert!(root.inner.lock().events > events);
        let (cluster, _) = root.claim_cluster(32);
        assert_eq!(cluster, vec![1000]);
        assert!(matches!(root.step(1000), Step::Ref { .. }));
    }

    #[test]
    fn test_cow_refs_are_unsequenced() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        root.add_tree_ref(&updates, 8192, 4096, 0, 5, 0, RefAction::Add, None, true)
            .unwrap();
        root.add_tree_ref(&updates, 16384, 4096, 0, objectid::EXTENT_TREE, 0, RefAction::Add, None, false)
            .unwrap();
        root.add_tree_ref(&updates, 24576, 4096, 0, 5, 0, RefAction::Add, None, false)
            .unwrap();
        assert_eq!(root.refs_for(8192)[0].seq, 0);
        assert_eq!(root.refs_for(16384)[0].seq, 0);
        assert!(root.refs_for(24576)[0].seq > 0);
    }

    #[test]
    fn test_select_prefers_add_then_drop() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        root.add_tree_ref(&updates, 4096, 4096, 0, 1, 0, RefAction::Drop, None, true)
            .unwrap();
        root.add_tree_ref(&updates, 4096, 4096, 0, 7, 0, RefAction::Add, None, true)
            .unwrap();

        let refs = root.inner.lock();
        let first = refs.select_delayed_ref(4096).unwrap();
        match refs.tree.get(&first) {
            Some(DelayedNode::Ref(r)) => assert_eq!(r.action, RefAction::Add),
            _ => panic!("expected a ref"),
        }
    }

    #[test]
    fn test_blocked_ref_requeues_head() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        let guard = root.register_reader();
        data_add(&root, &updates, 1000, RefAction::Add);

        let (cluster, _) = root.claim_cluster(32);
        assert_eq!(cluster, vec![1000]);
        assert_eq!(root.num_heads_ready(), 0);
        assert!(matches!(root.step(1000), Step::Blocked));
        assert_eq!(root.num_heads_ready(), 1);

        drop(guard);
        let (cluster, _) = root.claim_cluster(32);
        assert!(matches!(root.step(cluster[0]), Step::Ref { .. }));
        assert!(matches!(root.step(cluster[0]), Step::Head(_)));
        assert!(root.is_empty());
        assert_eq!(root.num_entries(), 0);
    }

    #[test]
    fn test_cluster_skips_claimed_heads() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        for bytenr in [4096u64, 8192, 12288] {
            root.add_tree_ref(&updates, bytenr, 4096, 0, 2, 0, RefAction::Add, None, true)
                .unwrap();
        }
        let (first, _) = root.claim_cluster(2);
        assert_eq!(first, vec![4096, 8192]);
        let (second, _) = root.claim_cluster(2);
        assert_eq!(second, vec![12288]);
        assert!(root.claim_cluster(2).0.is_empty());

        root.release(&first);
        assert_eq!(root.claim_cluster(8).0, vec![4096, 8192]);
    }

    #[test]
    fn test_extent_op_merges_into_head() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        root.add_extent_op(&updates, 4096, 4096, ExtentOp::flags(1), false);
        root.add_extent_op(
            &updates,
            4096,
            4096,
            ExtentOp {
                flags_to_set: 1 << 8,
                key: Some(BtrfsKey::new(256, item_type::INODE_ITEM, 0)),
            },
            false,
        );
        let head = root.find_head(4096).unwrap();
        let op = head.extent_op.unwrap();
        assert_eq!(op.flags_to_set, 1 | 1 << 8);
        assert!(op.key.is_some());
        assert_eq!(head.ref_mod, 0);
        assert_eq!(updates.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_check_ref_cleanup() {
        let root = DelayedRefRoot::new();
        let updates = AtomicU64::new(0);
        root.add_tree_ref(&updates, 4096, 4096, 0, 2, 0, RefAction::AddExtent, None, true)
            .unwrap();
        assert!(!root.check_ref_cleanup(4096));
        root.add_tree_ref(&updates, 4096, 4096, 0, 2, 0, RefAction::Drop, None, true)
            .unwrap();
        assert!(root.check_ref_cleanup(4096));
        assert!(root.is_empty());
        assert_eq!(root.num_heads(), 0);
    }
}
