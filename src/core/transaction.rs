//! Transaction handles and commit
//!
//! Any number of handles may be attached to the running transaction. A
//! commit waits for every other handle to end, flushes the delayed refs,
//! persists block-group state and then swaps and drains the pinned extents.

use super::{
    alloc, block_group,
    block_rsv::{block_rsv_add, block_rsv_release},
    delayed_ref::run_delayed_refs,
    pinned,
    space_cache,
    space_info::FlushMode,
    BtrfsError, FsContext, Result,
};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

thread_local! {
    static JOURNAL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// True while the current thread holds a transaction handle
///
/// Reservation code uses this to avoid committing from inside a
/// transaction, which would wait on itself.
pub fn in_transaction() -> bool {
    JOURNAL_DEPTH.with(|d| d.get() > 0)
}

struct JournalGuard;

impl JournalGuard {
    fn enter() -> Self {
        JOURNAL_DEPTH.with(|d| d.set(d.get() + 1));
        JournalGuard
    }
}

impl Drop for JournalGuard {
    fn drop(&mut self) {
        JOURNAL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// A running transaction shared by all attached handles
pub struct Transaction {
    transid: u64,
    aborted: Mutex<Option<String>>,
    writers: Mutex<usize>,
    writers_done: Condvar,
}

impl Transaction {
    fn new(transid: u64) -> Self {
        Self {
            transid,
            aborted: Mutex::new(None),
            writers: Mutex::new(0),
            writers_done: Condvar::new(),
        }
    }

    pub fn transid(&self) -> u64 {
        self.transid
    }

    /// The first error that aborted this transaction
    pub fn abort_reason(&self) -> Option<String> {
        self.aborted.lock().clone()
    }

    fn add_writer(&self) {
        *self.writers.lock() += 1;
    }

    fn remove_writer(&self) {
        let mut writers = self.writers.lock();
        *writers = writers.saturating_sub(1);
        if *writers == 0 {
            self.writers_done.notify_all();
        }
    }

    fn wait_for_writers(&self) {
        let mut writers = self.writers.lock();
        while *writers > 0 {
            self.writers_done.wait(&mut writers);
        }
    }
}

/// Transaction bookkeeping held by the filesystem
#[derive(Default)]
pub(crate) struct TransState {
    running: Option<Arc<Transaction>>,
    committing: bool,
    last_committed: u64,
}

/// Serializes transaction start against commit
#[derive(Default)]
pub(crate) struct TransControl {
    state: Mutex<TransState>,
    commit_done: Condvar,
}

impl TransControl {
    pub(crate) fn new(last_committed: u64) -> Self {
        Self {
            state: Mutex::new(TransState {
                last_committed,
                ..Default::default()
            }),
            commit_done: Condvar::new(),
        }
    }

    pub(crate) fn last_committed(&self) -> u64 {
        self.state.lock().last_committed
    }

    pub(crate) fn running_transid(&self) -> Option<u64> {
        self.state.lock().running.as_ref().map(|t| t.transid)
    }

    fn attach(&self) -> Arc<Transaction> {
        let mut state = self.state.lock();
        while state.committing {
            self.commit_done.wait(&mut state);
        }
        let last = state.last_committed;
        let trans = state
            .running
            .get_or_insert_with(|| Arc::new(Transaction::new(last + 1)))
            .clone();
        trans.add_writer();
        trans
    }
}

/// A caller's attachment to the running transaction
///
/// Dropping a handle without [`TransHandle::end`] detaches it without
/// running delayed refs.
pub struct TransHandle<'a> {
    fs: &'a FsContext,
    trans: Arc<Transaction>,
    delayed_ref_updates: AtomicU64,
    bytes_reserved: u64,
    detached: bool,
    _journal: JournalGuard,
}

/// Metadata to reserve for a handle that will modify `num_items` items
pub fn calc_trans_metadata_size(fs: &FsContext, num_items: u64) -> u64 {
    fs.config().node_size as u64 * 8 * 3 * num_items
}

/// Starts or joins a transaction with room to modify `num_items` items
pub fn start_transaction(fs: &FsContext, num_items: u64) -> Result<TransHandle<'_>> {
    fs.check_writable()?;
    let bytes = calc_trans_metadata_size(fs, num_items);
    if bytes > 0 {
        block_rsv_add(fs, &fs.trans_rsv, bytes, FlushMode::FlushAll)?;
    }
    let trans = fs.trans.attach();
    Ok(TransHandle {
        fs,
        trans,
        delayed_ref_updates: AtomicU64::new(0),
        bytes_reserved: bytes,
        detached: false,
        _journal: JournalGuard::enter(),
    })
}

/// Joins the running transaction without reserving anything
pub fn join_transaction(fs: &FsContext) -> Result<TransHandle<'_>> {
    start_transaction(fs, 0)
}

impl<'a> TransHandle<'a> {
    pub fn transid(&self) -> u64 {
        self.trans.transid
    }

    pub fn fs(&self) -> &'a FsContext {
        self.fs
    }

    /// Delayed-ref entries this handle queued and has not run
    pub fn ref_updates(&self) -> &AtomicU64 {
        &self.delayed_ref_updates
    }

    /// Bytes this handle holds in the transaction reservation
    pub fn bytes_reserved(&self) -> u64 {
        self.bytes_reserved
    }

    /// Fails with [`BtrfsError::Aborted`] once the transaction was aborted
    pub fn check_aborted(&self) -> Result<()> {
        match self.trans.abort_reason() {
            Some(reason) => Err(BtrfsError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Aborts the whole transaction and puts the filesystem in error state
    pub fn abort(&self, err: &BtrfsError) {
        {
            let mut aborted = self.trans.aborted.lock();
            if aborted.is_some() {
                return;
            }
            *aborted = Some(err.to_string());
        }
        error!(transid = self.trans.transid, error = %err, "transaction aborted");
        self.fs.handle_fs_error(err);
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if self.bytes_reserved > 0 {
            block_rsv_release(self.fs, &self.fs.trans_rsv, Some(self.bytes_reserved));
            self.bytes_reserved = 0;
        }
        self.trans.remove_writer();
    }

    /// Ends the handle, running a batch of delayed refs if it queued many
    pub fn end(mut self) -> Result<()> {
        let updates = self.delayed_ref_updates.swap(0, Ordering::Relaxed);
        let batch = self.fs.config().policy.delayed_ref_batch;
        let result = if updates > batch && self.check_aborted().is_ok() {
            run_delayed_refs(self.fs, &self, updates as usize).map(|_| ())
        } else {
            Ok(())
        };
        self.detach();
        result?;
        self.check_aborted()
    }

    /// Commits the transaction this handle belongs to
    ///
    /// If another handle is already committing it, this one detaches and
    /// waits for that commit instead.
    pub fn commit(mut self) -> Result<()> {
        let fs = self.fs;
        self.check_aborted()?;

        if let Err(e) = run_delayed_refs(fs, &self, 0) {
            self.detach();
            return Err(e);
        }

        {
            let mut state = fs.trans.state.lock();
            if state.committing {
                drop(state);
                self.detach();
                let mut state = fs.trans.state.lock();
                while state.committing {
                    fs.trans.commit_done.wait(&mut state);
                }
                drop(state);
                return self.check_aborted();
            }
            state.committing = true;
        }

        self.detach();
        self.trans.wait_for_writers();
        let result = self.do_commit();

        let mut state = fs.trans.state.lock();
        state.committing = false;
        state.running = None;
        if result.is_ok() {
            state.last_committed = self.trans.transid;
        }
        drop(state);
        fs.trans.commit_done.notify_all();
        result
    }

    fn do_commit(&self) -> Result<()> {
        let fs = self.fs;
        let transid = self.trans.transid;
        let steps = || -> Result<()> {
            self.check_aborted()?;
            run_delayed_refs(fs, self, 0)?;
            alloc::release_clusters(fs, None)?;
            let groups = block_group::write_dirty_block_groups(fs)?;

            let cache_generation = if fs.config().space_cache {
                let mut written = 0;
                for cache in fs.block_groups() {
                    if space_cache::write_free_space_cache(fs, &cache, transid)? {
                        written += 1;
                    }
                }
                debug!(transid, written, "wrote free space caches");
                transid
            } else {
                0
            };

            pinned::prepare_extent_commit(fs);
            fs.commit_super(transid, cache_generation)?;
            pinned::finish_extent_commit(fs)?;
            info!(transid, groups, "transaction committed");
            Ok(())
        };

        steps().map_err(|e| {
            if !matches!(e, BtrfsError::Aborted(_)) {
                self.abort(&e);
            }
            e
        })
    }
}

impl Drop for TransHandle<'_> {
    fn drop(&mut self) {
        self.detach();
    }
}
