//! # Transactions and the Page Commit Protocol
//!
//! A [`TransactionContext`] is a per-transaction overlay over the page
//! store: the first write to an existing page clones it into the overlay
//! (copy-on-write), pages allocated by the transaction live only in the
//! overlay, and index operations queue as pending work. Nothing reaches the
//! store before `commit`. The context is an explicit value passed into every
//! operation — there is no thread-local "current transaction".
//!
//! ## Lifecycle
//!
//! ```text
//! ┌───────────┐  begin()   ┌────────┐  commit()    ┌───────────┐
//! │ NotBegun  │ ─────────► │ Begun  │ ───────────► │ Committed │
//! └───────────┘            └────────┘              └───────────┘
//!       ▲                       │ rollback()             │ begin()
//!       │                       ▼                        ▼
//!       │                 ┌────────────┐            (reusable)
//!       └──────────────── │ RolledBack │
//!            begin()      └────────────┘
//! ```
//!
//! ## Commit Protocol
//!
//! 1. A transaction that touched nothing commits as a no-op.
//! 2. The distinct file ids of all touched pages — plus the mutable-tier
//!    files of every index with pending operations — are sorted ascending
//!    and locked in that order. The global ordering rule makes lock-order
//!    deadlocks impossible; each acquisition is bounded by the configured
//!    timeout.
//! 3. Pending index operations are applied into the overlay under the
//!    locks; unique-key checks run here, against the committed tiers plus
//!    this transaction's own overlay (§ unique constraint coordination).
//! 4. Every modified page's base version is compared against the store
//!    (optimistic concurrency); new pages are checked against the file's
//!    current page count. A mismatch aborts with `ConcurrentModification`,
//!    which propagates *without* rolling back so the caller's retry loop
//!    stays in charge.
//! 5. With WAL enabled, one record carrying the transaction id and all
//!    before/after images is appended and flushed before the store is
//!    touched (write-ahead invariant).
//! 6. Page images and new page counts are handed to the store; versions
//!    advance.
//! 7. Locks release via RAII in every path. Any failure after lock
//!    acquisition other than `ConcurrentModification` triggers `rollback`
//!    before the error propagates.
//!
//! A commit can observe that an index's mutable tier was swapped by the
//! compactor between computing its lock set and acquiring it; it then drops
//! the locks and recomputes (bounded retries), so pending operations always
//! land in the tier that is current under the locks actually held.

mod locks;

pub use locks::{FileLockGuard, FileLockManager};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::error::EngineError;
use crate::index::{Index, IndexRegistry, Rid};
use crate::storage::{FileManager, Page, PageId};
use crate::types::Value;
use crate::wal::{PageImage, Wal};

/// Retries of the lock-set computation when a compactor swaps a tier
/// between snapshot and lock acquisition.
const MAX_LOCK_SET_RETRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    NotBegun,
    Begun,
    Committed,
    RolledBack,
}

/// One queued index mutation, validated and applied at commit time under
/// the page locks.
#[derive(Debug, Clone)]
pub struct PendingIndexOp {
    pub index: String,
    pub is_put: bool,
    pub keys: Vec<Value>,
    pub rid: Option<Rid>,
}

pub struct TransactionContext {
    txn_id: u64,
    state: TxnState,
    modified: HashMap<PageId, Page>,
    fresh: HashMap<PageId, Page>,
    /// Per-file page count as this transaction sees it (base + allocations).
    page_counts: HashMap<u32, u32>,
    /// Per-file page count at first allocation, for the commit-time check.
    base_counts: HashMap<u32, u32>,
    index_changes: Vec<PendingIndexOp>,
}

impl TransactionContext {
    pub fn new(txn_id: u64) -> Self {
        Self {
            txn_id,
            state: TxnState::NotBegun,
            modified: HashMap::new(),
            fresh: HashMap::new(),
            page_counts: HashMap::new(),
            base_counts: HashMap::new(),
            index_changes: Vec::new(),
        }
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Begun
    }

    fn clear(&mut self) {
        self.modified.clear();
        self.fresh.clear();
        self.page_counts.clear();
        self.base_counts.clear();
        self.index_changes.clear();
    }

    /// Start the transaction. Fails if it is already running.
    pub fn begin(&mut self) -> Result<()> {
        ensure!(
            self.state != TxnState::Begun,
            "transaction {} is already begun",
            self.txn_id
        );
        self.clear();
        self.state = TxnState::Begun;
        Ok(())
    }

    /// Read a page through the overlay: the transaction's own copy wins,
    /// otherwise the last-committed image is fetched from the store.
    pub fn page(&self, files: &FileManager, id: PageId) -> Result<Page> {
        ensure!(self.is_active(), "transaction {} is not active", self.txn_id);
        if let Some(page) = self.fresh.get(&id) {
            return Ok(page.clone());
        }
        if let Some(page) = self.modified.get(&id) {
            return Ok(page.clone());
        }
        files.read_page(id)
    }

    /// Write access to a page. An existing page is cloned into the overlay
    /// on first touch; later writes hit the same clone.
    pub fn page_mut(&mut self, files: &FileManager, id: PageId) -> Result<&mut Page> {
        ensure!(self.is_active(), "transaction {} is not active", self.txn_id);
        if self.fresh.contains_key(&id) {
            return Ok(self.fresh.get_mut(&id).unwrap());
        }
        if !self.modified.contains_key(&id) {
            let page = files
                .read_page(id)
                .wrap_err_with(|| format!("failed to clone page {} into transaction", id))?;
            self.modified.insert(id, page);
        }
        Ok(self.modified.get_mut(&id).unwrap())
    }

    /// Allocate the next page of a file. The page exists only in this
    /// transaction until commit.
    pub fn allocate_page(&mut self, files: &FileManager, file_id: u32) -> Result<PageId> {
        ensure!(self.is_active(), "transaction {} is not active", self.txn_id);
        let count = match self.page_counts.get(&file_id) {
            Some(&count) => count,
            None => {
                let base = files.page_count(file_id)?;
                self.base_counts.insert(file_id, base);
                base
            }
        };
        let id = PageId::new(file_id, count);
        self.page_counts.insert(file_id, count + 1);
        self.fresh.insert(id, Page::zeroed(id));
        Ok(id)
    }

    /// Page count of a file as seen by this transaction.
    pub fn page_count(&self, files: &FileManager, file_id: u32) -> Result<u32> {
        match self.page_counts.get(&file_id) {
            Some(&count) => Ok(count),
            None => files.page_count(file_id),
        }
    }

    pub fn has_page_changes(&self) -> bool {
        !self.modified.is_empty() || !self.fresh.is_empty()
    }

    /// Queue an index mutation for commit-time validation and application.
    pub fn add_index_operation(
        &mut self,
        index: &Index,
        is_put: bool,
        keys: &[Value],
        rid: Option<Rid>,
    ) -> Result<()> {
        ensure!(self.is_active(), "transaction {} is not active", self.txn_id);
        index.validate_key(keys)?;
        if is_put {
            let rid = rid.ok_or_else(|| eyre::eyre!("put requires a rid"))?;
            ensure!(
                rid.bucket_id >= 0,
                "cannot insert tombstone rid {} into index '{}'",
                rid,
                index.name()
            );
        }
        self.index_changes.push(PendingIndexOp {
            index: index.name().to_string(),
            is_put,
            keys: keys.to_vec(),
            rid,
        });
        Ok(())
    }

    /// Queue `rid` under `keys`.
    pub fn put(&mut self, index: &Index, keys: &[Value], rid: Rid) -> Result<()> {
        self.add_index_operation(index, true, keys, Some(rid))
    }

    /// Queue a removal: of one RID when `rid` is given, of the whole key
    /// otherwise.
    pub fn remove(&mut self, index: &Index, keys: &[Value], rid: Option<Rid>) -> Result<()> {
        self.add_index_operation(index, false, keys, rid)
    }

    fn touched_files(&self, indexes: &IndexRegistry) -> Result<SmallVec<[u32; 8]>> {
        let mut files: SmallVec<[u32; 8]> = SmallVec::new();
        for id in self.modified.keys().chain(self.fresh.keys()) {
            files.push(id.file_id);
        }
        for op in &self.index_changes {
            let index = indexes
                .get(&op.index)
                .ok_or_else(|| eyre::eyre!("unknown index '{}' in transaction", op.index))?;
            files.push(index.mutable_file_id());
        }
        files.sort_unstable();
        files.dedup();
        Ok(files)
    }

    /// Run the commit protocol. See the module docs for the step order.
    pub fn commit(
        &mut self,
        files: &FileManager,
        wal: Option<&Wal>,
        locks: &FileLockManager,
        indexes: &IndexRegistry,
    ) -> Result<()> {
        ensure!(
            self.state == TxnState::Begun,
            "cannot commit transaction {} in state {:?}",
            self.txn_id,
            self.state
        );

        if !self.has_page_changes() && self.index_changes.is_empty() {
            self.clear();
            self.state = TxnState::Committed;
            return Ok(());
        }

        let mut attempts = 0;
        let _guards = loop {
            attempts += 1;
            let mut lock_set = match self.touched_files(indexes) {
                Ok(set) => set,
                Err(e) => {
                    self.rollback();
                    return Err(e);
                }
            };
            let guards = match locks.acquire_ordered(&mut lock_set) {
                Ok(guards) => guards,
                Err(e) => {
                    self.rollback();
                    return Err(e);
                }
            };

            // A compactor may have swapped a tier between computing the set
            // and locking it; recompute and retry until the set is stable.
            let current = match self.touched_files(indexes) {
                Ok(set) => set,
                Err(e) => {
                    self.rollback();
                    return Err(e);
                }
            };
            if current.iter().all(|id| lock_set.contains(id)) {
                break guards;
            }
            drop(guards);
            if attempts >= MAX_LOCK_SET_RETRIES {
                self.rollback();
                bail!("index tiers kept changing during commit; giving up after {attempts} attempts");
            }
        };

        // Apply queued index operations into the overlay, under the locks.
        let ops = std::mem::take(&mut self.index_changes);
        for op in &ops {
            let index = indexes
                .get(&op.index)
                .ok_or_else(|| eyre::eyre!("unknown index '{}' in transaction", op.index));
            let applied = index.and_then(|index| index.apply_op(self, files, op));
            if let Err(e) = applied {
                self.rollback();
                return Err(e);
            }
        }

        // Optimistic version checks: a conflicting commit since our reads
        // aborts the transaction, and the caller retries it wholesale.
        for (id, page) in &self.modified {
            let current = files.current_version(*id);
            if current != page.base_version() {
                return Err(EngineError::ConcurrentModification {
                    file_id: id.file_id,
                    page_no: id.page_no,
                }
                .into());
            }
        }
        for (&file_id, &base) in &self.base_counts {
            let current = match files.page_count(file_id) {
                Ok(count) => count,
                Err(e) => {
                    self.rollback();
                    return Err(e);
                }
            };
            if current != base {
                return Err(EngineError::ConcurrentModification {
                    file_id,
                    page_no: base,
                }
                .into());
            }
        }

        // Write-ahead: the full record must be durable before the store
        // changes.
        if let Some(wal) = wal {
            let result = self.build_wal_images(files).and_then(|images| {
                wal.append(self.txn_id, &images)
                    .wrap_err("failed to write commit record")
            });
            if let Err(e) = result {
                self.rollback();
                return Err(e);
            }
        }

        let pages: Vec<&Page> = self.modified.values().chain(self.fresh.values()).collect();
        let mut new_counts: Vec<(u32, u32)> = self
            .page_counts
            .iter()
            .map(|(&file_id, &count)| (file_id, count))
            .collect();
        new_counts.sort_unstable();

        if let Err(e) = files.apply(&pages, &new_counts) {
            self.rollback();
            return Err(e.wrap_err("failed to apply committed pages"));
        }

        self.clear();
        self.state = TxnState::Committed;
        Ok(())
    }

    fn build_wal_images(&self, files: &FileManager) -> Result<Vec<PageImage>> {
        let mut images = Vec::with_capacity(self.modified.len() + self.fresh.len());
        for (id, page) in &self.modified {
            let before = files.read_page(*id)?.into_image();
            images.push(PageImage {
                id: *id,
                before: Some(before),
                after: page.data().to_vec().into(),
            });
        }
        for (id, page) in &self.fresh {
            images.push(PageImage {
                id: *id,
                before: None,
                after: page.data().to_vec().into(),
            });
        }
        Ok(images)
    }

    /// Discard the overlay and pending operations. Never touches the store.
    pub fn rollback(&mut self) {
        if self.state == TxnState::Begun {
            self.clear();
            self.state = TxnState::RolledBack;
        }
    }
}

/// Read access to pages either at last-committed state or through a
/// transaction's overlay. Index lookups run against whichever view the
/// caller holds.
#[derive(Clone, Copy)]
pub enum PageView<'a> {
    Committed(&'a FileManager),
    Overlay {
        tx: &'a TransactionContext,
        files: &'a FileManager,
    },
}

impl PageView<'_> {
    pub fn page(&self, id: PageId) -> Result<Page> {
        match self {
            PageView::Committed(files) => files.read_page(id),
            PageView::Overlay { tx, files } => tx.page(files, id),
        }
    }

    pub fn page_count(&self, file_id: u32) -> Result<u32> {
        match self {
            PageView::Committed(files) => files.page_count(file_id),
            PageView::Overlay { tx, files } => tx.page_count(files, file_id),
        }
    }
}
