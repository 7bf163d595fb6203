//! # Index Compactor
//!
//! Folds an index's mutable tier (and any existing compacted tier) into one
//! fresh compacted tier with a k-way merge, then swaps both tier pointers
//! atomically. The merge is the only place tombstones are resolved and stale
//! entries physically disappear.
//!
//! ## Phases
//!
//! ```text
//! Idle ──CAS──> Compacting ────────> Swapping ────────> Idle
//!               seal + merge         copy post-seal      (status reset,
//!               into new file        pages, flip tiers    old files dropped)
//! ```
//!
//! 1. **Seal.** Under the index write lock the current mutable page count
//!    becomes the snapshot boundary; later writes allocate past it. A single
//!    acquire/release of the mutable file's commit lock then acts as a
//!    barrier: once it returns, every in-flight commit that could still
//!    touch pre-seal pages has finished.
//! 2. **Merge.** One forward iterator per snapshot page (pages are
//!    internally sorted, so each source holds exactly one page in memory),
//!    plus one iterator over the old compacted tier's data pages as the
//!    oldest source. The globally minimal key is selected each round; equal
//!    keys merge their value lists newest-source-first, so newest-wins
//!    ordering survives into the output. Value lists that resolve to nothing
//!    but tombstones are dropped. Output pages append to a new file inside
//!    ordinary transactions, committed every RAM-budget's worth of pages so
//!    a single compaction cannot grow one giant WAL record.
//! 3. **Swap.** Pages written after the snapshot boundary are copied into a
//!    brand-new mutable file; then, holding the commit locks of the old and
//!    new mutable files, both tier pointers flip together and the catalog is
//!    persisted before any committer can see the new tier. Old files are
//!    dropped last, so a crash anywhere before the swap leaves the original
//!    tiers untouched and merely orphans the half-written output.
//!
//! The sparse root region is reserved up front (sized from the input page
//! count with slack for packing) because root pages must precede data pages
//! in the file; each closed data page appends its `(max key, page no)`
//! reference to the reservation.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info, warn};

use super::page::{
    write_compacted_root, write_mutable_root, CompactedRoot, IndexPage, IndexPageMut, TierMeta,
};
use super::{resolve_live, CompactedTier, Index, IndexRegistry, MutableTier, Rid};
use crate::config::{
    DatabaseConfig, ENTRY_POINTER_SIZE, PAGE_USABLE_SIZE, RID_SIZE, ROOT_PAGE_FANOUT,
};
use crate::encoding::key_prefix;
use crate::storage::{FileManager, Page, PageId};
use crate::tx::{FileLockManager, TransactionContext};
use crate::wal::{PageImage, Wal};

/// Where the compactor records a completed tier swap durably. The database
/// persists its catalog here while the swap still holds the file locks.
pub(crate) trait CatalogSink: Sync {
    fn persist_tiers(&self) -> Result<()>;
}

/// Collaborators a compaction run needs; owned by the database, borrowed
/// per run.
pub(crate) struct CompactionContext<'a> {
    pub files: &'a FileManager,
    pub wal: Option<&'a Wal>,
    pub locks: &'a FileLockManager,
    pub config: &'a DatabaseConfig,
    pub registry: &'a IndexRegistry,
    pub txn_ids: &'a AtomicU64,
    pub catalog: &'a dyn CatalogSink,
    /// Shared with the WAL checkpointer: the tier swap holds the read side
    /// so its log record cannot be truncated between append and apply.
    pub commit_gate: &'a RwLock<()>,
}

impl CompactionContext<'_> {
    fn next_txn(&self) -> u64 {
        self.txn_ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Compact `index`. Returns `false` when there is nothing to do: fewer than
/// two mutable data pages, or another compaction already in flight.
pub(crate) fn compact(index: &Index, ctx: &CompactionContext<'_>) -> Result<bool> {
    if !index.try_start_compaction() {
        debug!(index = index.name(), "compaction already in progress");
        return Ok(false);
    }
    let result = run(index, ctx);
    index.finish_compaction();
    result
}

fn run(index: &Index, ctx: &CompactionContext<'_>) -> Result<bool> {
    let meta = index.meta().clone();
    let (mutable_fid, snapshot_pages, old_compacted) = {
        let mut tiers = index.tiers_mut();
        let fid = tiers.mutable.file_id();
        let pages = ctx.files.page_count(fid)?;
        if pages <= 2 {
            return Ok(false);
        }
        tiers.mutable.seal(pages);
        (fid, pages, tiers.compacted.clone())
    };
    debug!(
        index = index.name(),
        data_pages = snapshot_pages - 1,
        "compaction started"
    );

    // Barrier: commits that read the tier before the seal hold this lock
    // until they finish; afterwards every committer sees the boundary.
    drop(ctx.locks.acquire(mutable_fid)?);

    let out_fid = ctx.files.create_file()?;
    let new_mutable_fid = ctx.files.create_file()?;

    match merge_and_swap(
        index,
        ctx,
        &meta,
        mutable_fid,
        snapshot_pages,
        old_compacted.as_ref(),
        out_fid,
        new_mutable_fid,
    ) {
        Ok(()) => {
            if let Err(e) = ctx.files.drop_file(mutable_fid) {
                warn!(file = mutable_fid, error = %e, "failed to drop old mutable tier file");
            }
            if let Some(old) = &old_compacted {
                if let Err(e) = ctx.files.drop_file(old.file_id()) {
                    warn!(file = old.file_id(), error = %e, "failed to drop old compacted tier file");
                }
            }
            Ok(true)
        }
        Err(e) => {
            // The swap is the last step; failing before it leaves the
            // original tiers authoritative, so the half-written output is
            // just dropped.
            let _ = ctx.files.drop_file(out_fid);
            let _ = ctx.files.drop_file(new_mutable_fid);
            Err(e.wrap_err(format!("compaction of index '{}' failed", index.name())))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_and_swap(
    index: &Index,
    ctx: &CompactionContext<'_>,
    meta: &TierMeta,
    mutable_fid: u32,
    snapshot_pages: u32,
    old_compacted: Option<&CompactedTier>,
    out_fid: u32,
    new_mutable_fid: u32,
) -> Result<()> {
    let columns = meta.key_types.len();

    // Sources in newest-first order: mutable pages descending, then the old
    // compacted tier as the single oldest source.
    let mut sources = Vec::with_capacity(snapshot_pages as usize);
    for page_no in (1..snapshot_pages).rev() {
        sources.push(MergeSource::single_page(
            ctx.files,
            mutable_fid,
            page_no,
            columns,
        )?);
    }
    if let Some(old) = old_compacted {
        if old.data_page_count() > 0 {
            sources.push(MergeSource::page_run(
                ctx.files,
                old.file_id(),
                old.first_data_page(),
                old.last_page() + 1,
                columns,
            )?);
        }
    }

    let input_pages =
        (snapshot_pages - 1) + old_compacted.map_or(0, CompactedTier::data_page_count);
    let mut writer = CompactedWriter::new(ctx, out_fid, new_mutable_fid, meta, input_pages)?;

    let mut merged_keys = 0u64;
    loop {
        let mut min: Option<Vec<u8>> = None;
        for source in &sources {
            if let Some(key) = source.key()? {
                if min.as_deref().map_or(true, |current| key < current) {
                    min = Some(key.to_vec());
                }
            }
        }
        let Some(min) = min else { break };

        let mut values = Vec::new();
        for source in &mut sources {
            while source.key()?.is_some_and(|key| key == &min[..]) {
                source.push_values(&mut values)?;
                source.advance(ctx.files)?;
            }
        }
        let live = resolve_live(&values);
        if !live.is_empty() {
            writer.append(&min, &live)?;
            merged_keys += 1;
        }
    }
    let root_pages = writer.finish()?;

    // Swap. Holding the old and new mutable file locks pins the old tier's
    // page count, so the post-seal copy cannot miss a racing commit. The
    // commit gate is taken first (same order as ordinary commits) to keep
    // the swap record and its page writes on the same side of any WAL
    // checkpoint.
    index.enter_swap();
    let _gate = ctx.commit_gate.read();
    let mut lock_set: SmallVec<[u32; 8]> = smallvec![mutable_fid, new_mutable_fid];
    let guards = ctx.locks.acquire_ordered(&mut lock_set)?;

    let current_pages = ctx.files.page_count(mutable_fid)?;
    let carried = current_pages - snapshot_pages;
    let mut images = Vec::with_capacity(1 + carried as usize);
    let mut root = Page::zeroed(PageId::new(new_mutable_fid, 0));
    write_mutable_root(&mut root, meta)?;
    images.push(root);
    for offset in 0..carried {
        let source = ctx
            .files
            .read_page(PageId::new(mutable_fid, snapshot_pages + offset))?;
        images.push(Page::from_bytes(
            PageId::new(new_mutable_fid, 1 + offset),
            0,
            source.data(),
        )?);
    }
    if let Some(wal) = ctx.wal {
        let wal_images: Vec<PageImage> = images
            .iter()
            .map(|page| PageImage {
                id: page.id(),
                before: None,
                after: page.data().to_vec().into(),
            })
            .collect();
        wal.append(ctx.next_txn(), &wal_images)
            .wrap_err("failed to log tier swap")?;
    }
    let refs: Vec<&Page> = images.iter().collect();
    ctx.files.apply(&refs, &[(new_mutable_fid, 1 + carried)])?;

    let out_pages = ctx.files.page_count(out_fid)?;
    let previous = {
        let mut tiers = index.tiers_mut();
        let previous = std::mem::replace(&mut tiers.mutable, MutableTier::new(new_mutable_fid));
        tiers.compacted = Some(CompactedTier::new(out_fid, root_pages, out_pages));
        previous
    };
    if let Err(e) = ctx.catalog.persist_tiers() {
        // Revert so the still-valid old tiers stay authoritative.
        let mut tiers = index.tiers_mut();
        tiers.mutable = previous;
        tiers.compacted = old_compacted.cloned();
        return Err(e.wrap_err("failed to persist tier swap"));
    }
    drop(guards);

    info!(
        index = index.name(),
        keys = merged_keys,
        data_pages = out_pages - 1 - root_pages,
        carried_pages = carried,
        "compaction swapped tiers"
    );
    Ok(())
}

/// One merge input: a single mutable page, or a run of compacted data pages
/// loaded one at a time.
struct MergeSource {
    file_id: u32,
    columns: usize,
    page: Page,
    entry: usize,
    /// Next page of the run to load once the current one is consumed.
    next_page: u32,
    /// Exclusive end of the run.
    end_page: u32,
}

impl MergeSource {
    fn single_page(
        files: &FileManager,
        file_id: u32,
        page_no: u32,
        columns: usize,
    ) -> Result<Self> {
        Ok(Self {
            file_id,
            columns,
            page: files.read_page(PageId::new(file_id, page_no))?,
            entry: 0,
            next_page: 0,
            end_page: 0,
        })
    }

    fn page_run(
        files: &FileManager,
        file_id: u32,
        first_page: u32,
        end_page: u32,
        columns: usize,
    ) -> Result<Self> {
        Ok(Self {
            file_id,
            columns,
            page: files.read_page(PageId::new(file_id, first_page))?,
            entry: 0,
            next_page: first_page + 1,
            end_page,
        })
    }

    fn key(&self) -> Result<Option<&[u8]>> {
        let node = IndexPage::from_page(&self.page, self.columns);
        if self.entry < node.entry_count() {
            Ok(Some(node.key_at(self.entry)?))
        } else {
            Ok(None)
        }
    }

    fn push_values(&self, out: &mut Vec<Rid>) -> Result<()> {
        let node = IndexPage::from_page(&self.page, self.columns);
        let entry = node.entry_at(self.entry)?;
        for rid in entry.values() {
            out.push(rid?);
        }
        Ok(())
    }

    fn advance(&mut self, files: &FileManager) -> Result<()> {
        self.entry += 1;
        loop {
            let count = IndexPage::from_page(&self.page, self.columns).entry_count();
            if self.entry < count || self.next_page >= self.end_page {
                return Ok(());
            }
            self.page = files.read_page(PageId::new(self.file_id, self.next_page))?;
            self.next_page += 1;
            self.entry = 0;
        }
    }
}

/// Streams merged entries into the output file: data pages in key order,
/// root references into the reserved sparse region, a transaction checkpoint
/// every RAM-budget's worth of closed pages.
struct CompactedWriter<'a> {
    ctx: &'a CompactionContext<'a>,
    out_fid: u32,
    columns: usize,
    bf_key_depth: u8,
    tx: TransactionContext,
    root_pages: u32,
    root_cursor: u32,
    data_page: Option<PageId>,
    last_key: Vec<u8>,
    pages_since_checkpoint: usize,
    checkpoint_every: usize,
}

impl<'a> CompactedWriter<'a> {
    fn new(
        ctx: &'a CompactionContext<'a>,
        out_fid: u32,
        new_mutable_fid: u32,
        meta: &TierMeta,
        input_pages: u32,
    ) -> Result<Self> {
        // Slack for packing: output can exceed the input page count when
        // entries straddle page boundaries, never by more than 2x.
        let root_pages = (2 * input_pages as usize / ROOT_PAGE_FANOUT + 1) as u32;

        let mut tx = TransactionContext::new(ctx.next_txn());
        tx.begin()?;
        {
            let page = tx.page_mut(ctx.files, PageId::new(out_fid, 0))?;
            write_compacted_root(
                page,
                &CompactedRoot {
                    compacted_page_count: root_pages,
                    sub_index_file_id: new_mutable_fid,
                    meta: meta.clone(),
                },
            )?;
        }
        for _ in 0..root_pages {
            let id = tx.allocate_page(ctx.files, out_fid)?;
            let page = tx.page_mut(ctx.files, id)?;
            IndexPageMut::init(page, meta.key_types.len(), 0)?;
        }

        Ok(Self {
            ctx,
            out_fid,
            columns: meta.key_types.len(),
            bf_key_depth: meta.bf_key_depth,
            tx,
            root_pages,
            root_cursor: 1,
            data_page: None,
            last_key: Vec::new(),
            pages_since_checkpoint: 0,
            checkpoint_every: ctx.config.compaction_pages_per_pass(),
        })
    }

    fn append(&mut self, key: &[u8], rids: &[Rid]) -> Result<()> {
        let capacity = PAGE_USABLE_SIZE - ENTRY_POINTER_SIZE - key.len() - 4;
        let max_rids = capacity / RID_SIZE;
        if rids.len() <= max_rids {
            return self.append_entry(key, rids);
        }
        // Oversized value list: one chunk per fresh page, so a lookup can
        // follow the run page by page.
        self.close_data_page()?;
        for chunk in rids.chunks(max_rids) {
            self.append_entry(key, chunk)?;
            self.close_data_page()?;
        }
        Ok(())
    }

    fn append_entry(&mut self, key: &[u8], rids: &[Rid]) -> Result<()> {
        let bf_prefix = key_prefix(key, self.columns, self.bf_key_depth)?.to_vec();
        loop {
            let fresh = self.data_page.is_none();
            let id = match self.data_page {
                Some(id) => id,
                None => {
                    let id = self.tx.allocate_page(self.ctx.files, self.out_fid)?;
                    let page = self.tx.page_mut(self.ctx.files, id)?;
                    IndexPageMut::init(page, self.columns, rand::random())?;
                    self.data_page = Some(id);
                    id
                }
            };
            let page = self.tx.page_mut(self.ctx.files, id)?;
            let mut node = IndexPageMut::from_page(page, self.columns);
            if node.append_entry(key, &bf_prefix, rids)? {
                self.last_key.clear();
                self.last_key.extend_from_slice(key);
                return Ok(());
            }
            ensure!(!fresh, "merged entry does not fit an empty page");
            self.close_data_page()?;
        }
    }

    /// Seal the open data page: record its `(max key, page no)` root
    /// reference and take a checkpoint when the batch budget is reached.
    fn close_data_page(&mut self) -> Result<()> {
        let Some(id) = self.data_page.take() else {
            return Ok(());
        };
        let max_key = std::mem::take(&mut self.last_key);
        loop {
            ensure!(
                self.root_cursor <= self.root_pages,
                "sparse root region overflowed during compaction"
            );
            let page = self
                .tx
                .page_mut(self.ctx.files, PageId::new(self.out_fid, self.root_cursor))?;
            let mut node = IndexPageMut::from_page(page, self.columns);
            if node.append_page_ref(&max_key, id.page_no)? {
                break;
            }
            self.root_cursor += 1;
        }

        self.pages_since_checkpoint += 1;
        if self.pages_since_checkpoint >= self.checkpoint_every {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.tx
            .commit(self.ctx.files, self.ctx.wal, self.ctx.locks, self.ctx.registry)
            .wrap_err("failed to commit compaction batch")?;
        self.tx = TransactionContext::new(self.ctx.next_txn());
        self.tx.begin()?;
        self.pages_since_checkpoint = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<u32> {
        self.close_data_page()?;
        self.tx
            .commit(self.ctx.files, self.ctx.wal, self.ctx.locks, self.ctx.registry)
            .wrap_err("failed to commit final compaction batch")?;
        Ok(self.root_pages)
    }
}
