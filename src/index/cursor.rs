//! # Merging Index Cursor
//!
//! Ordered iteration over both tiers of an index. One sub-cursor is opened
//! per mutable page (each page is internally sorted) plus one per compacted
//! data-page run; every step picks the smallest (ascending) or largest
//! (descending) current key across the open sub-cursors, merges the value
//! lists of all sub-cursors sitting on that key newest-source-first, and
//! resolves tombstones so deleted entries never surface. The surviving RIDs
//! are buffered and drained one per `next_entry` call.
//!
//! A sub-cursor whose current key leaves the caller's bound is closed and
//! drops out of the comparison, so bounded range scans prune sources as they
//! go. Mutable pages are copied once at cursor creation; compacted pages are
//! read on demand as the run advances.

use std::collections::VecDeque;

use eyre::Result;

use super::page::{IndexPage, SearchResult, TierMeta};
use super::{resolve_live, Rid, Tiers};
use crate::encoding::decode_key;
use crate::storage::{FileManager, Page, PageId};
use crate::tx::PageView;
use crate::types::{KeyType, Value};

pub struct IndexCursor<'a> {
    files: &'a FileManager,
    key_types: Vec<KeyType>,
    ascending: bool,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    subs: Vec<SubCursor>,
    pending: VecDeque<Rid>,
    pending_key: Vec<Value>,
}

impl<'a> IndexCursor<'a> {
    pub(crate) fn new(
        files: &'a FileManager,
        tiers: &Tiers,
        meta: &TierMeta,
        ascending: bool,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Result<Self> {
        let columns = meta.key_types.len();
        let mut subs = Vec::new();

        // Mutable pages, newest first: that order is what makes merged value
        // lists come out newest-first below.
        let mutable_fid = tiers.mutable.file_id();
        let page_count = files.page_count(mutable_fid)?;
        for page_no in (1..page_count).rev() {
            let mut sub = SubCursor::single_page(files, mutable_fid, page_no, columns)?;
            sub.position(files, ascending, lower.as_deref(), upper.as_deref())?;
            if sub.open {
                subs.push(sub);
            }
        }

        if let Some(compacted) = &tiers.compacted {
            if compacted.data_page_count() > 0 {
                let first = compacted.first_data_page();
                let last = compacted.last_page();
                let view = PageView::Committed(files);
                let start = if ascending {
                    match &lower {
                        Some(bound) => compacted.locate_data_page(view, columns, bound)?,
                        None => Some(first),
                    }
                } else {
                    match &upper {
                        Some(bound) => {
                            let mut page_no = compacted
                                .locate_data_page(view, columns, bound)?
                                .unwrap_or(last);
                            // A chunked run shares its max key across pages;
                            // a descending walk must enter at the run's last
                            // page to cover every chunk on the way back.
                            while page_no < last {
                                let next = files
                                    .read_page(PageId::new(compacted.file_id(), page_no + 1))?;
                                let node = IndexPage::from_page(&next, columns);
                                if node.entry_count() == 0
                                    || node.key_at(0)? > bound.as_slice()
                                {
                                    break;
                                }
                                page_no += 1;
                            }
                            Some(page_no)
                        }
                        None => Some(last),
                    }
                };
                if let Some(start) = start {
                    let mut sub = SubCursor::page_run(
                        files,
                        compacted.file_id(),
                        first,
                        last,
                        start,
                        columns,
                    )?;
                    sub.position(files, ascending, lower.as_deref(), upper.as_deref())?;
                    if sub.open {
                        subs.push(sub);
                    }
                }
            }
        }

        Ok(Self {
            files,
            key_types: meta.key_types.clone(),
            ascending,
            lower,
            upper,
            subs,
            pending: VecDeque::new(),
            pending_key: Vec::new(),
        })
    }

    /// The next `(key, rid)` pair in cursor order, or `None` at the end of
    /// the range. Tombstoned values are skipped transparently.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<Value>, Rid)>> {
        loop {
            if let Some(rid) = self.pending.pop_front() {
                return Ok(Some((self.pending_key.clone(), rid)));
            }

            let mut best: Option<Vec<u8>> = None;
            for sub in &mut self.subs {
                if !sub.open {
                    continue;
                }
                let key = sub.current_key()?;
                let out_of_bounds = if self.ascending {
                    self.upper.as_deref().is_some_and(|upper| key.as_slice() > upper)
                } else {
                    self.lower.as_deref().is_some_and(|lower| key.as_slice() < lower)
                };
                if out_of_bounds {
                    sub.open = false;
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some(current) => {
                        if self.ascending {
                            key < *current
                        } else {
                            key > *current
                        }
                    }
                };
                if better {
                    best = Some(key);
                }
            }
            let Some(best) = best else { return Ok(None) };

            let mut values = Vec::new();
            for sub in &mut self.subs {
                if sub.open && sub.current_key()? == best {
                    sub.gather(self.files, self.ascending, &best, &mut values)?;
                }
            }

            let live = resolve_live(&values);
            if live.is_empty() {
                continue;
            }
            let (decoded, _) = decode_key(&best, &self.key_types)?;
            self.pending_key = decoded;
            self.pending = live.into();
        }
    }
}

/// One physical source: a single mutable page, or a run of compacted data
/// pages walked lazily.
struct SubCursor {
    file_id: u32,
    columns: usize,
    first_page: u32,
    last_page: u32,
    page_no: u32,
    page: Page,
    idx: usize,
    open: bool,
}

impl SubCursor {
    fn single_page(
        files: &FileManager,
        file_id: u32,
        page_no: u32,
        columns: usize,
    ) -> Result<Self> {
        Ok(Self {
            file_id,
            columns,
            first_page: page_no,
            last_page: page_no,
            page_no,
            page: files.read_page(PageId::new(file_id, page_no))?,
            idx: 0,
            open: true,
        })
    }

    fn page_run(
        files: &FileManager,
        file_id: u32,
        first_page: u32,
        last_page: u32,
        start_page: u32,
        columns: usize,
    ) -> Result<Self> {
        Ok(Self {
            file_id,
            columns,
            first_page,
            last_page,
            page_no: start_page,
            page: files.read_page(PageId::new(file_id, start_page))?,
            idx: 0,
            open: true,
        })
    }

    fn load_next(&mut self, files: &FileManager) -> Result<bool> {
        if self.page_no >= self.last_page {
            return Ok(false);
        }
        self.page_no += 1;
        self.page = files.read_page(PageId::new(self.file_id, self.page_no))?;
        Ok(true)
    }

    fn load_prev(&mut self, files: &FileManager) -> Result<bool> {
        if self.page_no <= self.first_page {
            return Ok(false);
        }
        self.page_no -= 1;
        self.page = files.read_page(PageId::new(self.file_id, self.page_no))?;
        Ok(true)
    }

    fn position(
        &mut self,
        files: &FileManager,
        ascending: bool,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<()> {
        if ascending {
            self.position_ascending(files, lower)
        } else {
            self.position_descending(files, upper)
        }
    }

    /// Seek to the first entry with key >= `lower`.
    fn position_ascending(&mut self, files: &FileManager, lower: Option<&[u8]>) -> Result<()> {
        loop {
            let (count, start) = {
                let node = IndexPage::from_page(&self.page, self.columns);
                let count = node.entry_count();
                let start = match lower {
                    None => 0,
                    Some(bound) => match node.search(bound)? {
                        SearchResult::Found(idx) => idx,
                        SearchResult::NotFound(idx) => idx,
                    },
                };
                (count, start)
            };
            if start < count {
                self.idx = start;
                return Ok(());
            }
            if !self.load_next(files)? {
                self.open = false;
                return Ok(());
            }
        }
    }

    /// Seek to the last entry with key <= `upper` (the oldest entry of its
    /// equal run, so a descending gather collects the whole run).
    fn position_descending(&mut self, files: &FileManager, upper: Option<&[u8]>) -> Result<()> {
        loop {
            let position = {
                let node = IndexPage::from_page(&self.page, self.columns);
                let count = node.entry_count();
                match upper {
                    None => count.checked_sub(1),
                    Some(bound) => match node.search(bound)? {
                        SearchResult::Found(first) => Some(run_end(&node, first, bound)?),
                        SearchResult::NotFound(idx) => idx.checked_sub(1),
                    },
                }
            };
            if let Some(idx) = position {
                self.idx = idx;
                return Ok(());
            }
            if !self.load_prev(files)? {
                self.open = false;
                return Ok(());
            }
        }
    }

    fn current_key(&self) -> Result<Vec<u8>> {
        let node = IndexPage::from_page(&self.page, self.columns);
        Ok(node.key_at(self.idx)?.to_vec())
    }

    /// Collect every value of the current equal-key run (newest entry
    /// first) and step past the run in travel direction, closing the
    /// sub-cursor when the source is exhausted.
    fn gather(
        &mut self,
        files: &FileManager,
        ascending: bool,
        run_key: &[u8],
        out: &mut Vec<Rid>,
    ) -> Result<()> {
        if ascending {
            self.gather_ascending(files, run_key, out)
        } else {
            self.gather_descending(files, run_key, out)
        }
    }

    fn gather_ascending(
        &mut self,
        files: &FileManager,
        run_key: &[u8],
        out: &mut Vec<Rid>,
    ) -> Result<()> {
        loop {
            let count = {
                let node = IndexPage::from_page(&self.page, self.columns);
                let count = node.entry_count();
                while self.idx < count {
                    let entry = node.entry_at(self.idx)?;
                    if entry.key != run_key {
                        break;
                    }
                    for rid in entry.values() {
                        out.push(rid?);
                    }
                    self.idx += 1;
                }
                count
            };
            if self.idx < count {
                return Ok(());
            }
            // The run reached the page end; it may continue on the next
            // page of a compacted run.
            if !self.load_next(files)? {
                self.open = false;
                return Ok(());
            }
            self.idx = 0;
            let continues = {
                let node = IndexPage::from_page(&self.page, self.columns);
                node.entry_count() > 0 && node.key_at(0)? == run_key
            };
            if !continues {
                return Ok(());
            }
        }
    }

    fn gather_descending(
        &mut self,
        files: &FileManager,
        run_key: &[u8],
        out: &mut Vec<Rid>,
    ) -> Result<()> {
        loop {
            let start = {
                let node = IndexPage::from_page(&self.page, self.columns);
                let mut start = self.idx;
                while start > 0 && node.key_at(start - 1)? == run_key {
                    start -= 1;
                }
                for idx in start..=self.idx {
                    let entry = node.entry_at(idx)?;
                    for rid in entry.values() {
                        out.push(rid?);
                    }
                }
                start
            };
            if start > 0 {
                self.idx = start - 1;
                return Ok(());
            }
            if !self.load_prev(files)? {
                self.open = false;
                return Ok(());
            }
            let (count, continues) = {
                let node = IndexPage::from_page(&self.page, self.columns);
                let count = node.entry_count();
                (count, count > 0 && node.key_at(count - 1)? == run_key)
            };
            if count == 0 {
                self.open = false;
                return Ok(());
            }
            self.idx = count - 1;
            if !continues {
                return Ok(());
            }
        }
    }
}

fn run_end(node: &IndexPage<'_>, first: usize, key: &[u8]) -> Result<usize> {
    let mut idx = first;
    while idx + 1 < node.entry_count() && node.key_at(idx + 1)? == key {
        idx += 1;
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::index::page::{write_mutable_root, TierMeta};
    use crate::index::{CatalogSink, CompactionContext, Index, IndexRegistry, MutableTier};
    use crate::tx::{FileLockManager, TransactionContext};
    use crate::types::KeyType;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoCatalog;

    impl CatalogSink for NoCatalog {
        fn persist_tiers(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        files: FileManager,
        locks: FileLockManager,
        config: DatabaseConfig,
        registry: IndexRegistry,
        txn_ids: AtomicU64,
        commit_gate: parking_lot::RwLock<()>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let files = FileManager::open(dir.path()).unwrap();
            Self {
                _dir: dir,
                files,
                locks: FileLockManager::new(Duration::from_secs(2)),
                config: DatabaseConfig::default(),
                registry: IndexRegistry::new(),
                txn_ids: AtomicU64::new(0),
                commit_gate: parking_lot::RwLock::new(()),
            }
        }

        fn create_index(&self) -> Arc<Index> {
            let meta = TierMeta::new(vec![KeyType::Int], 0);
            let file_id = self.files.create_file().unwrap();
            let mut root = self.files.read_page(PageId::new(file_id, 0)).unwrap();
            write_mutable_root(&mut root, &meta).unwrap();
            self.files.apply(&[&root], &[]).unwrap();

            let index = Arc::new(Index::new(
                "scan".into(),
                false,
                meta,
                MutableTier::new(file_id),
                None,
            ));
            self.registry.insert(Arc::clone(&index));
            index
        }

        fn tx(&self) -> TransactionContext {
            let mut tx =
                TransactionContext::new(self.txn_ids.fetch_add(1, Ordering::Relaxed) + 1);
            tx.begin().unwrap();
            tx
        }

        fn commit(&self, tx: &mut TransactionContext) {
            tx.commit(&self.files, None, &self.locks, &self.registry)
                .unwrap();
        }

        fn compact(&self, index: &Index) -> bool {
            let ctx = CompactionContext {
                files: &self.files,
                wal: None,
                locks: &self.locks,
                config: &self.config,
                registry: &self.registry,
                txn_ids: &self.txn_ids,
                catalog: &NoCatalog,
                commit_gate: &self.commit_gate,
            };
            crate::index::compact(index, &ctx).unwrap()
        }
    }

    fn int_keys(cursor: &mut IndexCursor<'_>) -> Vec<(i64, Rid)> {
        let mut out = Vec::new();
        while let Some((keys, rid)) = cursor.next_entry().unwrap() {
            let Value::Int(v) = keys[0] else { panic!("non-int key") };
            out.push((v, rid));
        }
        out
    }

    #[test]
    fn ascending_scan_is_sorted_across_pages() {
        let h = Harness::new();
        let index = h.create_index();

        // Insert shuffled so page order and key order differ.
        let mut tx = h.tx();
        for v in (0..5000i64).rev() {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);

        let mut cursor = index.cursor(&h.files, true, None, None).unwrap();
        let entries = int_keys(&mut cursor);
        assert_eq!(entries.len(), 5000);
        for (expected, (v, rid)) in entries.into_iter().enumerate() {
            assert_eq!(v, expected as i64);
            assert_eq!(rid, Rid::new(0, v));
        }
    }

    #[test]
    fn descending_scan_reverses_the_order() {
        let h = Harness::new();
        let index = h.create_index();

        let mut tx = h.tx();
        for v in 0..100i64 {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);

        let mut cursor = index.cursor(&h.files, false, None, None).unwrap();
        let entries = int_keys(&mut cursor);
        assert_eq!(entries.len(), 100);
        for (offset, (v, _)) in entries.into_iter().enumerate() {
            assert_eq!(v, 99 - offset as i64);
        }
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let h = Harness::new();
        let index = h.create_index();

        let mut tx = h.tx();
        for v in 0..100i64 {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);

        let mut cursor = index
            .cursor(
                &h.files,
                true,
                Some(&[Value::Int(10)]),
                Some(&[Value::Int(20)]),
            )
            .unwrap();
        let keys: Vec<i64> = int_keys(&mut cursor).into_iter().map(|(v, _)| v).collect();
        assert_eq!(keys, (10..=20).collect::<Vec<_>>());
    }

    #[test]
    fn tombstoned_entries_never_surface() {
        let h = Harness::new();
        let index = h.create_index();

        let mut tx = h.tx();
        for v in 0..50i64 {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);

        let mut tx = h.tx();
        tx.remove(&index, &[Value::Int(7)], None).unwrap();
        tx.remove(&index, &[Value::Int(8)], Some(Rid::new(0, 8))).unwrap();
        h.commit(&mut tx);

        let mut cursor = index.cursor(&h.files, true, None, None).unwrap();
        let keys: Vec<i64> = int_keys(&mut cursor).into_iter().map(|(v, _)| v).collect();
        assert_eq!(keys.len(), 48);
        assert!(!keys.contains(&7));
        assert!(!keys.contains(&8));
    }

    #[test]
    fn merges_mutable_and_compacted_sources_in_order() {
        let h = Harness::new();
        let index = h.create_index();

        // Even keys land in the compacted tier, odd keys stay mutable.
        let mut tx = h.tx();
        for v in (0..10000i64).step_by(2) {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);
        assert!(h.compact(&index));

        let mut tx = h.tx();
        for v in (1..10000i64).step_by(2) {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);

        let mut cursor = index.cursor(&h.files, true, None, None).unwrap();
        let keys: Vec<i64> = int_keys(&mut cursor).into_iter().map(|(v, _)| v).collect();
        assert_eq!(keys, (0..10000).collect::<Vec<_>>());
    }

    #[test]
    fn fresh_tombstone_hides_compacted_entry() {
        let h = Harness::new();
        let index = h.create_index();

        let mut tx = h.tx();
        for v in 0..6000i64 {
            tx.put(&index, &[Value::Int(v)], Rid::new(0, v)).unwrap();
        }
        h.commit(&mut tx);
        assert!(h.compact(&index));

        let mut tx = h.tx();
        tx.remove(&index, &[Value::Int(1500)], None).unwrap();
        h.commit(&mut tx);

        let mut cursor = index
            .cursor(
                &h.files,
                true,
                Some(&[Value::Int(1499)]),
                Some(&[Value::Int(1501)]),
            )
            .unwrap();
        let keys: Vec<i64> = int_keys(&mut cursor).into_iter().map(|(v, _)| v).collect();
        assert_eq!(keys, vec![1499, 1501]);
    }

    #[test]
    fn multi_valued_key_drains_every_rid() {
        let h = Harness::new();
        let index = h.create_index();

        let mut tx = h.tx();
        for position in 0..5 {
            tx.put(&index, &[Value::Int(42)], Rid::new(1, position)).unwrap();
        }
        tx.put(&index, &[Value::Int(41)], Rid::new(1, 99)).unwrap();
        h.commit(&mut tx);

        let mut cursor = index.cursor(&h.files, true, None, None).unwrap();
        let entries = int_keys(&mut cursor);
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].0, 41);
        let rids: Vec<Rid> = entries[1..].iter().map(|&(_, rid)| rid).collect();
        assert_eq!(rids.len(), 5);
        for position in 0..5 {
            assert!(rids.contains(&Rid::new(1, position)));
        }
    }

    #[test]
    fn descending_bound_on_a_chunked_run_covers_every_chunk() {
        let h = Harness::new();
        let index = h.create_index();

        // One key with far more values than a single page holds, so the
        // compactor chunks its list across consecutive data pages.
        let mut tx = h.tx();
        for position in 0..12_000i64 {
            tx.put(&index, &[Value::Int(5)], Rid::new(1, position)).unwrap();
        }
        tx.put(&index, &[Value::Int(1)], Rid::new(0, 1)).unwrap();
        tx.put(&index, &[Value::Int(9)], Rid::new(0, 9)).unwrap();
        h.commit(&mut tx);
        assert!(h.compact(&index));

        let mut cursor = index
            .cursor(&h.files, false, None, Some(&[Value::Int(5)]))
            .unwrap();
        let entries = int_keys(&mut cursor);
        assert_eq!(entries.len(), 12_001);
        assert!(entries[..12_000].iter().all(|&(v, _)| v == 5));
        assert_eq!(entries.last().unwrap().0, 1);
    }

    #[test]
    fn empty_index_yields_nothing() {
        let h = Harness::new();
        let index = h.create_index();
        let mut cursor = index.cursor(&h.files, true, None, None).unwrap();
        assert!(cursor.next_entry().unwrap().is_none());
    }
}
