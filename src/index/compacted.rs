//! # Compacted Index Tier
//!
//! The immutable half of a two-tier index, produced only by the compactor
//! and never mutated afterwards. Page 0 carries the tier metadata, pages
//! `1..=root_pages` form the sparse root index, and data pages follow:
//!
//! ```text
//! page 0            root metadata (compacted_page_count, sub file id, key types)
//! page 1..=R        sparse root: (max key of data page, data page no) ascending
//! page R+1..count   data pages, globally sorted, one entry per key
//! ```
//!
//! A lookup binary-searches the root entries for the first data page whose
//! max key covers the probe, then binary-searches that single page —
//! O(log root entries + log page entries) instead of a scan over every data
//! page. A key whose value list outgrew one page continues in the entries of
//! the following pages; the lookup follows the run as long as it keeps
//! matching.
//!
//! Tombstones never appear here: the compactor resolves them during the
//! merge, so every stored value is live. The tier still has no standalone
//! iterator — ordered traversal goes through the merged cursor, which is
//! where fresh mutable-tier tombstones get applied.

use eyre::Result;

use super::page::{IndexPage, SearchResult, TierMeta};
use super::Lookup;
use crate::index::page::{read_compacted_root, CompactedRoot};
use crate::storage::{FileManager, PageId};
use crate::tx::PageView;

#[derive(Debug, Clone)]
pub(crate) struct CompactedTier {
    file_id: u32,
    /// Sparse root pages between the metadata page and the data pages.
    root_pages: u32,
    /// Total physical pages in the tier file.
    page_count: u32,
}

impl CompactedTier {
    pub fn new(file_id: u32, root_pages: u32, page_count: u32) -> Self {
        Self {
            file_id,
            root_pages,
            page_count,
        }
    }

    /// Read a tier back from its file, returning the descriptor and the
    /// stored root metadata.
    pub fn open(files: &FileManager, file_id: u32) -> Result<(Self, CompactedRoot)> {
        let page = files.read_page(PageId::new(file_id, 0))?;
        let root = read_compacted_root(&page)?;
        let page_count = files.page_count(file_id)?;
        Ok((
            Self::new(file_id, root.compacted_page_count, page_count),
            root,
        ))
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn first_data_page(&self) -> u32 {
        1 + self.root_pages
    }

    pub fn last_page(&self) -> u32 {
        self.page_count - 1
    }

    pub fn data_page_count(&self) -> u32 {
        self.page_count - 1 - self.root_pages
    }

    /// Root descent: the first data page whose max key is >= `key`, or
    /// `None` when `key` is beyond every stored key.
    pub fn locate_data_page(
        &self,
        view: PageView<'_>,
        columns: usize,
        key: &[u8],
    ) -> Result<Option<u32>> {
        for root_no in 1..=self.root_pages {
            let page = view.page(PageId::new(self.file_id, root_no))?;
            let node = IndexPage::from_page(&page, columns);
            let count = node.entry_count();
            if count == 0 || node.key_at(count - 1)? < key {
                continue;
            }
            let idx = match node.search(key)? {
                SearchResult::Found(idx) => idx,
                SearchResult::NotFound(idx) => idx,
            };
            // A value list chunked across pages registers one reference per
            // chunk page under the same max key; descent starts at the run's
            // first chunk, which is the smallest page number of the run.
            let (run_key, mut data_page) = node.page_ref_at(idx)?;
            for next in idx + 1..count {
                let (ref_key, page_no) = node.page_ref_at(next)?;
                if ref_key != run_key {
                    break;
                }
                data_page = data_page.min(page_no);
            }
            return Ok(Some(data_page));
        }
        Ok(None)
    }

    /// Continue a lookup that fell through the mutable tier. The suppression
    /// state accumulated there still applies to everything found here.
    pub fn lookup(
        &self,
        view: PageView<'_>,
        meta: &TierMeta,
        key: &[u8],
        bf_prefix: &[u8],
        state: &mut Lookup,
    ) -> Result<()> {
        let columns = meta.key_types.len();
        let Some(mut page_no) = self.locate_data_page(view, columns, key)? else {
            return Ok(());
        };

        loop {
            let page = view.page(PageId::new(self.file_id, page_no))?;
            let node = IndexPage::from_page(&page, columns);
            if !node.may_contain(bf_prefix) {
                return Ok(());
            }
            let SearchResult::Found(first) = node.search(key)? else {
                return Ok(());
            };
            let count = node.entry_count();
            let mut idx = first;
            while idx < count {
                let entry = node.entry_at(idx)?;
                if entry.key != key {
                    return Ok(());
                }
                for rid in entry.values() {
                    state.absorb(rid?);
                    if state.done() {
                        return Ok(());
                    }
                }
                idx += 1;
            }
            // The run reached the page end; an oversized value list may
            // continue on the next data page.
            if page_no >= self.last_page() {
                return Ok(());
            }
            page_no += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::KeyEncoder;
    use crate::index::page::{write_compacted_root, IndexPageMut};
    use crate::index::{IndexRegistry, Rid};
    use crate::storage::Page;
    use crate::tx::{FileLockManager, TransactionContext};
    use crate::types::{KeyType, Value};
    use std::time::Duration;

    fn encode(v: i64) -> Vec<u8> {
        let mut encoder = KeyEncoder::new();
        encoder
            .encode(&[Value::Int(v)], &[KeyType::Int])
            .unwrap()
            .to_vec()
    }

    /// Hand-build a tier with one root page and two data pages of ten keys
    /// each: 0..10 on page 2, 10..20 on page 3.
    fn build_tier(files: &FileManager) -> (CompactedTier, TierMeta) {
        let meta = TierMeta::new(vec![KeyType::Int], 0);
        let file_id = files.create_file().unwrap();

        let mut tx = TransactionContext::new(1);
        tx.begin().unwrap();

        let root = tx.page_mut(files, PageId::new(file_id, 0)).unwrap();
        write_compacted_root(
            root,
            &CompactedRoot {
                compacted_page_count: 1,
                sub_index_file_id: 0,
                meta: meta.clone(),
            },
        )
        .unwrap();

        let sparse_id = tx.allocate_page(files, file_id).unwrap();
        {
            let page = tx.page_mut(files, sparse_id).unwrap();
            IndexPageMut::init(page, 1, 0).unwrap();
        }

        for (page_idx, range) in [(0i64..10), (10i64..20)].into_iter().enumerate() {
            let data_id = tx.allocate_page(files, file_id).unwrap();
            let mut max_key = Vec::new();
            {
                let page = tx.page_mut(files, data_id).unwrap();
                let mut node = IndexPageMut::init(page, 1, 7).unwrap();
                for v in range {
                    let key = encode(v);
                    assert!(node.append_entry(&key, &key, &[Rid::new(0, v)]).unwrap());
                    max_key = key;
                }
            }
            let page = tx.page_mut(files, sparse_id).unwrap();
            let mut node = IndexPageMut::from_page(page, 1);
            assert!(node.append_page_ref(&max_key, 2 + page_idx as u32).unwrap());
        }

        let locks = FileLockManager::new(Duration::from_secs(1));
        tx.commit(files, None, &locks, &IndexRegistry::new()).unwrap();

        (CompactedTier::new(file_id, 1, 4), meta)
    }

    fn lookup(tier: &CompactedTier, files: &FileManager, meta: &TierMeta, v: i64) -> Vec<Rid> {
        let key = encode(v);
        let mut state = Lookup::new(usize::MAX);
        tier.lookup(PageView::Committed(files), meta, &key, &key, &mut state)
            .unwrap();
        state.into_results().into_iter().collect()
    }

    #[test]
    fn root_descent_finds_the_right_data_page() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        let (tier, _meta) = build_tier(&files);
        let view = PageView::Committed(&files);

        assert_eq!(tier.locate_data_page(view, 1, &encode(0)).unwrap(), Some(2));
        assert_eq!(tier.locate_data_page(view, 1, &encode(9)).unwrap(), Some(2));
        assert_eq!(tier.locate_data_page(view, 1, &encode(10)).unwrap(), Some(3));
        assert_eq!(tier.locate_data_page(view, 1, &encode(19)).unwrap(), Some(3));
        assert_eq!(tier.locate_data_page(view, 1, &encode(20)).unwrap(), None);
    }

    #[test]
    fn lookup_hits_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        let (tier, meta) = build_tier(&files);

        for v in 0..20i64 {
            assert_eq!(lookup(&tier, &files, &meta, v), vec![Rid::new(0, v)]);
        }
        assert!(lookup(&tier, &files, &meta, 20).is_empty());
        assert!(lookup(&tier, &files, &meta, -1).is_empty());

        // A key between pages: 9 is the max of page 2, 10 the min of page 3.
        assert_eq!(lookup(&tier, &files, &meta, 9), vec![Rid::new(0, 9)]);
    }

    #[test]
    fn suppression_from_the_mutable_tier_carries_over() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        let (tier, meta) = build_tier(&files);

        let key = encode(5);
        let mut state = Lookup::new(usize::MAX);
        // Simulate a per-RID tombstone seen in the mutable tier first.
        state.absorb(Rid::new(0, 5).tombstone().unwrap());
        tier.lookup(PageView::Committed(&files), &meta, &key, &key, &mut state)
            .unwrap();
        assert!(state.into_results().is_empty());
    }

    #[test]
    fn open_round_trips_the_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        let (tier, meta) = build_tier(&files);

        let (reopened, root) = CompactedTier::open(&files, tier.file_id()).unwrap();
        assert_eq!(reopened.root_pages, 1);
        assert_eq!(reopened.page_count, 4);
        assert_eq!(reopened.data_page_count(), 2);
        assert_eq!(root.meta, meta);
    }
}
