//! # Mutable Index Tier
//!
//! The append-oriented half of a two-tier index. Pages fill in order; page 0
//! is the tier's root (metadata only), data pages start at 1 and only the
//! highest-numbered page ever accepts new entries. Nothing in a mutable tier
//! is rewritten in place — a delete appends a tombstone value, and stale
//! entries survive physically until compaction folds the tier away. The one
//! exception is the documented two-path remove: a single-RID delete may patch
//! the matching value slot of the still-open last page instead of appending.
//!
//! Lookups scan pages newest to oldest, so the most recently written state
//! for a key always wins; per-page Bloom filters make the misses cheap.
//!
//! All page access goes through a [`TransactionContext`] overlay, so tier
//! mutations commit (or roll back) together with everything else the
//! transaction touched.

use eyre::{ensure, Result};

use super::page::{IndexPage, IndexPageMut, SearchResult, TierMeta};
use super::{Lookup, Rid};
use crate::config::MAX_ENCODED_KEY_SIZE;
use crate::storage::{FileManager, PageId};
use crate::tx::{PageView, TransactionContext};

#[derive(Debug, Clone)]
pub(crate) struct MutableTier {
    file_id: u32,
    /// Pages below this boundary are frozen: an in-flight compaction has
    /// snapshotted them as merge sources, so appends and patches must land
    /// on later pages. Page 0 (the root) is always frozen.
    sealed_pages: u32,
}

impl MutableTier {
    pub fn new(file_id: u32) -> Self {
        Self {
            file_id,
            sealed_pages: 1,
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Freeze every page below `page_count` for the duration of a
    /// compaction. Subsequent writes allocate past the boundary.
    pub fn seal(&mut self, page_count: u32) {
        self.sealed_pages = self.sealed_pages.max(page_count).max(1);
    }

    /// Collect values for `key` into `state`, scanning pages newest to
    /// oldest. Stops early once the lookup is satisfied or a whole-key
    /// tombstone proves everything older is dead.
    pub fn lookup(
        &self,
        view: PageView<'_>,
        meta: &TierMeta,
        key: &[u8],
        bf_prefix: &[u8],
        state: &mut Lookup,
    ) -> Result<()> {
        let columns = meta.key_types.len();
        let page_count = view.page_count(self.file_id)?;
        for page_no in (1..page_count).rev() {
            let page = view.page(PageId::new(self.file_id, page_no))?;
            let node = IndexPage::from_page(&page, columns);
            if !node.may_contain(bf_prefix) {
                continue;
            }
            let SearchResult::Found(first) = node.search(key)? else {
                continue;
            };
            let count = node.entry_count();
            let mut idx = first;
            while idx < count {
                let entry = node.entry_at(idx)?;
                if entry.key != key {
                    break;
                }
                for rid in entry.values() {
                    state.absorb(rid?);
                    if state.done() {
                        return Ok(());
                    }
                }
                idx += 1;
            }
        }
        Ok(())
    }

    /// Insert `rid` under `key`. Uniqueness is the caller's concern: the
    /// commit protocol validates unique keys under the page lock before
    /// this runs.
    pub fn put(
        &self,
        tx: &mut TransactionContext,
        files: &FileManager,
        meta: &TierMeta,
        key: &[u8],
        bf_prefix: &[u8],
        rid: Rid,
    ) -> Result<()> {
        self.append(tx, files, meta, key, bf_prefix, &[rid])
    }

    /// Delete every value of `key` by appending the whole-key tombstone.
    pub fn remove_all(
        &self,
        tx: &mut TransactionContext,
        files: &FileManager,
        meta: &TierMeta,
        key: &[u8],
        bf_prefix: &[u8],
    ) -> Result<()> {
        self.append(tx, files, meta, key, bf_prefix, &[Rid::REMOVED])
    }

    /// Delete one value of `key`. Two paths: if the still-open last page
    /// holds a live copy of `rid`, its value slot is patched to the
    /// tombstone in place; otherwise a per-RID tombstone is appended like
    /// any other write.
    pub fn remove_rid(
        &self,
        tx: &mut TransactionContext,
        files: &FileManager,
        meta: &TierMeta,
        key: &[u8],
        bf_prefix: &[u8],
        rid: Rid,
    ) -> Result<()> {
        let tombstone = rid.tombstone()?;
        let columns = meta.key_types.len();
        let page_count = tx.page_count(files, self.file_id)?;
        let last = page_count.saturating_sub(1);
        if last >= self.sealed_pages.max(1) {
            let id = PageId::new(self.file_id, last);
            let patch = {
                let page = tx.page(files, id)?;
                let node = IndexPage::from_page(&page, columns);
                find_live_value(&node, key, rid)?
            };
            if let Some((entry_idx, value_idx)) = patch {
                let page = tx.page_mut(files, id)?;
                let mut node = IndexPageMut::from_page(page, columns);
                node.set_value_at(entry_idx, value_idx, tombstone)?;
                return Ok(());
            }
        }
        self.append(tx, files, meta, key, bf_prefix, &[tombstone])
    }

    fn append(
        &self,
        tx: &mut TransactionContext,
        files: &FileManager,
        meta: &TierMeta,
        key: &[u8],
        bf_prefix: &[u8],
        rids: &[Rid],
    ) -> Result<()> {
        ensure!(
            key.len() <= MAX_ENCODED_KEY_SIZE,
            "encoded key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_ENCODED_KEY_SIZE
        );
        let columns = meta.key_types.len();
        let page_count = tx.page_count(files, self.file_id)?;
        let last = page_count.saturating_sub(1);
        if last >= self.sealed_pages.max(1) {
            let page = tx.page_mut(files, PageId::new(self.file_id, last))?;
            let mut node = IndexPageMut::from_page(page, columns);
            if node.append_entry(key, bf_prefix, rids)? {
                return Ok(());
            }
        }

        let id = tx.allocate_page(files, self.file_id)?;
        let page = tx.page_mut(files, id)?;
        let mut node = IndexPageMut::init(page, columns, rand::random())?;
        ensure!(
            node.append_entry(key, bf_prefix, rids)?,
            "index entry does not fit an empty page"
        );
        Ok(())
    }
}

/// Position of the newest live copy of `rid` under `key`, scanning the
/// page's equal-key run newest first. A whole-key tombstone ends the search:
/// anything behind it is already dead.
fn find_live_value(node: &IndexPage<'_>, key: &[u8], rid: Rid) -> Result<Option<(usize, u32)>> {
    let SearchResult::Found(first) = node.search(key)? else {
        return Ok(None);
    };
    let count = node.entry_count();
    let mut idx = first;
    while idx < count {
        let entry = node.entry_at(idx)?;
        if entry.key != key {
            break;
        }
        for value_idx in 0..entry.value_count() {
            let value = entry.value(value_idx)?;
            if value.is_removed_marker() {
                return Ok(None);
            }
            if value == rid {
                return Ok(Some((idx, value_idx)));
            }
        }
        idx += 1;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::KeyEncoder;
    use crate::index::page::write_mutable_root;
    use crate::types::{KeyType, Value};

    fn setup() -> (tempfile::TempDir, FileManager, MutableTier, TierMeta) {
        let dir = tempfile::tempdir().unwrap();
        let files = FileManager::open(dir.path()).unwrap();
        let file_id = files.create_file().unwrap();
        let meta = TierMeta::new(vec![KeyType::Int], 0);

        let mut root = files.read_page(PageId::new(file_id, 0)).unwrap();
        write_mutable_root(&mut root, &meta).unwrap();
        files.apply(&[&root], &[]).unwrap();

        (dir, files, MutableTier::new(file_id), meta)
    }

    fn begin(txn_id: u64) -> TransactionContext {
        let mut tx = TransactionContext::new(txn_id);
        tx.begin().unwrap();
        tx
    }

    fn encode(encoder: &mut KeyEncoder, v: i64) -> Vec<u8> {
        encoder
            .encode(&[Value::Int(v)], &[KeyType::Int])
            .unwrap()
            .to_vec()
    }

    fn get(
        tier: &MutableTier,
        tx: &TransactionContext,
        files: &FileManager,
        meta: &TierMeta,
        key: &[u8],
    ) -> Vec<Rid> {
        let mut state = Lookup::new(usize::MAX);
        tier.lookup(PageView::Overlay { tx, files }, meta, key, key, &mut state)
            .unwrap();
        state.into_results().into_iter().collect()
    }

    #[test]
    fn put_then_lookup_through_overlay() {
        let (_dir, files, tier, meta) = setup();
        let mut encoder = KeyEncoder::new();
        let mut tx = begin(1);

        let key = encode(&mut encoder, 42);
        tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(1, 7))
            .unwrap();

        assert_eq!(get(&tier, &tx, &files, &meta, &key), vec![Rid::new(1, 7)]);
        let absent = encode(&mut encoder, 43);
        assert!(get(&tier, &tx, &files, &meta, &absent).is_empty());
    }

    #[test]
    fn newest_page_wins_across_page_boundaries() {
        let (_dir, files, tier, meta) = setup();
        let mut encoder = KeyEncoder::new();
        let mut tx = begin(1);

        // Fill past one page so the probe key's history spans pages.
        let probe = encode(&mut encoder, -1);
        tier.put(&mut tx, &files, &meta, &probe, &probe, Rid::new(0, 1))
            .unwrap();
        for v in 0..4000i64 {
            let key = encode(&mut encoder, v);
            tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(1, v))
                .unwrap();
        }
        assert!(tx.page_count(&files, tier.file_id()).unwrap() > 2);

        tier.put(&mut tx, &files, &meta, &probe, &probe, Rid::new(0, 2))
            .unwrap();

        let got = get(&tier, &tx, &files, &meta, &probe);
        assert_eq!(got, vec![Rid::new(0, 1), Rid::new(0, 2)]);
    }

    #[test]
    fn whole_key_tombstone_shadows_older_entries() {
        let (_dir, files, tier, meta) = setup();
        let mut encoder = KeyEncoder::new();
        let mut tx = begin(1);

        let key = encode(&mut encoder, 5);
        tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(1, 1))
            .unwrap();
        tier.remove_all(&mut tx, &files, &meta, &key, &key).unwrap();

        assert!(get(&tier, &tx, &files, &meta, &key).is_empty());

        // A later put resurrects the key without touching the tombstone.
        tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(1, 2))
            .unwrap();
        assert_eq!(get(&tier, &tx, &files, &meta, &key), vec![Rid::new(1, 2)]);
    }

    #[test]
    fn remove_rid_patches_open_page_in_place() {
        let (_dir, files, tier, meta) = setup();
        let mut encoder = KeyEncoder::new();
        let mut tx = begin(1);

        let key = encode(&mut encoder, 9);
        tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(2, 10))
            .unwrap();
        tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(2, 11))
            .unwrap();

        let entries_before = {
            let page = tx.page(&files, PageId::new(tier.file_id(), 1)).unwrap();
            IndexPage::from_page(&page, 1).entry_count()
        };

        tier.remove_rid(&mut tx, &files, &meta, &key, &key, Rid::new(2, 11))
            .unwrap();

        // In-place patch: no new entry was appended.
        let page = tx.page(&files, PageId::new(tier.file_id(), 1)).unwrap();
        assert_eq!(IndexPage::from_page(&page, 1).entry_count(), entries_before);
        assert_eq!(get(&tier, &tx, &files, &meta, &key), vec![Rid::new(2, 10)]);
    }

    #[test]
    fn remove_rid_appends_tombstone_when_page_is_sealed() {
        let (_dir, files, mut tier, meta) = setup();
        let mut encoder = KeyEncoder::new();

        let key = encode(&mut encoder, 3);
        let mut tx = begin(1);
        tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(4, 40))
            .unwrap();
        let registry = crate::index::IndexRegistry::new();
        let locks = crate::tx::FileLockManager::new(std::time::Duration::from_secs(1));
        tx.commit(&files, None, &locks, &registry).unwrap();

        tier.seal(files.page_count(tier.file_id()).unwrap());

        let mut tx = begin(2);
        tier.remove_rid(&mut tx, &files, &meta, &key, &key, Rid::new(4, 40))
            .unwrap();

        // The sealed page was not patched; the tombstone went to a new page.
        assert_eq!(tx.page_count(&files, tier.file_id()).unwrap(), 3);
        assert!(get(&tier, &tx, &files, &meta, &key).is_empty());
    }

    #[test]
    fn per_rid_tombstone_suppresses_only_its_target() {
        let (_dir, files, tier, meta) = setup();
        let mut encoder = KeyEncoder::new();
        let mut tx = begin(1);

        let key = encode(&mut encoder, 8);
        for position in 0..3 {
            tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(1, position))
                .unwrap();
        }
        tier.remove_rid(&mut tx, &files, &meta, &key, &key, Rid::new(1, 1))
            .unwrap();

        assert_eq!(
            get(&tier, &tx, &files, &meta, &key),
            vec![Rid::new(1, 0), Rid::new(1, 2)]
        );
    }

    #[test]
    fn lookup_respects_limit() {
        let (_dir, files, tier, meta) = setup();
        let mut encoder = KeyEncoder::new();
        let mut tx = begin(1);

        let key = encode(&mut encoder, 1);
        for position in 0..10 {
            tier.put(&mut tx, &files, &meta, &key, &key, Rid::new(1, position))
                .unwrap();
        }

        let mut state = Lookup::new(4);
        tier.lookup(
            PageView::Overlay {
                tx: &tx,
                files: &files,
            },
            &meta,
            &key,
            &key,
            &mut state,
        )
        .unwrap();
        assert_eq!(state.into_results().len(), 4);
    }

    #[test]
    fn oversized_key_rejected() {
        let (_dir, files, tier, meta) = setup();
        let mut tx = begin(1);
        let huge = vec![0x20u8; MAX_ENCODED_KEY_SIZE + 1];
        assert!(tier
            .put(&mut tx, &files, &meta, &huge, &huge, Rid::new(0, 0))
            .is_err());
    }
}
