//! # Two-Tier LSM Index
//!
//! One [`Index`] composes a mutable tier (append-oriented, actively written)
//! and at most one compacted tier (sorted, immutable, produced by the
//! compactor). There is no deeper generation hierarchy: compaction always
//! folds everything into a single fresh compacted tier and swaps both
//! pointers together.
//!
//! The authoritative state of a key is the most recently written entry:
//! mutable pages scanned newest to oldest, then the compacted tier.
//! Tombstone values recorded along the way suppress older occurrences, so
//! deleted data stays invisible even while it still exists physically.
//!
//! Writes never touch pages directly — they queue on a transaction and are
//! validated (unique constraint) and applied during its commit, inside the
//! same per-file lock scope the page commit protocol uses. Reads take the
//! tier pair under a shared lock and run against either the committed store
//! or a transaction's overlay.

mod compacted;
mod compactor;
mod cursor;
mod mutable;
pub mod page;
mod rid;

pub use cursor::IndexCursor;
pub use rid::Rid;

pub(crate) use compacted::CompactedTier;
pub(crate) use compactor::{compact, CatalogSink, CompactionContext};
pub(crate) use mutable::MutableTier;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::encoding::KeyEncoder;
use crate::error::EngineError;
use crate::index::page::TierMeta;
use crate::storage::FileManager;
use crate::tx::{PageView, PendingIndexOp, TransactionContext};
use crate::types::{KeyType, Value};

/// Compaction progress of one index. At most one compaction runs per index;
/// the field is CAS-guarded so concurrent `compact()` calls are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStatus {
    Idle,
    Compacting,
    Swapping,
}

const STATUS_IDLE: u8 = 0;
const STATUS_COMPACTING: u8 = 1;
const STATUS_SWAPPING: u8 = 2;

/// The tier pair, swapped atomically under the write lock when compaction
/// finishes.
pub(crate) struct Tiers {
    pub mutable: MutableTier,
    pub compacted: Option<CompactedTier>,
}

pub struct Index {
    name: String,
    unique: bool,
    meta: TierMeta,
    tiers: RwLock<Tiers>,
    compaction: AtomicU8,
}

impl Index {
    pub(crate) fn new(
        name: String,
        unique: bool,
        meta: TierMeta,
        mutable: MutableTier,
        compacted: Option<CompactedTier>,
    ) -> Self {
        Self {
            name,
            unique,
            meta,
            tiers: RwLock::new(Tiers { mutable, compacted }),
            compaction: AtomicU8::new(STATUS_IDLE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn key_types(&self) -> &[KeyType] {
        &self.meta.key_types
    }

    pub fn bf_key_depth(&self) -> u8 {
        self.meta.bf_key_depth
    }

    pub(crate) fn meta(&self) -> &TierMeta {
        &self.meta
    }

    pub(crate) fn tiers(&self) -> RwLockReadGuard<'_, Tiers> {
        self.tiers.read()
    }

    pub(crate) fn tiers_mut(&self) -> RwLockWriteGuard<'_, Tiers> {
        self.tiers.write()
    }

    /// File id of the current mutable tier; the commit protocol locks this
    /// file for every transaction with pending operations on the index.
    pub(crate) fn mutable_file_id(&self) -> u32 {
        self.tiers.read().mutable.file_id()
    }

    /// Data pages currently in the mutable tier (compaction trigger input).
    pub fn mutable_page_count(&self, files: &FileManager) -> Result<u32> {
        let file_id = self.mutable_file_id();
        Ok(files.page_count(file_id)?.saturating_sub(1))
    }

    pub fn compaction_status(&self) -> CompactionStatus {
        match self.compaction.load(Ordering::Acquire) {
            STATUS_COMPACTING => CompactionStatus::Compacting,
            STATUS_SWAPPING => CompactionStatus::Swapping,
            _ => CompactionStatus::Idle,
        }
    }

    pub(crate) fn try_start_compaction(&self) -> bool {
        self.compaction
            .compare_exchange(
                STATUS_IDLE,
                STATUS_COMPACTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn enter_swap(&self) {
        self.compaction.store(STATUS_SWAPPING, Ordering::Release);
    }

    pub(crate) fn finish_compaction(&self) {
        self.compaction.store(STATUS_IDLE, Ordering::Release);
    }

    /// Check a key tuple against the declared column list.
    pub fn validate_key(&self, keys: &[Value]) -> Result<()> {
        ensure!(
            keys.len() == self.meta.key_types.len(),
            "key has {} columns, index '{}' declares {}",
            keys.len(),
            self.name,
            self.meta.key_types.len()
        );
        for (position, (value, &key_type)) in
            keys.iter().zip(&self.meta.key_types).enumerate()
        {
            ensure!(
                value.matches(key_type),
                "column {} of index '{}': {:?} does not match {:?}",
                position,
                self.name,
                value,
                key_type
            );
        }
        Ok(())
    }

    /// Live values for `keys`, newest state winning across both tiers. A
    /// `limit` of 0 means unlimited.
    pub fn get(
        &self,
        view: PageView<'_>,
        keys: &[Value],
        limit: usize,
    ) -> Result<BTreeSet<Rid>> {
        self.validate_key(keys)?;
        let mut encoder = KeyEncoder::new();
        encoder.encode(keys, &self.meta.key_types)?;
        let key = encoder.encoded();
        let bf_prefix = encoder.prefix(self.meta.bf_key_depth);

        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut state = Lookup::new(limit);

        let tiers = self.tiers.read();
        tiers.mutable.lookup(view, &self.meta, key, bf_prefix, &mut state)?;
        if !state.done() {
            if let Some(compacted) = &tiers.compacted {
                compacted.lookup(view, &self.meta, key, bf_prefix, &mut state)?;
            }
        }
        Ok(state.into_results())
    }

    /// Ordered cursor over both tiers. `from`/`to` are inclusive bounds;
    /// either may be omitted for an open end.
    pub fn cursor<'a>(
        &self,
        files: &'a FileManager,
        ascending: bool,
        from: Option<&[Value]>,
        to: Option<&[Value]>,
    ) -> Result<IndexCursor<'a>> {
        let mut encoder = KeyEncoder::new();
        let lower = match from {
            Some(keys) => {
                self.validate_key(keys)?;
                encoder.encode(keys, &self.meta.key_types)?;
                Some(encoder.encoded().to_vec())
            }
            None => None,
        };
        let upper = match to {
            Some(keys) => {
                self.validate_key(keys)?;
                encoder.encode(keys, &self.meta.key_types)?;
                Some(encoder.encoded().to_vec())
            }
            None => None,
        };

        let tiers = self.tiers.read();
        IndexCursor::new(files, &tiers, &self.meta, ascending, lower, upper)
    }

    /// Apply one queued operation into the transaction's page overlay.
    /// Runs during commit, under the per-file locks, so the unique check
    /// and the write are atomic with respect to other committers.
    pub(crate) fn apply_op(
        &self,
        tx: &mut TransactionContext,
        files: &FileManager,
        op: &PendingIndexOp,
    ) -> Result<()> {
        let mut encoder = KeyEncoder::new();
        encoder.encode(&op.keys, &self.meta.key_types)?;
        let key = encoder.encoded();
        let bf_prefix = encoder.prefix(self.meta.bf_key_depth);

        let tiers = self.tiers.read();
        if op.is_put {
            let rid = op
                .rid
                .ok_or_else(|| eyre::eyre!("queued put without a rid"))?;
            if self.unique {
                let mut state = Lookup::new(2);
                {
                    let view = PageView::Overlay { tx: &*tx, files };
                    tiers.mutable.lookup(view, &self.meta, key, bf_prefix, &mut state)?;
                    if !state.done() {
                        if let Some(compacted) = &tiers.compacted {
                            compacted.lookup(view, &self.meta, key, bf_prefix, &mut state)?;
                        }
                    }
                }
                let live = state.into_results();
                if live.len() > 1 || live.iter().any(|&existing| existing != rid) {
                    return Err(EngineError::DuplicateKey {
                        index: self.name.clone(),
                    }
                    .into());
                }
            }
            tiers.mutable.put(tx, files, &self.meta, key, bf_prefix, rid)
        } else {
            match op.rid {
                Some(rid) => {
                    tiers
                        .mutable
                        .remove_rid(tx, files, &self.meta, key, bf_prefix, rid)
                }
                None => tiers.mutable.remove_all(tx, files, &self.meta, key, bf_prefix),
            }
        }
    }
}

/// Shared registry of open indexes, keyed by name. The commit protocol
/// resolves pending operations through it; the background compactor walks it.
pub struct IndexRegistry {
    inner: RwLock<HashMap<String, std::sync::Arc<Index>>>,
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<Index>> {
        self.inner.read().get(name).cloned()
    }

    pub fn insert(&self, index: std::sync::Arc<Index>) {
        self.inner.write().insert(index.name().to_string(), index);
    }

    pub fn remove(&self, name: &str) -> Option<std::sync::Arc<Index>> {
        self.inner.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<std::sync::Arc<Index>> {
        self.inner.read().values().cloned().collect()
    }
}

/// Accumulator for a point lookup walking newest state to oldest. Tombstones
/// seen on the way suppress older occurrences; a whole-key tombstone halts
/// the walk entirely.
pub(crate) struct Lookup {
    limit: usize,
    results: BTreeSet<Rid>,
    suppressed: HashSet<Rid>,
    halted: bool,
}

impl Lookup {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            results: BTreeSet::new(),
            suppressed: HashSet::new(),
            halted: false,
        }
    }

    /// Feed the next value, in newest-to-oldest order.
    pub fn absorb(&mut self, rid: Rid) {
        if self.halted {
            return;
        }
        if rid.is_removed_marker() {
            self.halted = true;
            return;
        }
        if rid.is_tombstone() {
            if let Ok(target) = rid.tombstone_target() {
                self.suppressed.insert(target);
            }
            return;
        }
        if !self.suppressed.contains(&rid) {
            self.results.insert(rid);
        }
    }

    /// Nothing older can change the outcome.
    pub fn done(&self) -> bool {
        self.halted || self.results.len() >= self.limit
    }

    pub fn into_results(self) -> BTreeSet<Rid> {
        self.results
    }
}

/// Resolve a newest-first value list to its live values, in first-seen
/// order. Used by the compactor when folding merged entries.
pub(crate) fn resolve_live(values: &[Rid]) -> Vec<Rid> {
    let mut suppressed: HashSet<Rid> = HashSet::new();
    let mut seen: HashSet<Rid> = HashSet::new();
    let mut live = Vec::new();
    for &rid in values {
        if rid.is_removed_marker() {
            break;
        }
        if rid.is_tombstone() {
            if let Ok(target) = rid.tombstone_target() {
                suppressed.insert(target);
            }
            continue;
        }
        if !suppressed.contains(&rid) && seen.insert(rid) {
            live.push(rid);
        }
    }
    live
}
