//! # Database Facade
//!
//! The composition root: one [`Database`] owns the page store, the WAL, the
//! per-file commit locks and the index registry, and wires them into every
//! operation. All state lives in one directory:
//!
//! ```text
//! database_dir/
//! ├── catalog.strata       # index name -> tier file assignments
//! ├── wal.strata           # write-ahead log
//! ├── 000001.idx           # one tier (mutable or compacted) per file
//! └── ...
//! ```
//!
//! ## Open Sequence
//!
//! 1. Register every `.idx` file in the directory.
//! 2. Replay the WAL: after-images of complete records are written back to
//!    the page files (images for files that no longer exist are skipped),
//!    then the files are synced and the log truncated.
//! 3. Load the catalog and rebuild the index registry, validating each
//!    entry against its tier root pages.
//! 4. Drop files no catalog entry references — the leftovers of a crash
//!    mid-compaction.
//! 5. Optionally start the background compaction thread.
//!
//! ## Transactions
//!
//! [`Database::begin`] hands out a plain [`TransactionContext`] value; the
//! caller queues index operations on it and passes it back to
//! [`Database::commit`]. The single-call [`Database::put`] / `remove`
//! convenience wrappers run the same protocol as an auto-committed
//! transaction, so unique checks always happen under the page locks.
//!
//! ## Checkpoints
//!
//! Commits hold the read side of a gate around their WAL append and page
//! apply; when the log passes the configured size, a checkpoint takes the
//! write side, syncs every page file and truncates the log. The compactor's
//! tier swap shares the same gate.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, WalFlush};
use crate::error::EngineError;
use crate::index::page::{read_mutable_root, write_mutable_root, TierMeta};
use crate::index::{
    compact, CatalogSink, CompactedTier, CompactionContext, Index, IndexCursor, IndexRegistry,
    MutableTier, Rid,
};
use crate::storage::{FileManager, PageId, PageReader};
use crate::tx::{FileLockManager, PageView, TransactionContext};
use crate::types::{KeyType, Value};
use crate::wal::Wal;

const CATALOG_FILE_NAME: &str = "catalog.strata";
const CATALOG_TMP_NAME: &str = "catalog.tmp";
const CATALOG_MAGIC: u32 = 0x5343_4154; // "SCAT"
const CATALOG_VERSION: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub struct Database {
    inner: Arc<DbInner>,
    compaction_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

pub(crate) struct DbInner {
    dir: PathBuf,
    config: DatabaseConfig,
    files: FileManager,
    wal: Option<Wal>,
    locks: FileLockManager,
    indexes: IndexRegistry,
    txn_ids: AtomicU64,
    /// Commits and the tier swap hold the read side around WAL append plus
    /// page apply; a checkpoint holds the write side.
    commit_gate: RwLock<()>,
    /// Serializes catalog rewrites (create/drop/swap can race).
    catalog_lock: Mutex<()>,
    stop: AtomicBool,
}

#[derive(Default)]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    config: DatabaseConfig,
}

impl DatabaseBuilder {
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn wal_enabled(mut self, enabled: bool) -> Self {
        self.config.wal_enabled = enabled;
        self
    }

    pub fn wal_flush(mut self, flush: WalFlush) -> Self {
        self.config.wal_flush = flush;
        self
    }

    pub fn wal_checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.config.wal_checkpoint_bytes = bytes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn compaction_ram(mut self, bytes: usize) -> Self {
        self.config.compaction_ram = bytes;
        self
    }

    pub fn compaction_page_threshold(mut self, pages: u32) -> Self {
        self.config.compaction_page_threshold = pages;
        self
    }

    pub fn auto_compaction(mut self, enabled: bool) -> Self {
        self.config.auto_compaction = enabled;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.config.compaction_interval = interval;
        self
    }

    pub fn open(self) -> Result<Database> {
        let dir = self
            .path
            .ok_or_else(|| eyre::eyre!("database path not set"))?;
        let config = self.config;
        let files = FileManager::open(&dir)?;

        // Recovery before anything reads pages: replay complete WAL records
        // into the page files, sync, then start a fresh log.
        let records = Wal::replay(&dir)?;
        if !records.is_empty() {
            let mut applied = 0usize;
            for record in &records {
                for (id, image) in &record.after_images {
                    if !files.has_file(id.file_id) {
                        warn!(page = %id, "skipping recovery image for dropped file");
                        continue;
                    }
                    files.apply_image(*id, image)?;
                    applied += 1;
                }
            }
            files.sync_all()?;
            info!(records = records.len(), pages = applied, "wal recovery complete");
        }
        let wal = Wal::open(&dir, config.wal_flush)?;
        wal.truncate()?;
        let wal = config.wal_enabled.then_some(wal);

        let inner = Arc::new(DbInner {
            locks: FileLockManager::new(config.lock_timeout),
            indexes: IndexRegistry::new(),
            txn_ids: AtomicU64::new(0),
            commit_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            dir,
            config,
            files,
            wal,
        });
        inner.load_catalog()?;
        inner.drop_orphan_files()?;

        let db = Database {
            inner,
            compaction_thread: Mutex::new(None),
        };
        if db.inner.config.auto_compaction {
            db.start_compaction_thread()?;
        }
        Ok(db)
    }
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Open (or create) a database directory with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Create a new index over the given key columns. `bf_key_depth` limits
    /// Bloom-filter hashing to that many leading columns (0 = whole key).
    pub fn create_index(
        &self,
        name: &str,
        key_types: &[KeyType],
        unique: bool,
        bf_key_depth: u8,
    ) -> Result<Arc<Index>> {
        ensure!(
            !name.is_empty() && name.len() <= 255,
            "index name must be 1..=255 bytes"
        );
        ensure!(!key_types.is_empty(), "index needs at least one key column");
        ensure!(
            (bf_key_depth as usize) <= key_types.len(),
            "bf_key_depth {} exceeds the {} key columns",
            bf_key_depth,
            key_types.len()
        );
        ensure!(
            self.inner.indexes.get(name).is_none(),
            "index '{}' already exists",
            name
        );

        let file_id = self.inner.files.create_file()?;
        let meta = TierMeta::new(key_types.to_vec(), bf_key_depth);
        let written = (|| -> Result<()> {
            let mut tx = self.begin()?;
            {
                let page = tx.page_mut(&self.inner.files, PageId::new(file_id, 0))?;
                write_mutable_root(page, &meta)?;
            }
            self.commit(&mut tx)
        })();
        if let Err(e) = written {
            let _ = self.inner.files.drop_file(file_id);
            return Err(e.wrap_err(format!("failed to initialize index '{}'", name)));
        }

        let index = Arc::new(Index::new(
            name.to_string(),
            unique,
            meta,
            MutableTier::new(file_id),
            None,
        ));
        self.inner.indexes.insert(Arc::clone(&index));
        if let Err(e) = self.inner.persist_catalog() {
            self.inner.indexes.remove(name);
            let _ = self.inner.files.drop_file(file_id);
            return Err(e);
        }
        info!(index = name, file = file_id, "index created");
        Ok(index)
    }

    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.inner.indexes.get(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.inner.indexes.names()
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let Some(index) = self.inner.indexes.get(name) else {
            bail!("unknown index '{}'", name);
        };
        // The mutable file lock serializes against in-flight commits.
        let guard = self.inner.locks.acquire(index.mutable_file_id())?;
        self.inner.indexes.remove(name);
        self.inner.persist_catalog()?;
        let (mutable_fid, compacted_fid) = {
            let tiers = index.tiers();
            (
                tiers.mutable.file_id(),
                tiers.compacted.as_ref().map(|tier| tier.file_id()),
            )
        };
        drop(guard);

        if let Err(e) = self.inner.files.drop_file(mutable_fid) {
            warn!(file = mutable_fid, error = %e, "failed to drop index file");
        }
        if let Some(fid) = compacted_fid {
            if let Err(e) = self.inner.files.drop_file(fid) {
                warn!(file = fid, error = %e, "failed to drop index file");
            }
        }
        info!(index = name, "index dropped");
        Ok(())
    }

    /// Start a transaction. The returned context is a plain value; pass it
    /// back to [`Database::commit`] or [`Database::rollback`].
    pub fn begin(&self) -> Result<TransactionContext> {
        let mut tx = TransactionContext::new(self.inner.next_txn_id());
        tx.begin()?;
        Ok(tx)
    }

    /// Run the commit protocol for `tx` and take a WAL checkpoint when the
    /// log has outgrown its budget.
    pub fn commit(&self, tx: &mut TransactionContext) -> Result<()> {
        {
            let _gate = self.inner.commit_gate.read();
            tx.commit(
                &self.inner.files,
                self.inner.wal.as_ref(),
                &self.inner.locks,
                &self.inner.indexes,
            )?;
        }
        self.inner.maybe_checkpoint();
        Ok(())
    }

    pub fn rollback(&self, tx: &mut TransactionContext) {
        tx.rollback();
    }

    /// Insert `rid` under `keys` as an auto-committed transaction.
    pub fn put(&self, index: &Index, keys: &[Value], rid: Rid) -> Result<()> {
        let mut tx = self.begin()?;
        tx.put(index, keys, rid)?;
        self.commit(&mut tx).map_err(|e| {
            tx.rollback();
            e
        })
    }

    /// Remove one value (`rid` given) or the whole key, auto-committed.
    pub fn remove(&self, index: &Index, keys: &[Value], rid: Option<Rid>) -> Result<()> {
        let mut tx = self.begin()?;
        tx.remove(index, keys, rid)?;
        self.commit(&mut tx).map_err(|e| {
            tx.rollback();
            e
        })
    }

    /// Live values for `keys` at the last-committed state. A `limit` of 0
    /// means unlimited.
    pub fn get(&self, index: &Index, keys: &[Value], limit: usize) -> Result<BTreeSet<Rid>> {
        index.get(PageView::Committed(&self.inner.files), keys, limit)
    }

    /// Like [`Database::get`], but reading through `tx`'s page overlay.
    pub fn get_tx(
        &self,
        tx: &TransactionContext,
        index: &Index,
        keys: &[Value],
        limit: usize,
    ) -> Result<BTreeSet<Rid>> {
        index.get(
            PageView::Overlay {
                tx,
                files: &self.inner.files,
            },
            keys,
            limit,
        )
    }

    /// Full ordered scan over both tiers.
    pub fn iterator(&self, index: &Index, ascending: bool) -> Result<IndexCursor<'_>> {
        index.cursor(&self.inner.files, ascending, None, None)
    }

    /// Ascending scan over the inclusive key range `[from, to]`.
    pub fn range(&self, index: &Index, from: &[Value], to: &[Value]) -> Result<IndexCursor<'_>> {
        index.cursor(&self.inner.files, true, Some(from), Some(to))
    }

    /// Fold the named index's mutable tier into a fresh compacted tier.
    /// Returns `false` when there is nothing to compact or a compaction is
    /// already running.
    pub fn compact(&self, name: &str) -> Result<bool> {
        let Some(index) = self.inner.indexes.get(name) else {
            bail!("unknown index '{}'", name);
        };
        let compacted = self.inner.compact_index(&index)?;
        if compacted {
            self.inner.maybe_checkpoint();
        }
        Ok(compacted)
    }

    fn start_compaction_thread(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("strata-compactor".into())
            .spawn(move || compaction_loop(inner))
            .wrap_err("failed to spawn compaction thread")?;
        *self.compaction_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the background compactor, sync every page file and truncate the
    /// WAL. Called automatically on drop.
    pub fn close(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        if let Some(handle) = self.compaction_thread.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        let _gate = self.inner.commit_gate.write();
        self.inner.files.sync_all()?;
        if let Some(wal) = &self.inner.wal {
            wal.truncate()?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = ?e, "error while closing database");
        }
    }
}

fn compaction_loop(inner: Arc<DbInner>) {
    debug!("background compaction thread started");
    loop {
        std::thread::park_timeout(inner.config.compaction_interval);
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        for index in inner.indexes.all() {
            let pages = match index.mutable_page_count(&inner.files) {
                Ok(pages) => pages,
                Err(e) => {
                    warn!(index = index.name(), error = ?e, "compaction trigger check failed");
                    continue;
                }
            };
            if pages < inner.config.compaction_page_threshold {
                continue;
            }
            match inner.compact_index(&index) {
                Ok(true) => debug!(index = index.name(), "background compaction complete"),
                Ok(false) => {}
                Err(e) => warn!(index = index.name(), error = ?e, "background compaction failed"),
            }
        }
        inner.maybe_checkpoint();
    }
    debug!("background compaction thread stopped");
}

impl DbInner {
    fn next_txn_id(&self) -> u64 {
        self.txn_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn compact_index(&self, index: &Index) -> Result<bool> {
        let ctx = CompactionContext {
            files: &self.files,
            wal: self.wal.as_ref(),
            locks: &self.locks,
            config: &self.config,
            registry: &self.indexes,
            txn_ids: &self.txn_ids,
            catalog: self,
            commit_gate: &self.commit_gate,
        };
        compact(index, &ctx)
    }

    fn maybe_checkpoint(&self) {
        let Some(wal) = &self.wal else { return };
        if wal.size() < self.config.wal_checkpoint_bytes {
            return;
        }
        let _gate = self.commit_gate.write();
        if wal.size() < self.config.wal_checkpoint_bytes {
            return;
        }
        if let Err(e) = self.files.sync_all().and_then(|()| wal.truncate()) {
            warn!(error = ?e, "wal checkpoint failed");
            return;
        }
        debug!("wal checkpoint complete");
    }

    fn load_catalog(&self) -> Result<()> {
        let entries = read_catalog(&self.dir)?;
        for entry in entries {
            let expected = TierMeta::new(entry.key_types.clone(), entry.bf_key_depth);

            let root = self
                .files
                .read_page(PageId::new(entry.mutable_file_id, 0))
                .wrap_err_with(|| format!("missing mutable tier of index '{}'", entry.name))?;
            let meta = read_mutable_root(&root)?;
            if meta != expected {
                return Err(EngineError::Corruption(format!(
                    "index '{}': catalog and tier root disagree on key layout",
                    entry.name
                ))
                .into());
            }

            let compacted = match entry.compacted_file_id {
                Some(file_id) => {
                    let (tier, root) = CompactedTier::open(&self.files, file_id)
                        .wrap_err_with(|| {
                            format!("missing compacted tier of index '{}'", entry.name)
                        })?;
                    if root.meta != expected {
                        return Err(EngineError::Corruption(format!(
                            "index '{}': compacted tier root disagrees on key layout",
                            entry.name
                        ))
                        .into());
                    }
                    Some(tier)
                }
                None => None,
            };

            self.indexes.insert(Arc::new(Index::new(
                entry.name,
                entry.unique,
                expected,
                MutableTier::new(entry.mutable_file_id),
                compacted,
            )));
        }
        Ok(())
    }

    /// Delete index files no catalog entry references: the leftovers of a
    /// crash between creating compaction output files and the tier swap.
    fn drop_orphan_files(&self) -> Result<()> {
        let mut referenced: HashSet<u32> = HashSet::new();
        for index in self.indexes.all() {
            let tiers = index.tiers();
            referenced.insert(tiers.mutable.file_id());
            if let Some(compacted) = &tiers.compacted {
                referenced.insert(compacted.file_id());
            }
        }
        for file_id in self.files.file_ids() {
            if !referenced.contains(&file_id) {
                warn!(file = file_id, "dropping orphaned index file");
                self.files.drop_file(file_id)?;
            }
        }
        Ok(())
    }

    fn persist_catalog(&self) -> Result<()> {
        let _lock = self.catalog_lock.lock();
        let mut entries = Vec::new();
        for index in self.indexes.all() {
            let tiers = index.tiers();
            entries.push(CatalogEntry {
                name: index.name().to_string(),
                unique: index.is_unique(),
                bf_key_depth: index.bf_key_depth(),
                key_types: index.key_types().to_vec(),
                mutable_file_id: tiers.mutable.file_id(),
                compacted_file_id: tiers.compacted.as_ref().map(|tier| tier.file_id()),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        write_catalog(&self.dir, &entries)
    }
}

impl CatalogSink for DbInner {
    fn persist_tiers(&self) -> Result<()> {
        self.persist_catalog()
    }
}

struct CatalogEntry {
    name: String,
    unique: bool,
    bf_key_depth: u8,
    key_types: Vec<KeyType>,
    mutable_file_id: u32,
    compacted_file_id: Option<u32>,
}

fn write_catalog(dir: &Path, entries: &[CatalogEntry]) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&CATALOG_MAGIC.to_le_bytes());
    buf.extend_from_slice(&CATALOG_VERSION.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        buf.push(entry.name.len() as u8);
        buf.extend_from_slice(entry.name.as_bytes());
        buf.push(entry.unique as u8);
        buf.push(entry.bf_key_depth);
        buf.push(entry.key_types.len() as u8);
        for key_type in &entry.key_types {
            buf.push(key_type.as_byte());
        }
        buf.extend_from_slice(&entry.mutable_file_id.to_le_bytes());
        match entry.compacted_file_id {
            Some(file_id) => {
                buf.push(1);
                buf.extend_from_slice(&file_id.to_le_bytes());
            }
            None => buf.push(0),
        }
    }
    let checksum = CRC64.checksum(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());

    // Write-then-rename so a crash never leaves a half-written catalog.
    let tmp = dir.join(CATALOG_TMP_NAME);
    let mut file = std::fs::File::create(&tmp)
        .wrap_err_with(|| format!("failed to create '{}'", tmp.display()))?;
    file.write_all(&buf).wrap_err("failed to write catalog")?;
    file.sync_all().wrap_err("failed to sync catalog")?;
    drop(file);
    std::fs::rename(&tmp, dir.join(CATALOG_FILE_NAME)).wrap_err("failed to publish catalog")
}

fn read_catalog(dir: &Path) -> Result<Vec<CatalogEntry>> {
    let path = dir.join(CATALOG_FILE_NAME);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).wrap_err_with(|| format!("failed to read '{}'", path.display()))
        }
    };
    let corrupt = |msg: &str| EngineError::Corruption(format!("catalog: {}", msg));

    if bytes.len() < 20 {
        return Err(corrupt("file too short").into());
    }
    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 8);
    let stored = u64::from_le_bytes(checksum_bytes.try_into().unwrap());
    if CRC64.checksum(body) != stored {
        return Err(corrupt("checksum mismatch").into());
    }

    let mut r = PageReader::new(body);
    if r.u32()? != CATALOG_MAGIC {
        return Err(corrupt("bad magic").into());
    }
    let version = r.u32()?;
    if version != CATALOG_VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)).into());
    }
    let count = r.u32()?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_len = r.u8()? as usize;
        let name = std::str::from_utf8(r.bytes(name_len)?)
            .map_err(|_| corrupt("index name is not UTF-8"))?
            .to_string();
        let unique = r.u8()? != 0;
        let bf_key_depth = r.u8()?;
        let columns = r.u8()? as usize;
        if columns == 0 {
            return Err(corrupt("index with zero key columns").into());
        }
        let mut key_types = Vec::with_capacity(columns);
        for _ in 0..columns {
            key_types.push(KeyType::from_byte(r.u8()?)?);
        }
        let mutable_file_id = r.u32()?;
        let compacted_file_id = if r.u8()? != 0 { Some(r.u32()?) } else { None };
        entries.push(CatalogEntry {
            name,
            unique,
            bf_key_depth,
            key_types,
            mutable_file_id,
            compacted_file_id,
        });
    }
    Ok(entries)
}
