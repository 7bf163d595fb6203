//! # File Manager: the Page Store
//!
//! The `FileManager` owns every index file of a database directory and is
//! the engine's page store: fixed-size page read/write keyed by
//! `(file_id, page_no)` plus the per-page version counters the optimistic
//! commit check compares against.
//!
//! ## Directory Layout
//!
//! ```text
//! database_dir/
//! ├── catalog.strata       # index name -> file id mapping (written by Database)
//! ├── wal.strata           # write-ahead log (written by Wal)
//! ├── 000001.idx           # one mutable or compacted tier per file
//! ├── 000002.idx
//! └── ...
//! ```
//!
//! File ids are encoded in the file name, so reopening a database recovers
//! the id space by scanning the directory. A freshly created file has one
//! physical zeroed page; page 0 becomes the tier's root page in the creating
//! transaction.
//!
//! ## Versions
//!
//! Page versions are in-process optimistic-concurrency counters, not
//! persisted state: every committed write of a page bumps its counter, and a
//! transaction that read version `v` can only commit while the counter still
//! is `v`. After a restart all counters start at zero, which is sound
//! because no transaction survives a restart either.
//!
//! ## Concurrency
//!
//! Reads share a `parking_lot::RwLock`; `apply` (commit) and file
//! creation/drop take the write side. Committers additionally serialize per
//! file through the `FileLockManager` before calling `apply`, so two
//! transactions never race an apply on the same file.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::mmap::MmapStorage;
use super::page::{Page, PageId};
use crate::config::PAGE_SIZE;

const INDEX_FILE_EXT: &str = "idx";

pub fn index_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{:06}.{}", file_id, INDEX_FILE_EXT))
}

struct FileState {
    storage: MmapStorage,
    versions: HashMap<u32, u64>,
}

struct Inner {
    files: HashMap<u32, FileState>,
    next_file_id: u32,
}

pub struct FileManager {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl FileManager {
    /// Open a database directory, registering every index file found in it.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create database directory '{}'", dir.display()))?;

        let mut files = HashMap::new();
        let mut next_file_id = 1u32;

        for entry in std::fs::read_dir(&dir)
            .wrap_err_with(|| format!("failed to read database directory '{}'", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INDEX_FILE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(file_id) = stem.parse::<u32>() else {
                continue;
            };
            let storage = MmapStorage::open(&path)?;
            files.insert(
                file_id,
                FileState {
                    storage,
                    versions: HashMap::new(),
                },
            );
            next_file_id = next_file_id.max(file_id + 1);
        }

        Ok(Self {
            dir,
            inner: RwLock::new(Inner {
                files,
                next_file_id,
            }),
        })
    }

    /// Create a fresh index file with one zeroed page (the future root).
    pub fn create_file(&self) -> Result<u32> {
        let mut inner = self.inner.write();
        let file_id = inner.next_file_id;
        let storage = MmapStorage::create(index_file_path(&self.dir, file_id), 1)?;
        inner.files.insert(
            file_id,
            FileState {
                storage,
                versions: HashMap::new(),
            },
        );
        inner.next_file_id = file_id + 1;
        Ok(file_id)
    }

    /// Drop a file from the registry and delete it from disk.
    pub fn drop_file(&self, file_id: u32) -> Result<()> {
        let mut inner = self.inner.write();
        ensure!(
            inner.files.remove(&file_id).is_some(),
            "cannot drop unknown file {}",
            file_id
        );
        drop(inner);
        std::fs::remove_file(index_file_path(&self.dir, file_id))
            .wrap_err_with(|| format!("failed to delete index file {}", file_id))
    }

    pub fn has_file(&self, file_id: u32) -> bool {
        self.inner.read().files.contains_key(&file_id)
    }

    pub fn file_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.inner.read().files.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn page_count(&self, file_id: u32) -> Result<u32> {
        let inner = self.inner.read();
        match inner.files.get(&file_id) {
            Some(state) => Ok(state.storage.page_count()),
            None => bail!("unknown file {}", file_id),
        }
    }

    /// Copy one page out of the store, together with its current version.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        let inner = self.inner.read();
        let Some(state) = inner.files.get(&id.file_id) else {
            bail!("unknown file {}", id.file_id);
        };
        let bytes = state
            .storage
            .page(id.page_no)
            .wrap_err_with(|| format!("failed to read page {}", id))?;
        let version = state.versions.get(&id.page_no).copied().unwrap_or(0);
        Page::from_bytes(id, version, bytes)
    }

    pub fn current_version(&self, id: PageId) -> u64 {
        let inner = self.inner.read();
        inner
            .files
            .get(&id.file_id)
            .and_then(|state| state.versions.get(&id.page_no).copied())
            .unwrap_or(0)
    }

    /// Write committed page images in place, growing files to the supplied
    /// per-file page counts first and bumping each written page's version.
    /// Called by the commit protocol under the per-file locks.
    pub fn apply(&self, pages: &[&Page], new_counts: &[(u32, u32)]) -> Result<()> {
        let mut inner = self.inner.write();

        for &(file_id, count) in new_counts {
            let Some(state) = inner.files.get_mut(&file_id) else {
                bail!("unknown file {} in commit", file_id);
            };
            state.storage.grow(count)?;
        }

        for page in pages {
            let id = page.id();
            let Some(state) = inner.files.get_mut(&id.file_id) else {
                bail!("unknown file {} in commit", id.file_id);
            };
            state
                .storage
                .page_mut(id.page_no)
                .wrap_err_with(|| format!("failed to write page {}", id))?
                .copy_from_slice(page.data());
            *state.versions.entry(id.page_no).or_insert(0) += 1;
        }

        Ok(())
    }

    /// Write one raw page image, growing the file if needed. Used by WAL
    /// recovery, before any transaction runs.
    pub fn apply_image(&self, id: PageId, image: &[u8]) -> Result<()> {
        ensure!(
            image.len() == PAGE_SIZE,
            "invalid page image size: {} != {}",
            image.len(),
            PAGE_SIZE
        );
        let mut inner = self.inner.write();
        let Some(state) = inner.files.get_mut(&id.file_id) else {
            bail!("unknown file {} in recovery", id.file_id);
        };
        if id.page_no >= state.storage.page_count() {
            state.storage.grow(id.page_no + 1)?;
        }
        state.storage.page_mut(id.page_no)?.copy_from_slice(image);
        Ok(())
    }

    /// Flush every file's dirty pages to disk.
    pub fn sync_all(&self) -> Result<()> {
        let inner = self.inner.read();
        for state in inner.files.values() {
            state.storage.sync()?;
        }
        Ok(())
    }
}
