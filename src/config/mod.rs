//! Engine configuration.
//!
//! All tunables are collected in [`DatabaseConfig`]; the on-disk format
//! constants live in [`constants`]. The builder on `Database` is the
//! intended way to customize a config.

mod constants;

pub use constants::*;

use std::time::Duration;

/// When WAL records are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalFlush {
    /// fsync after every commit record. Durable against power loss.
    EveryCommit,
    /// Leave flushing to the OS page cache. Durable against process crash
    /// only.
    OsBuffered,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Write page before/after images to the WAL on commit.
    pub wal_enabled: bool,
    pub wal_flush: WalFlush,
    /// WAL size that triggers a checkpoint after commit.
    pub wal_checkpoint_bytes: u64,
    /// Bound on waiting for one per-file commit lock.
    pub lock_timeout: Duration,
    /// RAM budget for one compaction merge pass.
    pub compaction_ram: usize,
    /// Mutable data-page count that makes an index eligible for background
    /// compaction.
    pub compaction_page_threshold: u32,
    /// Run the background compaction thread.
    pub auto_compaction: bool,
    /// Polling interval of the background compaction thread.
    pub compaction_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            wal_enabled: true,
            wal_flush: WalFlush::EveryCommit,
            wal_checkpoint_bytes: DEFAULT_WAL_CHECKPOINT_BYTES,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            compaction_ram: DEFAULT_COMPACTION_RAM,
            compaction_page_threshold: DEFAULT_COMPACTION_PAGE_THRESHOLD,
            auto_compaction: false,
            compaction_interval: Duration::from_millis(DEFAULT_COMPACTION_INTERVAL_MS),
        }
    }
}

impl DatabaseConfig {
    /// Source pages one merge pass may hold in memory.
    pub fn compaction_pages_per_pass(&self) -> usize {
        (self.compaction_ram / PAGE_SIZE).max(2)
    }
}
