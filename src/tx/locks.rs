//! # Per-File Commit Locks
//!
//! Commit serializes writers at file granularity: every transaction that
//! touches a file must hold that file's lock while it version-checks, logs
//! and applies its pages. There is no separate per-index write mutex — two
//! writers on the same index serialize here, writers on disjoint files run
//! in parallel.
//!
//! ## Deadlock Avoidance
//!
//! [`FileLockManager::acquire_ordered`] sorts the requested file ids and
//! acquires them in ascending order. Any two transactions that touch
//! overlapping file sets therefore request their common locks in the same
//! relative order, which rules out lock-order deadlocks globally.
//!
//! ## Timeouts
//!
//! Each individual acquisition is bounded by the configured timeout; beyond
//! it the commit fails with `EngineError::LockTimeout` instead of blocking
//! forever, and every lock already taken is released by the guards' `Drop`.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::EngineError;

pub struct FileLockManager {
    registry: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
    timeout: Duration,
}

/// Holds one file lock until dropped.
pub struct FileLockGuard {
    file_id: u32,
    lock: Arc<Mutex<()>>,
}

impl FileLockGuard {
    pub fn file_id(&self) -> u32 {
        self.file_id
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // SAFETY: acquire() locked this mutex on this thread and forgot the
        // guard; the lock is held until exactly this point.
        unsafe { self.lock.force_unlock() };
    }
}

impl FileLockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, file_id: u32) -> Arc<Mutex<()>> {
        let mut registry = self.registry.lock();
        Arc::clone(registry.entry(file_id).or_default())
    }

    /// Acquire one file lock, waiting at most the configured timeout.
    pub fn acquire(&self, file_id: u32) -> Result<FileLockGuard> {
        let lock = self.entry(file_id);
        let result = match lock.try_lock_for(self.timeout) {
            Some(guard) => {
                // Keep the mutex locked past this scope; FileLockGuard's
                // Drop releases it.
                std::mem::forget(guard);
                true
            }
            None => false,
        };
        if result {
            Ok(FileLockGuard { file_id, lock })
        } else {
            Err(EngineError::LockTimeout {
                file_id,
                waited_ms: self.timeout.as_millis() as u64,
            }
            .into())
        }
    }

    /// Acquire a set of file locks in ascending file-id order. The input is
    /// sorted and deduplicated in place.
    pub fn acquire_ordered(&self, file_ids: &mut SmallVec<[u32; 8]>) -> Result<Vec<FileLockGuard>> {
        file_ids.sort_unstable();
        file_ids.dedup();

        let mut guards = Vec::with_capacity(file_ids.len());
        for &file_id in file_ids.iter() {
            guards.push(self.acquire(file_id)?);
        }
        Ok(guards)
    }
}
