//! # StrataDB Configuration Constants
//!
//! This module centralizes the constants that define the on-disk format and
//! the engine's resource behavior. Constants that depend on each other are
//! co-located and guarded by compile-time assertions so a change to one
//! cannot silently break another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (65536 bytes)
//!       │
//!       ├─> PAGE_COMMON_HEADER_SIZE (12 + BLOOM_BYTES)
//!       │     Every index page starts with entry_count, free_space_offset,
//!       │     bloom_seed and the Bloom bit region.
//!       │
//!       ├─> PAGE_USABLE_SIZE (derived: PAGE_SIZE - PAGE_COMMON_HEADER_SIZE)
//!       │
//!       ├─> MAX_ENCODED_KEY_SIZE
//!       │     Must leave room for ROOT_PAGE_FANOUT root entries per page so
//!       │     the compactor can reserve its sparse-root region up front.
//!       │
//!       └─> DEFAULT_COMPACTION_RAM
//!             Bounds how many source pages one merge pass holds in memory
//!             (DEFAULT_COMPACTION_RAM / PAGE_SIZE pages per pass).
//!
//! BLOOM_BYTES (2048) ── BLOOM_HASHES (5)
//!       Sized for roughly 2000 entries per 64KB page at a single-digit
//!       false-positive rate. The filter is advisory only: a positive always
//!       falls through to the real binary search.
//! ```

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the fundamental page structure used throughout the engine
// ============================================================================

/// Size of each index page in bytes (64KB).
/// This is the fundamental unit of I/O, locking and versioning.
pub const PAGE_SIZE: usize = 65536;

/// Bytes of the fixed header fields preceding the Bloom region:
/// entry_count (u32), free_space_offset (u32), bloom_seed (u32).
pub const PAGE_FIXED_HEADER_SIZE: usize = 12;

/// Size of the per-page Bloom filter bit region.
pub const BLOOM_BYTES: usize = 2048;

/// Number of hash probes per Bloom insert/lookup.
pub const BLOOM_HASHES: usize = 5;

/// Full common header: fixed fields plus the Bloom region. The pointer
/// array begins here on every entry-bearing page.
pub const PAGE_COMMON_HEADER_SIZE: usize = PAGE_FIXED_HEADER_SIZE + BLOOM_BYTES;

/// Usable space for pointer array plus entry bytes on an entry-bearing page.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_COMMON_HEADER_SIZE;

/// Size of one pointer-array slot (byte offset of an entry).
pub const ENTRY_POINTER_SIZE: usize = 4;

/// Serialized size of one RID: bucket_id (i32) + position (i64).
pub const RID_SIZE: usize = 12;

const _: () = assert!(
    PAGE_COMMON_HEADER_SIZE == PAGE_FIXED_HEADER_SIZE + BLOOM_BYTES,
    "PAGE_COMMON_HEADER_SIZE derivation mismatch"
);

const _: () = assert!(
    PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_COMMON_HEADER_SIZE,
    "PAGE_USABLE_SIZE derivation mismatch"
);

// ============================================================================
// KEY AND ROOT-PAGE SIZING
// The compactor reserves its sparse-root region before writing data pages,
// so a root page must be guaranteed to hold ROOT_PAGE_FANOUT entries of the
// largest permitted key
// ============================================================================

/// Minimum number of `(max_key, data_page)` entries one root page must hold.
pub const ROOT_PAGE_FANOUT: usize = 64;

/// Largest permitted encoded key, enforced at `put` time.
pub const MAX_ENCODED_KEY_SIZE: usize = 960;

const _: () = assert!(
    ROOT_PAGE_FANOUT * (MAX_ENCODED_KEY_SIZE + 4 + ENTRY_POINTER_SIZE) <= PAGE_USABLE_SIZE,
    "a root page must fit ROOT_PAGE_FANOUT entries of maximal key size"
);

// ============================================================================
// COMPACTION CONFIGURATION
// ============================================================================

/// Default RAM budget for one compaction merge pass. The compactor opens at
/// most DEFAULT_COMPACTION_RAM / PAGE_SIZE page sources per pass.
pub const DEFAULT_COMPACTION_RAM: usize = 4 * 1024 * 1024;

/// Default number of mutable data pages that triggers background compaction.
pub const DEFAULT_COMPACTION_PAGE_THRESHOLD: u32 = 16;

/// Default polling interval of the background compaction thread.
pub const DEFAULT_COMPACTION_INTERVAL_MS: u64 = 500;

const _: () = assert!(
    DEFAULT_COMPACTION_RAM / PAGE_SIZE >= 2,
    "a merge pass needs at least two page sources"
);

// ============================================================================
// TRANSACTION AND WAL CONFIGURATION
// ============================================================================

/// Default bound on waiting for one per-file commit lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// WAL size beyond which a checkpoint (sync files, truncate log) is taken
/// after commit.
pub const DEFAULT_WAL_CHECKPOINT_BYTES: u64 = 64 * 1024 * 1024;

/// Size of a WAL record header in bytes.
pub const WAL_RECORD_HEADER_SIZE: usize = 32;
