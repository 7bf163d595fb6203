//! # StrataDB - Embedded Transactional LSM Index Engine
//!
//! StrataDB is the index core of an embedded document store: a two-tier
//! (mutable + compacted) LSM-style ordered index mapping typed key tuples to
//! record identifiers, built on page-versioned, write-ahead-logged
//! transactions.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Database, KeyType, Rid, Value};
//!
//! let db = Database::open("./mydb")?;
//! let users = db.create_index("users_name", &[KeyType::Text], true, 0)?;
//!
//! db.put(&users, &[Value::from("alice")], Rid::new(3, 10))?;
//! let rids = db.get(&users, &[Value::from("alice")], 0)?;
//!
//! let mut tx = db.begin()?;
//! tx.put(&users, &[Value::from("bob")], Rid::new(3, 11))?;
//! db.commit(&mut tx)?;
//!
//! db.compact("users_name")?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (Database)          │
//! ├─────────────────────────────────────┤
//! │  Index Registry │ Background Compactor│
//! ├─────────────────┴───────────────────┤
//! │   Two-Tier Index (mutable/compacted) │
//! │   Merging Cursor │ K-way Compaction  │
//! ├─────────────────────────────────────┤
//! │  Transactions (COW overlay, commit   │
//! │  protocol, file-ordered locking)     │
//! ├─────────────────────────────────────┤
//! │  Page Layout (pointer array, Bloom)  │
//! ├─────────────────────────────────────┤
//! │  Storage (mmap page files) + WAL     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Design Points
//!
//! - **Newest wins.** The mutable tier is append-only; a delete is a
//!   tombstone value and lookups stop at the newest state for a key.
//!   Compaction is the only thing that rewrites data.
//! - **One commit protocol.** Index writes are ordinary page edits inside a
//!   copy-on-write transaction overlay: version-checked, logged to the WAL
//!   and applied under per-file locks acquired in ascending id order, so
//!   index durability needs no recovery logic of its own.
//! - **Unique keys check at commit.** A unique-index put queues on the
//!   transaction and is validated under the same file locks that apply it,
//!   so two racing writers cannot both commit the same key.
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped page files, page model, Bloom filters
//! - [`wal`]: write-ahead log with CRC-checked records and torn-tail replay
//! - [`tx`]: transaction contexts and the page commit protocol
//! - [`index`]: page layout, the two tiers, compactor and merging cursor
//! - [`encoding`]: order-preserving byte encoding for key tuples
//! - [`config`]: format constants and engine tunables

pub mod config;
pub mod encoding;
pub mod error;
pub mod index;
pub mod storage;
pub mod tx;
pub mod types;
pub mod wal;

mod database;

pub use config::{DatabaseConfig, WalFlush};
pub use database::{Database, DatabaseBuilder};
pub use error::EngineError;
pub use index::{CompactionStatus, Index, IndexCursor, Rid};
pub use tx::TransactionContext;
pub use types::{KeyType, Value};
