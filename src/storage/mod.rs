//! # Storage Layer
//!
//! The foundational page model of the engine:
//!
//! - `page`: page identity, owned page images, bounds-checked buffer cursors
//! - `bloom`: the per-page Bloom filter region
//! - `mmap`: memory-mapped fixed-size page files
//! - `file_manager`: the page store — file registry, page read/write,
//!   per-page version counters
//!
//! Everything above this layer manipulates pages only through
//! [`Page`]/[`PageId`] and the `FileManager`; nothing else touches file
//! descriptors or raw mappings.

pub mod bloom;
mod file_manager;
mod mmap;
mod page;

pub use file_manager::{index_file_path, FileManager};
pub use mmap::MmapStorage;
pub use page::{read_u32_at, write_u32_at, Page, PageId, PageReader, PageWriter};
