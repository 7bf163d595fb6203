//! # Index Page Layout
//!
//! Every page of an index tier shares one physical layout: a fixed header
//! with the per-page Bloom filter, a pointer array growing forward from the
//! header, and entry bytes growing backward from the page tail. The page is
//! full when the two regions would meet.
//!
//! ```text
//! +--------------------------------------+
//! | entry_count   (u32)                  |
//! | free_space_offset (u32)              |
//! | bloom_seed    (u32)                  |
//! | bloom_bits    (BLOOM_BYTES)          |
//! +--------------------------------------+  <- PAGE_COMMON_HEADER_SIZE
//! | pointer[0] pointer[1] ... (u32 each) |  -> grows forward
//! +--------------------------------------+
//! |            free space                |
//! +--------------------------------------+  <- free_space_offset
//! | ... entry[1] entry[0]                |  <- grows backward from tail
//! +--------------------------------------+  PAGE_SIZE
//! ```
//!
//! Pointer slots are kept sorted by entry key, so lookups binary-search the
//! pointer array and never move entry bytes; an insert writes the entry at
//! the tail and shifts only the pointer slots above the insertion index.
//! When several entries carry the same key (repeated puts in one mutable
//! page), the newest entry's pointer sits first in the equal run — readers
//! consume values newest-first by walking the run left to right.
//!
//! ## Entry Encodings
//!
//! Data pages store RID lists:
//!
//! ```text
//! entry := encoded key columns | value_count:u32 | value_count × RID
//! RID   := bucket_id:i32 | position:i64
//! ```
//!
//! Sparse-root pages of a compacted tier store page references:
//!
//! ```text
//! entry := encoded key columns (max key of the data page) | page_no:u32
//! ```
//!
//! Keys are stored with no length field — the encoding is self-delimiting,
//! so the key's end is found by walking the declared number of columns.
//!
//! ## Root Page Metadata
//!
//! Page 0 of a tier file holds no entries; its bytes after the common header
//! carry the tier metadata (key-type list, value type, Bloom key depth — and
//! for a compacted tier the sparse-root page count and the owning mutable
//! file id). All offset math in this module runs through the bounds-checked
//! cursors from `storage`; a pointer outside its legal window is reported as
//! `EngineError::Corruption` with page and slot context.

use eyre::{ensure, Result};

use crate::config::{
    BLOOM_BYTES, ENTRY_POINTER_SIZE, PAGE_COMMON_HEADER_SIZE, PAGE_SIZE, RID_SIZE,
};
use crate::encoding::encoded_key_len;
use crate::error::EngineError;
use crate::index::Rid;
use crate::storage::{bloom, read_u32_at, write_u32_at, Page, PageReader, PageWriter};
use crate::types::KeyType;

/// The only value type this engine stores in index entries.
pub const VALUE_TYPE_RID: u8 = 0x01;

const OFF_ENTRY_COUNT: usize = 0;
const OFF_FREE_SPACE: usize = 4;
const OFF_BLOOM_SEED: usize = 8;
const OFF_BLOOM_BITS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Index of the first entry whose key equals the probe.
    Found(usize),
    /// Index where the probe key would be inserted.
    NotFound(usize),
}

fn corruption(msg: String) -> eyre::Report {
    EngineError::Corruption(msg).into()
}

/// Read-only view of one entry-bearing page.
#[derive(Clone, Copy)]
pub struct IndexPage<'a> {
    data: &'a [u8],
    columns: usize,
}

/// One decoded entry: the raw key bytes plus its value region.
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    values: &'a [u8],
    value_count: u32,
}

impl<'a> EntryRef<'a> {
    pub fn value_count(&self) -> u32 {
        self.value_count
    }

    pub fn value(&self, idx: u32) -> Result<Rid> {
        ensure!(
            idx < self.value_count,
            "value index {} out of bounds (count={})",
            idx,
            self.value_count
        );
        let mut r = PageReader::at(self.values, idx as usize * RID_SIZE)?;
        Rid::read_from(&mut r)
    }

    /// Values in stored order, newest first.
    pub fn values(&self) -> impl Iterator<Item = Result<Rid>> + '_ {
        (0..self.value_count).map(move |i| self.value(i))
    }
}

impl<'a> IndexPage<'a> {
    pub fn from_page(page: &'a Page, columns: usize) -> Self {
        Self {
            data: page.data(),
            columns,
        }
    }

    pub fn from_bytes(data: &'a [u8], columns: usize) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data, columns })
    }

    pub fn entry_count(&self) -> usize {
        read_u32_at(self.data, OFF_ENTRY_COUNT).unwrap() as usize
    }

    pub fn free_space_offset(&self) -> usize {
        read_u32_at(self.data, OFF_FREE_SPACE).unwrap() as usize
    }

    pub fn bloom_seed(&self) -> u32 {
        read_u32_at(self.data, OFF_BLOOM_SEED).unwrap()
    }

    fn bloom_bits(&self) -> &'a [u8] {
        &self.data[OFF_BLOOM_BITS..OFF_BLOOM_BITS + BLOOM_BYTES]
    }

    /// Bloom test over the encoded key prefix. `false` proves absence.
    pub fn may_contain(&self, bf_prefix: &[u8]) -> bool {
        bloom::may_contain(self.bloom_bits(), self.bloom_seed(), bf_prefix)
    }

    /// Free bytes between the pointer array head and the entry tail.
    pub fn available_space(&self) -> usize {
        let head = PAGE_COMMON_HEADER_SIZE + self.entry_count() * ENTRY_POINTER_SIZE;
        self.free_space_offset().saturating_sub(head)
    }

    fn pointer_at(&self, idx: usize) -> Result<usize> {
        let count = self.entry_count();
        ensure!(
            idx < count,
            "entry index {} out of bounds (entry_count={})",
            idx,
            count
        );
        let slot = PAGE_COMMON_HEADER_SIZE + idx * ENTRY_POINTER_SIZE;
        let offset = read_u32_at(self.data, slot)? as usize;
        let head = PAGE_COMMON_HEADER_SIZE + count * ENTRY_POINTER_SIZE;
        if offset < head || offset >= PAGE_SIZE {
            return Err(corruption(format!(
                "entry pointer {} at slot {} outside [{}, {})",
                offset, idx, head, PAGE_SIZE
            )));
        }
        Ok(offset)
    }

    pub fn key_at(&self, idx: usize) -> Result<&'a [u8]> {
        let offset = self.pointer_at(idx)?;
        let key_len = encoded_key_len(&self.data[offset..], self.columns)
            .map_err(|e| corruption(format!("unreadable key at slot {}: {}", idx, e)))?;
        Ok(&self.data[offset..offset + key_len])
    }

    /// Decode the RID-list entry at `idx` (data pages only).
    pub fn entry_at(&self, idx: usize) -> Result<EntryRef<'a>> {
        let offset = self.pointer_at(idx)?;
        let key_len = encoded_key_len(&self.data[offset..], self.columns)
            .map_err(|e| corruption(format!("unreadable key at slot {}: {}", idx, e)))?;
        let values_start = offset + key_len + 4;
        if values_start > PAGE_SIZE {
            return Err(corruption(format!(
                "entry at slot {} runs past the page tail",
                idx
            )));
        }
        let value_count = read_u32_at(self.data, offset + key_len)?;
        let values_end = values_start + value_count as usize * RID_SIZE;
        if values_end > PAGE_SIZE {
            return Err(corruption(format!(
                "value list of slot {} ({} values) runs past the page tail",
                idx, value_count
            )));
        }
        Ok(EntryRef {
            key: &self.data[offset..offset + key_len],
            values: &self.data[values_start..values_end],
            value_count,
        })
    }

    /// Decode the page-reference entry at `idx` (sparse-root pages only).
    pub fn page_ref_at(&self, idx: usize) -> Result<(&'a [u8], u32)> {
        let offset = self.pointer_at(idx)?;
        let key_len = encoded_key_len(&self.data[offset..], self.columns)
            .map_err(|e| corruption(format!("unreadable key at slot {}: {}", idx, e)))?;
        let page_no = read_u32_at(self.data, offset + key_len)?;
        Ok((&self.data[offset..offset + key_len], page_no))
    }

    /// Binary search over the sorted pointer array. On a hit the returned
    /// index is the first of the equal run, so values come out newest first.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let mut lo = 0usize;
        let mut hi = self.entry_count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.entry_count() && self.key_at(lo)? == key {
            Ok(SearchResult::Found(lo))
        } else {
            Ok(SearchResult::NotFound(lo))
        }
    }
}

/// Mutable view of one entry-bearing page.
pub struct IndexPageMut<'a> {
    data: &'a mut [u8],
    columns: usize,
}

impl<'a> IndexPageMut<'a> {
    pub fn from_page(page: &'a mut Page, columns: usize) -> Self {
        Self {
            data: page.data_mut(),
            columns,
        }
    }

    /// Initialize a fresh page: empty pointer array, tail at the page end,
    /// cleared Bloom region with the given seed.
    pub fn init(page: &'a mut Page, columns: usize, bloom_seed: u32) -> Result<Self> {
        let data = page.data_mut();
        write_u32_at(data, OFF_ENTRY_COUNT, 0)?;
        write_u32_at(data, OFF_FREE_SPACE, PAGE_SIZE as u32)?;
        write_u32_at(data, OFF_BLOOM_SEED, bloom_seed)?;
        data[OFF_BLOOM_BITS..OFF_BLOOM_BITS + BLOOM_BYTES].fill(0);
        Ok(Self { data, columns })
    }

    pub fn as_ref(&self) -> IndexPage<'_> {
        IndexPage {
            data: self.data,
            columns: self.columns,
        }
    }

    fn set_entry_count(&mut self, count: usize) -> Result<()> {
        write_u32_at(self.data, OFF_ENTRY_COUNT, count as u32)
    }

    fn set_free_space_offset(&mut self, offset: usize) -> Result<()> {
        write_u32_at(self.data, OFF_FREE_SPACE, offset as u32)
    }

    fn bloom_insert(&mut self, bf_prefix: &[u8]) {
        let seed = read_u32_at(self.data, OFF_BLOOM_SEED).unwrap();
        bloom::insert(
            &mut self.data[OFF_BLOOM_BITS..OFF_BLOOM_BITS + BLOOM_BYTES],
            seed,
            bf_prefix,
        );
    }

    fn insert_pointer(&mut self, insert_at: usize, entry_offset: usize) -> Result<()> {
        let count = self.as_ref().entry_count();
        for i in (insert_at..count).rev() {
            let src = PAGE_COMMON_HEADER_SIZE + i * ENTRY_POINTER_SIZE;
            let dst = src + ENTRY_POINTER_SIZE;
            self.data.copy_within(src..src + ENTRY_POINTER_SIZE, dst);
        }
        write_u32_at(
            self.data,
            PAGE_COMMON_HEADER_SIZE + insert_at * ENTRY_POINTER_SIZE,
            entry_offset as u32,
        )?;
        self.set_entry_count(count + 1)
    }

    /// Append a RID-list entry at its sorted position. Returns `false` when
    /// the page lacks room (the caller then allocates a fresh page).
    pub fn append_entry(&mut self, key: &[u8], bf_prefix: &[u8], rids: &[Rid]) -> Result<bool> {
        let entry_size = key.len() + 4 + rids.len() * RID_SIZE;
        let view = self.as_ref();
        if view.available_space() < entry_size + ENTRY_POINTER_SIZE {
            return Ok(false);
        }

        let insert_at = match view.search(key)? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(i) => i,
        };
        let entry_offset = view.free_space_offset() - entry_size;

        {
            let mut w = PageWriter::at(self.data, entry_offset)?;
            w.bytes(key)?;
            w.u32(rids.len() as u32)?;
            for rid in rids {
                rid.write_to(&mut w)?;
            }
        }

        self.insert_pointer(insert_at, entry_offset)?;
        self.set_free_space_offset(entry_offset)?;
        self.bloom_insert(bf_prefix);
        Ok(true)
    }

    /// Append a `(max_key, page_no)` reference at its sorted position
    /// (sparse-root pages). Returns `false` when the page lacks room.
    pub fn append_page_ref(&mut self, key: &[u8], page_no: u32) -> Result<bool> {
        let entry_size = key.len() + 4;
        let view = self.as_ref();
        if view.available_space() < entry_size + ENTRY_POINTER_SIZE {
            return Ok(false);
        }

        let insert_at = match view.search(key)? {
            SearchResult::Found(i) => i,
            SearchResult::NotFound(i) => i,
        };
        let entry_offset = view.free_space_offset() - entry_size;

        {
            let mut w = PageWriter::at(self.data, entry_offset)?;
            w.bytes(key)?;
            w.u32(page_no)?;
        }

        self.insert_pointer(insert_at, entry_offset)?;
        self.set_free_space_offset(entry_offset)?;
        Ok(true)
    }

    /// Overwrite value slot `value_idx` of entry `entry_idx` in place. Only
    /// the still-open last page of the mutable tier is ever patched this
    /// way; everything else is strictly append-only until compaction.
    pub fn set_value_at(&mut self, entry_idx: usize, value_idx: u32, rid: Rid) -> Result<()> {
        let view = self.as_ref();
        let offset = view.pointer_at(entry_idx)?;
        let key_len = encoded_key_len(&view.data[offset..], self.columns)?;
        let value_count = read_u32_at(view.data, offset + key_len)?;
        ensure!(
            value_idx < value_count,
            "value index {} out of bounds (count={})",
            value_idx,
            value_count
        );
        let value_offset = offset + key_len + 4 + value_idx as usize * RID_SIZE;
        let mut w = PageWriter::at(self.data, value_offset)?;
        rid.write_to(&mut w)
    }
}

/// Tier metadata stored on a root page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierMeta {
    pub key_types: Vec<KeyType>,
    pub value_type: u8,
    pub bf_key_depth: u8,
}

impl TierMeta {
    pub fn new(key_types: Vec<KeyType>, bf_key_depth: u8) -> Self {
        Self {
            key_types,
            value_type: VALUE_TYPE_RID,
            bf_key_depth,
        }
    }
}

fn write_meta_fields(w: &mut PageWriter<'_>, meta: &TierMeta) -> Result<()> {
    w.u8(meta.key_types.len() as u8)?;
    for kt in &meta.key_types {
        w.u8(kt.as_byte())?;
    }
    w.u8(meta.value_type)?;
    w.u8(meta.bf_key_depth)
}

fn read_meta_fields(r: &mut PageReader<'_>) -> Result<TierMeta> {
    let column_count = r.u8()?;
    ensure!(column_count >= 1, "index root declares zero key columns");
    let mut key_types = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        key_types.push(KeyType::from_byte(r.u8()?)?);
    }
    let value_type = r.u8()?;
    ensure!(
        value_type == VALUE_TYPE_RID,
        "unsupported index value type: {:#04x}",
        value_type
    );
    let bf_key_depth = r.u8()?;
    Ok(TierMeta {
        key_types,
        value_type,
        bf_key_depth,
    })
}

/// Initialize page 0 of a mutable tier file.
pub fn write_mutable_root(page: &mut Page, meta: &TierMeta) -> Result<()> {
    IndexPageMut::init(page, meta.key_types.len(), 0)?;
    let mut w = PageWriter::at(page.data_mut(), PAGE_COMMON_HEADER_SIZE)?;
    write_meta_fields(&mut w, meta)
}

pub fn read_mutable_root(page: &Page) -> Result<TierMeta> {
    let mut r = PageReader::at(page.data(), PAGE_COMMON_HEADER_SIZE)?;
    read_meta_fields(&mut r)
}

/// Header of page 0 of a compacted tier file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedRoot {
    /// Number of sparse-root pages that follow page 0.
    pub compacted_page_count: u32,
    /// File id of the mutable tier this compacted tier belongs to.
    pub sub_index_file_id: u32,
    pub meta: TierMeta,
}

pub fn write_compacted_root(page: &mut Page, root: &CompactedRoot) -> Result<()> {
    IndexPageMut::init(page, root.meta.key_types.len(), 0)?;
    let mut w = PageWriter::at(page.data_mut(), PAGE_COMMON_HEADER_SIZE)?;
    w.u32(root.compacted_page_count)?;
    w.u32(root.sub_index_file_id)?;
    write_meta_fields(&mut w, &root.meta)
}

pub fn read_compacted_root(page: &Page) -> Result<CompactedRoot> {
    let mut r = PageReader::at(page.data(), PAGE_COMMON_HEADER_SIZE)?;
    let compacted_page_count = r.u32()?;
    let sub_index_file_id = r.u32()?;
    let meta = read_meta_fields(&mut r)?;
    Ok(CompactedRoot {
        compacted_page_count,
        sub_index_file_id,
        meta,
    })
}
