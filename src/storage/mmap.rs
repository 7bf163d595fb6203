//! # Memory-Mapped Page Files
//!
//! One `MmapStorage` owns one index file mapped read/write into the process
//! address space. Files are plain concatenations of fixed-size pages:
//!
//! ```text
//! Offset 0:          Page 0 (root page)
//! Offset PAGE_SIZE:  Page 1
//! ...
//! ```
//!
//! The file length is always `page_count * PAGE_SIZE`; growth sets the exact
//! new length and remaps, so the physical page count can be recovered from
//! the file size alone when a database is reopened.
//!
//! `grow()` takes `&mut self`, which lets the borrow checker rule out page
//! references outliving a remap with no runtime guard.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: std::fs::File,
    mmap: MmapMut,
    page_count: u32,
}

impl MmapStorage {
    /// Create a new file with `initial_page_count` zeroed pages.
    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();
        ensure!(initial_page_count > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;

        let file_size = initial_page_count as u64 * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), file_size))?;

        // SAFETY: the file was just created with exclusive read/write access,
        // its size is a valid multiple of PAGE_SIZE, and the mapping's
        // lifetime is tied to this MmapStorage. All access goes through
        // page()/page_mut(), which bounds-check the page number.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    /// Open an existing file. The page count is derived from the file size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0 && file_size % PAGE_SIZE as u64 == 0,
            "index file '{}' size {} is not a positive multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        // SAFETY: same reasoning as in create(); index files are not
        // modified by external processes while the database holds them.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: (file_size / PAGE_SIZE as u64) as u32,
        })
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    /// Grow the file to exactly `new_page_count` pages and remap. A no-op if
    /// the file already has at least that many.
    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap.flush().wrap_err("failed to flush before grow")?;

        let new_size = new_page_count as u64 * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to grow index file to {} bytes", new_size))?;

        // SAFETY: remapping the same exclusively-owned file at its new size;
        // the old mapping is dropped by the assignment.
        self.mmap = unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap after grow")? };
        self.page_count = new_page_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync index file")
    }
}
