//! # Write-Ahead Log
//!
//! The WAL provides durability for the page commit protocol: before any
//! committed page reaches the store, the whole transaction is appended to
//! the log as a single record carrying the transaction id and the before and
//! after image of every touched page. On database open the log is replayed
//! and every complete record's after-images are written back to the page
//! files; a torn or corrupt tail record marks the end of the usable log and
//! is discarded.
//!
//! ## Record Format
//!
//! ```text
//! +---------------------+--------------------------------------+
//! | Record Header (32B) | Body (one sub-record per page image) |
//! +---------------------+--------------------------------------+
//!
//! Header:
//!   magic:       u32   record marker ("SWAL")
//!   image_count: u32   number of page images in the body
//!   txn_id:      u64   committing transaction
//!   salt:        u32   random per-record value mixed into the checksum
//!   body_len:    u32   total body bytes
//!   checksum:    u64   CRC-64/ECMA over header fields and body
//!
//! Body, per image:
//!   file_id:     u32
//!   page_no:     u32
//!   has_before:  u32   0 for pages new in this transaction
//!   before:      PAGE_SIZE bytes, present when has_before = 1
//!   after:       PAGE_SIZE bytes
//! ```
//!
//! A record is built in memory and appended with one write; the checksum
//! covers everything after itself, so a partial append fails validation and
//! replay stops there. With `WalFlush::EveryCommit` the file is fsynced
//! before the commit proceeds to the store (the write-ahead invariant under
//! power loss); `OsBuffered` leaves flushing to the OS and survives process
//! crashes only.
//!
//! ## Concurrency
//!
//! Appends serialize on an internal `parking_lot::Mutex`. The commit
//! protocol already holds the per-file locks when it appends, so two
//! transactions never interleave records for the same file in conflicting
//! order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{WalFlush, PAGE_SIZE, WAL_RECORD_HEADER_SIZE};
use crate::storage::{PageId, PageReader, PageWriter};

pub const WAL_FILE_NAME: &str = "wal.strata";
const WAL_MAGIC: u32 = 0x5357_414C; // "SWAL"

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct RecordHeader {
    magic: u32,
    image_count: u32,
    txn_id: u64,
    salt: u32,
    body_len: u32,
    checksum: u64,
}

fn compute_checksum(header: &RecordHeader, body: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&header.magic.to_le_bytes());
    digest.update(&header.image_count.to_le_bytes());
    digest.update(&header.txn_id.to_le_bytes());
    digest.update(&header.salt.to_le_bytes());
    digest.update(&header.body_len.to_le_bytes());
    digest.update(body);
    digest.finalize()
}

/// Before/after images of one page touched by a transaction.
#[derive(Debug)]
pub struct PageImage {
    pub id: PageId,
    /// The committed image the transaction started from; `None` for pages
    /// that did not exist before this transaction.
    pub before: Option<Box<[u8]>>,
    pub after: Box<[u8]>,
}

/// One complete record recovered during replay.
#[derive(Debug)]
pub struct RecoveredRecord {
    pub txn_id: u64,
    pub after_images: Vec<(PageId, Box<[u8]>)>,
}

struct WalFile {
    file: File,
    offset: u64,
}

pub struct Wal {
    #[allow(dead_code)]
    path: PathBuf,
    flush: WalFlush,
    current: Mutex<WalFile>,
}

impl Wal {
    /// Open (or create) the log and position appends at its end. Callers
    /// are expected to run [`Wal::replay`] before opening for appends.
    pub fn open(dir: &Path, flush: WalFlush) -> Result<Self> {
        let path = dir.join(WAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL at '{}'", path.display()))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .wrap_err("failed to seek to WAL end")?;

        Ok(Self {
            path,
            flush,
            current: Mutex::new(WalFile { file, offset }),
        })
    }

    /// Append one transaction record and flush it per the configured policy.
    pub fn append(&self, txn_id: u64, images: &[PageImage]) -> Result<()> {
        ensure!(!images.is_empty(), "refusing to log an empty transaction");

        let mut body_len = 0usize;
        for image in images {
            body_len += 12 + PAGE_SIZE;
            if image.before.is_some() {
                body_len += PAGE_SIZE;
            }
        }

        let mut record = vec![0u8; WAL_RECORD_HEADER_SIZE + body_len];
        {
            let body = &mut record[WAL_RECORD_HEADER_SIZE..];
            let mut w = PageWriter::new(body);
            for image in images {
                w.u32(image.id.file_id)?;
                w.u32(image.id.page_no)?;
                w.u32(image.before.is_some() as u32)?;
                if let Some(before) = &image.before {
                    ensure!(
                        before.len() == PAGE_SIZE,
                        "invalid before-image size for page {}",
                        image.id
                    );
                    w.bytes(before)?;
                }
                ensure!(
                    image.after.len() == PAGE_SIZE,
                    "invalid after-image size for page {}",
                    image.id
                );
                w.bytes(&image.after)?;
            }
        }

        let mut header = RecordHeader {
            magic: WAL_MAGIC,
            image_count: images.len() as u32,
            txn_id,
            salt: rand::random(),
            body_len: body_len as u32,
            checksum: 0,
        };
        header.checksum = compute_checksum(&header, &record[WAL_RECORD_HEADER_SIZE..]);
        record[..WAL_RECORD_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut current = self.current.lock();
        current
            .file
            .write_all(&record)
            .wrap_err("failed to append WAL record")?;
        current.offset += record.len() as u64;

        if self.flush == WalFlush::EveryCommit {
            current.file.sync_data().wrap_err("failed to fsync WAL")?;
        }
        Ok(())
    }

    /// Bytes currently in the log.
    pub fn size(&self) -> u64 {
        self.current.lock().offset
    }

    /// Discard the log. Called after a checkpoint has forced every page file
    /// to disk.
    pub fn truncate(&self) -> Result<()> {
        let mut current = self.current.lock();
        current
            .file
            .set_len(0)
            .wrap_err("failed to truncate WAL")?;
        current
            .file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to rewind WAL")?;
        current.offset = 0;
        Ok(())
    }

    /// Read every complete record from the log at `dir`, stopping at the
    /// first torn or corrupt record. Missing log means nothing to replay.
    pub fn replay(dir: &Path) -> Result<Vec<RecoveredRecord>> {
        let path = dir.join(WAL_FILE_NAME);
        let mut bytes = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)
                    .wrap_err_with(|| format!("failed to read WAL at '{}'", path.display()))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to open WAL at '{}'", path.display()))
            }
        }

        let mut records = Vec::new();
        let mut pos = 0usize;

        while bytes.len() - pos >= WAL_RECORD_HEADER_SIZE {
            let Ok(header) =
                RecordHeader::read_from_bytes(&bytes[pos..pos + WAL_RECORD_HEADER_SIZE])
            else {
                break;
            };
            if header.magic != WAL_MAGIC {
                break;
            }
            let body_start = pos + WAL_RECORD_HEADER_SIZE;
            let body_end = body_start + header.body_len as usize;
            if body_end > bytes.len() {
                break; // torn tail
            }
            let body = &bytes[body_start..body_end];
            if compute_checksum(&header, body) != header.checksum {
                break;
            }

            let mut after_images = Vec::with_capacity(header.image_count as usize);
            let mut r = PageReader::new(body);
            let mut ok = true;
            for _ in 0..header.image_count {
                let (Ok(file_id), Ok(page_no), Ok(has_before)) = (r.u32(), r.u32(), r.u32()) else {
                    ok = false;
                    break;
                };
                if has_before == 1 && r.bytes(PAGE_SIZE).is_err() {
                    ok = false;
                    break;
                }
                let Ok(after) = r.bytes(PAGE_SIZE) else {
                    ok = false;
                    break;
                };
                after_images.push((PageId::new(file_id, page_no), after.to_vec().into()));
            }
            if !ok {
                break;
            }

            records.push(RecoveredRecord {
                txn_id: header.txn_id,
                after_images,
            });
            pos = body_end;
        }

        Ok(records)
    }
}
