//! Record identifiers and tombstone markers.
//!
//! A [`Rid`] points at one stored record as `(bucket_id, position)`. The
//! index stores RIDs as its values, and reuses negative bucket ids as
//! tombstones, so a deletion is just another appended value:
//!
//! - `Rid::REMOVED` (`-1:-1`) deletes the whole key: nothing older than it
//!   is alive.
//! - `bucket_id < -1` deletes one specific RID. The encoding is
//!   `tombstone(b) = -(b + 2)`, so bucket 0 maps to -2 and the target is
//!   recovered with `-b - 2`; positions are carried through unchanged.
//!
//! Physically a tombstone is indistinguishable from a live value until
//! compaction resolves and drops it.

use eyre::{ensure, Result};

use crate::storage::{PageReader, PageWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub bucket_id: i32,
    pub position: i64,
}

impl Rid {
    /// Whole-key tombstone: the key has no live values older than this.
    pub const REMOVED: Rid = Rid {
        bucket_id: -1,
        position: -1,
    };

    pub fn new(bucket_id: i32, position: i64) -> Self {
        Self {
            bucket_id,
            position,
        }
    }

    pub fn is_removed_marker(self) -> bool {
        self == Rid::REMOVED
    }

    /// True for a single-RID tombstone (not the whole-key marker).
    pub fn is_tombstone(self) -> bool {
        self.bucket_id < -1
    }

    /// The tombstone that deletes exactly this RID.
    pub fn tombstone(self) -> Result<Rid> {
        ensure!(
            self.bucket_id >= 0,
            "cannot build a tombstone for non-data rid {}",
            self
        );
        Ok(Rid {
            bucket_id: -(self.bucket_id + 2),
            position: self.position,
        })
    }

    /// The RID a single-RID tombstone deletes.
    pub fn tombstone_target(self) -> Result<Rid> {
        ensure!(self.is_tombstone(), "{} is not a tombstone", self);
        Ok(Rid {
            bucket_id: -self.bucket_id - 2,
            position: self.position,
        })
    }

    pub fn write_to(self, w: &mut PageWriter<'_>) -> Result<()> {
        w.i32(self.bucket_id)?;
        w.i64(self.position)
    }

    pub fn read_from(r: &mut PageReader<'_>) -> Result<Rid> {
        Ok(Rid {
            bucket_id: r.i32()?,
            position: r.i64()?,
        })
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.bucket_id, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_round_trip_including_bucket_zero() {
        for bucket in [0, 1, 7, i32::MAX - 2] {
            let rid = Rid::new(bucket, 42);
            let tomb = rid.tombstone().unwrap();
            assert!(tomb.is_tombstone());
            assert!(!tomb.is_removed_marker());
            assert_eq!(tomb.tombstone_target().unwrap(), rid);
        }
    }

    #[test]
    fn removed_marker_is_not_a_single_rid_tombstone() {
        assert!(Rid::REMOVED.is_removed_marker());
        assert!(!Rid::REMOVED.is_tombstone());
    }

    #[test]
    fn tombstone_of_tombstone_rejected() {
        let tomb = Rid::new(3, 9).tombstone().unwrap();
        assert!(tomb.tombstone().is_err());
        assert!(Rid::REMOVED.tombstone().is_err());
    }

    #[test]
    fn serialization_round_trip() {
        let mut buf = [0u8; 12];
        let rid = Rid::new(-2, i64::MIN);
        rid.write_to(&mut PageWriter::new(&mut buf)).unwrap();
        let read = Rid::read_from(&mut PageReader::new(&buf)).unwrap();
        assert_eq!(read, rid);
    }

    #[test]
    fn ordering_is_bucket_then_position() {
        assert!(Rid::new(1, 100) < Rid::new(2, 0));
        assert!(Rid::new(1, 1) < Rid::new(1, 2));
    }
}
