//! Index entry and per-table metadata encoding.
//!
//! Index records are fixed 6-byte, big-endian: a `u16` file-number followed
//! by a `u32` end-offset. The in-memory `filenum` is kept as `u32` so
//! arithmetic (`filenum + 1` during repair) never has to special-case
//! overflow near `u16::MAX`; only the on-disk representation is truncated to
//! two bytes.

use crate::error::{Error, Result};

/// Size in bytes of one encoded index record.
pub const INDEX_ENTRY_SIZE: u64 = 6;

/// One record in a table's index file.
///
/// Record 0 (the sentinel) carries `tail_id` in `filenum` and `item_offset`
/// in `offset`. Every subsequent record `i` marks the end offset of item
/// `i - 1` within the data file named by `filenum`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    /// Data-file number this record refers to.
    pub filenum: u32,
    /// Byte offset within that data file.
    pub offset: u32,
}

impl IndexEntry {
    /// Builds a sentinel record carrying the tail file-number and the
    /// physically-removed item count.
    pub fn sentinel(tail_id: u32, item_offset: u32) -> Self {
        IndexEntry {
            filenum: tail_id,
            offset: item_offset,
        }
    }

    /// Encodes this entry as 6 big-endian bytes.
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE as usize] {
        fail::fail_point!("IndexEntry encode");
        let mut out = [0u8; INDEX_ENTRY_SIZE as usize];
        let filenum = u16::try_from(self.filenum).unwrap_or(u16::MAX);
        out[0..2].copy_from_slice(&filenum.to_be_bytes());
        out[2..6].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    /// Decodes an entry from a 6-byte big-endian buffer.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != INDEX_ENTRY_SIZE as usize {
            return Err(Error::corruption(format!(
                "index record has wrong length {}",
                raw.len()
            )));
        }
        let filenum = u16::from_be_bytes([raw[0], raw[1]]) as u32;
        let offset = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
        Ok(IndexEntry { filenum, offset })
    }

    /// Returns `(start, end, file)` for the item this record ends and the
    /// record before it (`self`). If both entries share a file, the item
    /// spans `[self.offset, next.offset)` in that file. Otherwise the item
    /// starts at offset 0 of `next`'s file (items never cross file
    /// boundaries, so a file change means the previous file ended exactly
    /// where `self` says it did and the new item starts fresh).
    pub fn bounds(&self, next: &IndexEntry) -> (u64, u64, u32) {
        if self.filenum == next.filenum {
            (self.offset as u64, next.offset as u64, self.filenum)
        } else {
            (0, next.offset as u64, next.filenum)
        }
    }
}

/// Current on-disk metadata format version.
pub const META_VERSION: u8 = 2;

/// Per-table metadata sidecar: virtual tail and format version.
///
/// Readers must accept the legacy layout (no version byte, nine bytes for
/// the virtual tail... historically: a bare version + tail pair with no
/// extra fields) and silently upgrade it to [`META_VERSION`] on the table's
/// next write. An unknown version tag on an otherwise legacy-sized record is
/// fatal corruption, not a silent upgrade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Format version this record was written with.
    pub version: u8,
    /// Logical count of items hidden by tail truncation. May exceed the
    /// physically-removed item count until a whole data file can be
    /// dropped.
    pub virtual_tail: u64,
}

/// Legacy (version, virtual_tail) encoding: 1 + 8 = 9 bytes.
const LEGACY_META_SIZE: usize = 9;

impl Metadata {
    /// Encodes this metadata using the current format version.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_META_SIZE);
        out.push(META_VERSION);
        out.extend_from_slice(&self.virtual_tail.to_be_bytes());
        out
    }

    /// Decodes metadata, accepting the legacy two-field layout and
    /// upgrading it in memory (the caller is responsible for persisting the
    /// upgrade on the table's next write).
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != LEGACY_META_SIZE {
            return Err(Error::corruption(format!(
                "meta record has unexpected length {} (expected {})",
                raw.len(),
                LEGACY_META_SIZE
            )));
        }
        let version = raw[0];
        if version == 0 || version > META_VERSION {
            return Err(Error::corruption(format!(
                "meta record has unknown version {version}"
            )));
        }
        let mut tail_bytes = [0u8; 8];
        tail_bytes.copy_from_slice(&raw[1..9]);
        let virtual_tail = u64::from_be_bytes(tail_bytes);
        Ok(Metadata {
            version,
            virtual_tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_entry_round_trips() {
        let e = IndexEntry {
            filenum: 42,
            offset: 123_456,
        };
        let encoded = e.encode();
        assert_eq!(encoded.len(), INDEX_ENTRY_SIZE as usize);
        let decoded = IndexEntry::decode(&encoded).unwrap();
        assert_eq!(e, decoded);
    }

    #[test]
    fn bounds_same_file() {
        let a = IndexEntry {
            filenum: 1,
            offset: 10,
        };
        let b = IndexEntry {
            filenum: 1,
            offset: 30,
        };
        assert_eq!(a.bounds(&b), (10, 30, 1));
    }

    #[test]
    fn bounds_crossing_file() {
        let a = IndexEntry {
            filenum: 1,
            offset: 10,
        };
        let b = IndexEntry {
            filenum: 2,
            offset: 5,
        };
        assert_eq!(a.bounds(&b), (0, 5, 2));
    }

    #[test]
    fn metadata_round_trips() {
        let m = Metadata {
            version: META_VERSION,
            virtual_tail: 99,
        };
        let decoded = Metadata::decode(&m.encode()).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn metadata_rejects_unknown_version() {
        let mut raw = [0u8; LEGACY_META_SIZE];
        raw[0] = META_VERSION + 1;
        assert!(Metadata::decode(&raw).is_err());
    }
}
