//! Buffered, per-table append batch (§4.D).
//!
//! A [`TableBatch`] accumulates compressed blobs in memory up to a size
//! limit, then flushes them in one data write and one index write rather
//! than round-tripping through `FreezerTable::append` per item. It also
//! implements mid-batch file rollover: when the next pending blob no longer
//! fits in the file the batch is currently targeting, the batch flushes
//! what it has, physically rotates the table's head file, and continues
//! buffering into the new one.
//!
//! `TableBatch` is not internally synchronized — it is meant to be used
//! under a single writer (the freezer's writer lock, see
//! [`crate::freezer::Freezer::modify`]), matching how [`FreezerTable`]
//! itself expects batched writes to be serialized by its caller.

use snap::raw::Encoder as SnappyEncoder;

use crate::error::{Error, Result};
use crate::index::IndexEntry;
use crate::table::FreezerTable;

/// Buffer size at which a batch flushes even if no rollover is pending.
pub const MAX_BATCH_BYTES: usize = 2 * 1024 * 1024;

/// A buffered append batch for one table.
pub struct TableBatch<'t> {
    table: &'t FreezerTable,
    cur_item: u64,
    data_buf: Vec<u8>,
    index_buf: Vec<IndexEntry>,
    proj_head_id: u32,
    proj_bytes: u64,
}

impl<'t> TableBatch<'t> {
    /// Starts a new batch positioned at the table's current head.
    pub fn new(table: &'t FreezerTable) -> Self {
        let cur_item = table.head();
        let (proj_head_id, proj_bytes) = table.head_file_state();
        TableBatch {
            table,
            cur_item,
            data_buf: Vec::new(),
            index_buf: Vec::new(),
            proj_head_id,
            proj_bytes,
        }
    }

    /// The item number this batch expects next.
    pub fn cur_item(&self) -> u64 {
        self.cur_item
    }

    /// Buffers `data` as item `number`, compressing it immediately if the
    /// table has compression enabled (so size accounting below reflects the
    /// bytes that will actually hit disk).
    pub fn append(&mut self, number: u64, data: &[u8]) -> Result<()> {
        if number != self.cur_item {
            return Err(Error::OutOfOrder {
                expected: self.cur_item,
                got: number,
            });
        }

        let encoded;
        let payload: &[u8] = if self.table.compression() {
            encoded = SnappyEncoder::new()
                .compress_vec(data)
                .map_err(|e| Error::corruption(format!("compress error: {e}")))?;
            &encoded
        } else {
            data
        };

        if !self.data_buf.is_empty() && self.data_buf.len() + payload.len() > MAX_BATCH_BYTES {
            self.flush()?;
        }

        if self.proj_bytes + payload.len() as u64 > self.table.max_file_size() {
            self.flush()?;
            self.table.rotate_head_external()?;
            let (head_id, head_bytes) = self.table.head_file_state();
            self.proj_head_id = head_id;
            self.proj_bytes = head_bytes;
        }

        self.proj_bytes += payload.len() as u64;
        self.index_buf.push(IndexEntry {
            filenum: self.proj_head_id,
            offset: u32::try_from(self.proj_bytes)
                .map_err(|_| Error::corruption("data file exceeded u32 offset range"))?,
        });
        self.data_buf.extend_from_slice(payload);
        self.cur_item += 1;
        Ok(())
    }

    /// Writes every buffered item to the table in one data write and one
    /// index write, and bumps the table's head atomically. A no-op if
    /// nothing is pending. Returns the number of bytes physically written.
    pub fn flush(&mut self) -> Result<usize> {
        if self.index_buf.is_empty() {
            return Ok(0);
        }
        let first_item = self.cur_item - self.index_buf.len() as u64;
        let written = self
            .table
            .commit_batch(first_item, &self.data_buf, &self.index_buf)?;
        self.data_buf.clear();
        self.index_buf.clear();
        Ok(written)
    }

    /// Number of items buffered but not yet flushed.
    pub fn pending(&self) -> usize {
        self.index_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableOptions;
    use tempfile::tempdir;

    #[test]
    fn batch_flush_writes_all_pending_items() {
        let dir = tempdir().unwrap();
        let mut opts = TableOptions::new(dir.path(), "t");
        opts.compression = false;
        let table = FreezerTable::open(opts).unwrap();

        let mut batch = TableBatch::new(&table);
        for i in 0u64..10 {
            batch.append(i, &vec![i as u8; 8]).unwrap();
        }
        assert_eq!(batch.pending(), 10);
        batch.flush().unwrap();
        assert_eq!(batch.pending(), 0);
        assert_eq!(table.head(), 10);
        for i in 0u64..10 {
            assert_eq!(table.retrieve(i).unwrap(), vec![i as u8; 8]);
        }
    }

    #[test]
    fn batch_rolls_over_mid_batch() {
        let dir = tempdir().unwrap();
        let mut opts = TableOptions::new(dir.path(), "t");
        opts.compression = false;
        opts.max_file_size = 40;
        let table = FreezerTable::open(opts).unwrap();

        let mut batch = TableBatch::new(&table);
        for i in 0u64..6 {
            batch.append(i, &vec![i as u8; 20]).unwrap();
        }
        batch.flush().unwrap();

        for i in 0u64..6 {
            assert_eq!(table.retrieve(i).unwrap(), vec![i as u8; 20]);
        }
        assert!(dir.path().join("t.0000.rdat").exists());
        assert!(dir.path().join("t.0001.rdat").exists());
        assert!(dir.path().join("t.0002.rdat").exists());
    }

    #[test]
    fn batch_rejects_out_of_order() {
        let dir = tempdir().unwrap();
        let opts = TableOptions::new(dir.path(), "t");
        let table = FreezerTable::open(opts).unwrap();
        let mut batch = TableBatch::new(&table);
        let err = batch.append(5, b"x").unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { expected: 0, got: 5 }));
    }
}
