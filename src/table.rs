//! The freezer table: one logical append-only stream backed by an index
//! file, N rolled-over data files, and a meta sidecar.
//!
//! This is the workhorse of the engine (§4.C of the design). Everything
//! above it (the batch writer, the freezer aggregator) is bookkeeping on
//! top of `append`/`retrieve`/`retrieve_range`/`truncate_head`/
//! `truncate_tail`.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use snap::raw::{Decoder as SnappyDecoder, Encoder as SnappyEncoder};

use crate::error::{Error, Result};
use crate::file_ops;
use crate::index::{IndexEntry, Metadata, INDEX_ENTRY_SIZE};
use crate::metrics;

/// Default rollover boundary for a table's data files: ~2 GB, matching the
/// go-ethereum freezer's default and tunable per table via the builder.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2_000_000_000;

/// Default number of historical (read-only) data file descriptors cached
/// per table.
pub const DEFAULT_OPEN_FILES_LIMIT: usize = 256;

fn index_name(name: &str, compression: bool) -> String {
    format!("{name}.{}", if compression { "cidx" } else { "ridx" })
}

fn data_name(name: &str, filenum: u32, compression: bool) -> String {
    format!(
        "{name}.{filenum:04}.{}",
        if compression { "cdat" } else { "rdat" }
    )
}

fn meta_name(name: &str) -> String {
    format!("{name}.meta")
}

/// Mutable file-descriptor state guarded by the table's reader-writer lock.
struct TableState {
    /// Cached read-only historical data files.
    files: LruCache<u32, Arc<File>>,
    /// The current head data file, opened read-write (unless the table
    /// itself is read-only).
    head_file: File,
    /// Number of bytes written to the head file.
    head_bytes: u64,
    /// File-number of the head file.
    head_id: u32,
    /// File-number of the earliest retained data file.
    tail_id: u32,
    /// The index file.
    index: File,
    /// The meta sidecar file.
    meta: File,
    /// Whether the meta file needs to be rewritten in the current format
    /// (set when a legacy-layout record was read).
    meta_needs_upgrade: bool,
}

/// One logical append-only stream: headers, bodies, receipts, etc.
pub struct FreezerTable {
    name: String,
    dir: PathBuf,
    compression: bool,
    read_only: bool,
    max_file_size: u64,

    state: RwLock<TableState>,

    /// Current head item count (dense item numbers are `< head`).
    head: AtomicU64,
    /// Logical tail: items `< virtual_tail` are not visible.
    virtual_tail: AtomicU64,
    /// Count of items physically removed by prior tail truncations.
    item_offset: AtomicU64,

    closed: std::sync::atomic::AtomicBool,
}

/// Configuration for constructing a [`FreezerTable`].
pub struct TableOptions<'a> {
    /// Directory the table's files live in (already created by the owning
    /// freezer).
    pub dir: &'a Path,
    /// Logical table name, e.g. `"headers"`.
    pub name: &'a str,
    /// Whether items are snappy-compressed before being written.
    pub compression: bool,
    /// Open the table read-only: no repair, no writes, corruption is
    /// fatal instead of corrected.
    pub read_only: bool,
    /// Rollover boundary for data files.
    pub max_file_size: u64,
    /// Bound on cached read-only data-file descriptors.
    pub open_files_limit: usize,
}

impl<'a> TableOptions<'a> {
    /// Starts from sane defaults for `name` under `dir`.
    pub fn new(dir: &'a Path, name: &'a str) -> Self {
        TableOptions {
            dir,
            name,
            compression: true,
            read_only: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            open_files_limit: DEFAULT_OPEN_FILES_LIMIT,
        }
    }
}

impl FreezerTable {
    /// Opens (creating if absent) the table described by `opts`, running
    /// repair (writable) or validate (read-only), then preopening every
    /// data file from tail to head.
    pub fn open(opts: TableOptions<'_>) -> Result<FreezerTable> {
        fs::create_dir_all(opts.dir)?;

        let index_path = opts.dir.join(index_name(opts.name, opts.compression));
        let meta_path = opts.dir.join(meta_name(opts.name));

        fail::fail_point!("open_read_only");
        let mut index = if opts.read_only {
            file_ops::open_readonly(&index_path)?
        } else {
            file_ops::open_append(&index_path)?
        };
        let mut meta = if opts.read_only {
            file_ops::open_readonly(&meta_path)?
        } else {
            file_ops::open_append(&meta_path)?
        };

        let (tail_id, item_offset, head_index, mut index_len, meta_upgraded, virtual_tail) =
            repair_or_validate(&mut index, &mut meta, opts.read_only)?;

        let head_id = head_index.filenum;
        let head_path = opts.dir.join(data_name(opts.name, head_id, opts.compression));
        let mut head_file = if opts.read_only {
            file_ops::open_readonly(&head_path)?
        } else {
            file_ops::open_append(&head_path)?
        };
        let mut head_bytes = head_file.seek(SeekFrom::End(0))?;
        let mut expected = head_index.offset as u64;

        let mut head_filenum = head_id;
        let mut index_records = index_len / INDEX_ENTRY_SIZE; // including sentinel

        while expected != head_bytes {
            if opts.read_only {
                return Err(Error::corruption(format!(
                    "table {} is inconsistent: index expects head {} bytes, data has {}",
                    opts.name, expected, head_bytes
                )));
            }
            if expected < head_bytes {
                log::warn!(
                    "freezer table {}: truncating dangling data {} -> {}",
                    opts.name,
                    head_bytes,
                    expected
                );
                file_ops::truncate(&mut head_file, expected)?;
                head_bytes = expected;
            } else {
                log::warn!(
                    "freezer table {}: dropping dangling index record ({} > {})",
                    opts.name,
                    expected,
                    head_bytes
                );
                index_len -= INDEX_ENTRY_SIZE;
                index_records -= 1;
                file_ops::truncate(&mut index, index_len)?;
                let new_last = read_index_record(&mut index, index_records - 1)?;
                if new_last.filenum != head_filenum {
                    // Slipped back into an earlier file; the files above it
                    // are orphaned repair residue.
                    for fnum in (new_last.filenum + 1)..=head_filenum {
                        file_ops::remove_file_if_exists(
                            opts.dir.join(data_name(opts.name, fnum, opts.compression)),
                        )?;
                    }
                    let reopened_path =
                        opts.dir.join(data_name(opts.name, new_last.filenum, opts.compression));
                    head_file = if opts.read_only {
                        file_ops::open_readonly(&reopened_path)?
                    } else {
                        file_ops::open_append(&reopened_path)?
                    };
                    head_bytes = head_file.seek(SeekFrom::End(0))?;
                    head_filenum = new_last.filenum;
                }
                expected = new_last.offset as u64;
            }
        }

        if !opts.read_only {
            head_file.sync_all()?;
            index.sync_all()?;
            meta.sync_all()?;
        }

        let head = item_offset + (index_records - 1);

        let mut files = LruCache::new(
            std::num::NonZeroUsize::new(opts.open_files_limit.max(2)).expect("limit > 1"),
        );
        for fnum in tail_id..head_filenum {
            let path = opts.dir.join(data_name(opts.name, fnum, opts.compression));
            files.put(fnum, Arc::new(file_ops::open_readonly(path)?));
        }

        let table = FreezerTable {
            name: opts.name.to_string(),
            dir: opts.dir.to_path_buf(),
            compression: opts.compression,
            read_only: opts.read_only,
            max_file_size: opts.max_file_size,
            state: RwLock::new(TableState {
                files,
                head_file,
                head_bytes,
                head_id: head_filenum,
                tail_id,
                index,
                meta,
                meta_needs_upgrade: meta_upgraded,
            }),
            head: AtomicU64::new(head),
            virtual_tail: AtomicU64::new(virtual_tail.max(item_offset)),
            item_offset: AtomicU64::new(item_offset),
            closed: std::sync::atomic::AtomicBool::new(false),
        };

        if !table.read_only {
            let needs_upgrade = table.state.read().meta_needs_upgrade;
            if needs_upgrade {
                table.persist_virtual_tail(table.virtual_tail.load(Ordering::SeqCst))?;
            }
        }

        Ok(table)
    }

    /// Logical table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current head (largest item number + 1).
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    /// Current virtual tail (smallest visible item number).
    pub fn virtual_tail(&self) -> u64 {
        self.virtual_tail.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Appends `data` as item `number`. Expected to be called with the
    /// owning batch/freezer write lock already held; this method itself
    /// takes only the table's own lock across the index+data write.
    pub fn append(&self, number: u64, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let expected = self.head.load(Ordering::SeqCst);
        if expected != number {
            fail::fail_point!("append-unexpected-number");
            return Err(Error::OutOfOrder {
                expected,
                got: number,
            });
        }

        let encoded;
        let payload: &[u8] = if self.compression {
            encoded = SnappyEncoder::new()
                .compress_vec(data)
                .map_err(|e| Error::corruption(format!("compress error: {e}")))?;
            &encoded
        } else {
            data
        };

        let mut state = self.state.write();
        let result = (|| -> Result<usize> {
            let pre_head_bytes = state.head_bytes;
            let pre_head_id = state.head_id;

            if state.head_bytes + payload.len() as u64 > self.max_file_size
            {
                self.rotate_head(&mut state)?;
            }

            if let Err(e) = self.write_item(&mut state, payload) {
                // Roll back: undo any rotation and restore prior head size.
                if state.head_id != pre_head_id {
                    self.rollback_rotation(&mut state, pre_head_id)?;
                }
                let _ = file_ops::truncate(&mut state.head_file, pre_head_bytes);
                state.head_bytes = pre_head_bytes;
                return Err(e);
            }

            self.head.fetch_add(1, Ordering::SeqCst);
            metrics::gauge(
                "ckb-freezer.size",
                payload.len() as i64 + INDEX_ENTRY_SIZE as i64,
            );
            Ok(payload.len())
        })();
        result
    }

    fn write_item(&self, state: &mut TableState, payload: &[u8]) -> Result<()> {
        fail::fail_point!("write-head");
        state.head_file.write_all(payload)?;
        state.head_bytes += payload.len() as u64;
        let entry = IndexEntry {
            filenum: state.head_id,
            offset: u32::try_from(state.head_bytes).map_err(|_| {
                Error::corruption("data file exceeded u32 offset range")
            })?,
        };
        fail::fail_point!("write-index");
        state.index.seek(SeekFrom::End(0))?;
        state.index.write_all(&entry.encode())?;
        Ok(())
    }

    fn rotate_head(&self, state: &mut TableState) -> Result<()> {
        fail::fail_point!("open_truncated");
        let old_id = state.head_id;
        let next_id = old_id + 1;
        let new_path = self
            .dir
            .join(data_name(&self.name, next_id, self.compression));
        let new_head = file_ops::open_truncate(&new_path)?;

        // Release the old head from the cache (it was never cached, only
        // historical files are), then reopen it read-only for future reads.
        let old_path = self
            .dir
            .join(data_name(&self.name, old_id, self.compression));
        state.files.put(old_id, Arc::new(file_ops::open_readonly(old_path)?));

        state.head_file = new_head;
        state.head_id = next_id;
        state.head_bytes = 0;
        Ok(())
    }

    fn rollback_rotation(&self, state: &mut TableState, restore_to: u32) -> Result<()> {
        let cur_path = self
            .dir
            .join(data_name(&self.name, state.head_id, self.compression));
        file_ops::remove_file_if_exists(&cur_path)?;
        state.files.pop(&restore_to);
        let restore_path = self
            .dir
            .join(data_name(&self.name, restore_to, self.compression));
        state.head_file = file_ops::open_append(&restore_path)?;
        state.head_id = restore_to;
        Ok(())
    }

    /// Reads item `n`. `virtual_tail <= n < head` or this returns
    /// [`Error::OutOfBounds`].
    pub fn retrieve(&self, n: u64) -> Result<Vec<u8>> {
        self.check_open()?;
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.virtual_tail.load(Ordering::SeqCst);
        if n < tail || n >= head {
            return Err(Error::OutOfBounds {
                item: n,
                tail,
                head,
            });
        }

        let state = self.state.read();
        let item_offset = self.item_offset.load(Ordering::SeqCst);
        let local = n - item_offset; // position within the index body (0-based after sentinel)
        let start_entry = self.read_record(&state, local)?;
        let end_entry = self.read_record(&state, local + 1)?;
        let (start, end, filenum) = start_entry.bounds(&end_entry);

        let raw = self.read_span(&state, filenum, start, end)?;
        drop(state);

        if self.compression {
            SnappyDecoder::new()
                .decompress_vec(&raw)
                .map_err(|e| Error::corruption(format!("decompress item {n}: {e}")))
        } else {
            Ok(raw)
        }
    }

    /// Reads a contiguous range starting at `start`, returning at least one
    /// item (if any is in range) and stopping once either `count` items have
    /// been returned or the cumulative decompressed size would exceed
    /// `max_bytes` (`0` means unbounded). Coalesces contiguous index ranges
    /// into one `pread` per data file touched.
    pub fn retrieve_range(&self, start: u64, count: u64, max_bytes: u64) -> Result<Vec<Vec<u8>>> {
        self.check_open()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.virtual_tail.load(Ordering::SeqCst);
        if start < tail || start >= head {
            return Err(Error::OutOfBounds {
                item: start,
                tail,
                head,
            });
        }

        let item_offset = self.item_offset.load(Ordering::SeqCst);
        let last = std::cmp::min(start + count, head);
        let state = self.state.read();

        let mut entries = Vec::with_capacity((last - start + 1) as usize);
        for n in start..=last {
            entries.push(self.read_record(&state, n - item_offset)?);
        }

        let mut out = Vec::new();
        let mut budget_used: u64 = 0;
        let mut i = 0usize;
        while i + 1 < entries.len() {
            // Find the run of consecutive entries sharing a file so we can
            // issue a single read for the whole run.
            let filenum = entries[i + 1].filenum;
            let run_start = i;
            let mut j = i;
            while j + 1 < entries.len() && entries[j + 1].filenum == filenum {
                j += 1;
            }
            let (span_start, _, _) = entries[run_start].bounds(&entries[run_start + 1]);
            let (_, span_end, _) = entries[j].bounds(&entries[j + 1]);
            let blob = self.read_span(&state, filenum, span_start, span_end)?;

            for k in run_start..j {
                let (s, e, _) = entries[k].bounds(&entries[k + 1]);
                let rel_start = (s - span_start) as usize;
                let rel_end = (e - span_start) as usize;
                let raw = &blob[rel_start..rel_end];
                let item = if self.compression {
                    SnappyDecoder::new()
                        .decompress_vec(raw)
                        .map_err(|e| Error::corruption(format!("decompress range item: {e}")))?
                } else {
                    raw.to_vec()
                };
                if !out.is_empty() && max_bytes > 0 && budget_used + item.len() as u64 > max_bytes
                {
                    return Ok(out);
                }
                budget_used += item.len() as u64;
                out.push(item);
                if out.len() as u64 >= count {
                    return Ok(out);
                }
            }
            i = j + 1;
        }
        Ok(out)
    }

    /// Returns the index record marking the *end* of item `local_index`
    /// (0-based from `item_offset`), i.e. record `local_index + 1`.
    fn read_entry(&self, state: &TableState, local_index: u64) -> Result<IndexEntry> {
        self.read_record(state, local_index + 1)
    }

    /// Returns index record `absolute_index` verbatim — record 0 is the
    /// sentinel, record `k` (`k >= 1`) marks the end of item `k - 1`. Pairing
    /// record `local` with record `local + 1` via [`IndexEntry::bounds`]
    /// yields the byte range of item `local`.
    fn read_record(&self, state: &TableState, absolute_index: u64) -> Result<IndexEntry> {
        let mut index = &state.index;
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        index.seek(SeekFrom::Start(absolute_index * INDEX_ENTRY_SIZE))?;
        index.read_exact(&mut buf)?;
        IndexEntry::decode(&buf)
    }

    fn read_span(&self, state: &TableState, filenum: u32, start: u64, end: u64) -> Result<Vec<u8>> {
        let size = (end - start) as usize;
        let mut buf = vec![0u8; size];
        if filenum == state.head_id {
            let mut f = state.head_file.try_clone()?;
            f.seek(SeekFrom::Start(start))?;
            f.read_exact(&mut buf)?;
        } else if let Some(f) = state.files.peek(&filenum) {
            let mut f = f.as_ref().try_clone()?;
            f.seek(SeekFrom::Start(start))?;
            f.read_exact(&mut buf)?;
        } else {
            let path = self
                .dir
                .join(data_name(&self.name, filenum, self.compression));
            let mut f = file_ops::open_readonly(path)?;
            f.seek(SeekFrom::Start(start))?;
            f.read_exact(&mut buf)?;
        }
        metrics::counter("ckb-freezer.read", size as u64 + 2 * INDEX_ENTRY_SIZE);
        Ok(buf)
    }

    /// Truncates the head down to `new_head`. A no-op if `new_head >=
    /// head`. Fails if `new_head < virtual_tail`.
    pub fn truncate_head(&self, new_head: u64) -> Result<u64> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let prev_head = self.head.load(Ordering::SeqCst);
        if new_head >= prev_head {
            return Ok(prev_head);
        }
        let tail = self.virtual_tail.load(Ordering::SeqCst);
        if new_head < tail {
            return Err(Error::corruption(format!(
                "truncate_head({new_head}) would underflow tail {tail}"
            )));
        }

        let item_offset = self.item_offset.load(Ordering::SeqCst);
        let mut state = self.state.write();

        let new_records = new_head - item_offset + 1; // sentinel + surviving items
        file_ops::truncate(&mut state.index, new_records * INDEX_ENTRY_SIZE)?;

        let last = self.read_entry(&state, new_records - 2)?;
        if last.filenum != state.head_id {
            for fnum in (last.filenum + 1)..=state.head_id {
                let path = self.dir.join(data_name(&self.name, fnum, self.compression));
                file_ops::remove_file_if_exists(path)?;
                state.files.pop(&fnum);
            }
            let reopen_path = self
                .dir
                .join(data_name(&self.name, last.filenum, self.compression));
            state.head_file = file_ops::open_append(reopen_path)?;
            state.head_id = last.filenum;
        }
        file_ops::truncate(&mut state.head_file, last.offset as u64)?;
        state.head_bytes = last.offset as u64;
        state.head_file.sync_all()?;
        state.index.sync_all()?;

        self.head.store(new_head, Ordering::SeqCst);
        Ok(prev_head)
    }

    /// Hides items below `new_tail`, physically dropping data files once
    /// every item they contain is hidden. A no-op if `new_tail <=
    /// virtual_tail`. Fails if `new_tail > head`.
    pub fn truncate_tail(&self, new_tail: u64) -> Result<u64> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let prev_tail = self.virtual_tail.load(Ordering::SeqCst);
        if new_tail <= prev_tail {
            return Ok(prev_tail);
        }
        let head = self.head.load(Ordering::SeqCst);
        if new_tail > head {
            return Err(Error::corruption(format!(
                "truncate_tail({new_tail}) exceeds head {head}"
            )));
        }

        let mut state = self.state.write();
        let item_offset = self.item_offset.load(Ordering::SeqCst);

        let target_entry = if new_tail == head {
            // Every item is hidden; the target file is wherever the head
            // currently sits.
            IndexEntry {
                filenum: state.head_id,
                offset: state.head_bytes as u32,
            }
        } else {
            self.read_entry(&state, new_tail - item_offset)?
        };
        let target_file = target_entry.filenum;

        self.virtual_tail.store(new_tail, Ordering::SeqCst);
        self.persist_virtual_tail_locked(&mut state, new_tail)?;

        if target_file == state.tail_id {
            return Ok(prev_tail);
        }

        // Find the index position of the earliest surviving item so the
        // rewritten index can share the old body's tail. Tables are small
        // enough in practice (bounded by file count, not item count) for a
        // linear scan here to be cheap.
        let old_item_offset = item_offset;
        let total_records = (state.index.metadata()?.len()) / INDEX_ENTRY_SIZE;
        let mut cut_local = 0u64;
        for local in 0..(total_records - 1) {
            let entry = self.read_entry(&state, local)?;
            if entry.filenum >= target_file {
                cut_local = local;
                break;
            }
        }
        let new_item_offset = old_item_offset + cut_local;

        let index_path = self.dir.join(index_name(&self.name, self.compression));
        let sentinel = IndexEntry::sentinel(
            target_file,
            u32::try_from(new_item_offset).unwrap_or(u32::MAX),
        );
        let prologue_start_byte = (cut_local + 1) * INDEX_ENTRY_SIZE;
        file_ops::copy_from(
            &index_path,
            &index_path,
            prologue_start_byte,
            &sentinel.encode(),
        )?;
        state.index = file_ops::open_append(&index_path)?;

        for fnum in state.tail_id..target_file {
            let path = self.dir.join(data_name(&self.name, fnum, self.compression));
            file_ops::remove_file_if_exists(path)?;
            state.files.pop(&fnum);
        }
        state.tail_id = target_file;
        self.item_offset.store(new_item_offset, Ordering::SeqCst);

        Ok(prev_tail)
    }

    fn persist_virtual_tail(&self, new_tail: u64) -> Result<()> {
        let mut state = self.state.write();
        self.persist_virtual_tail_locked(&mut state, new_tail)
    }

    fn persist_virtual_tail_locked(&self, state: &mut TableState, new_tail: u64) -> Result<()> {
        let meta = Metadata {
            version: crate::index::META_VERSION,
            virtual_tail: new_tail,
        };
        state.meta.set_len(0)?;
        state.meta.seek(SeekFrom::Start(0))?;
        state.meta.write_all(&meta.encode())?;
        state.meta.sync_all()?;
        state.meta_needs_upgrade = false;
        Ok(())
    }

    /// Fsyncs the head data file, index, and meta files.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let state = self.state.read();
        state.head_file.sync_all()?;
        state.index.sync_all()?;
        state.meta.sync_all()?;
        Ok(())
    }

    /// Total on-disk bytes for this table: every present data file plus the
    /// index file.
    pub fn size(&self) -> Result<u64> {
        self.check_open()?;
        let state = self.state.read();
        let mut total = state.index.metadata()?.len();
        total += state.meta.metadata()?.len();
        for fnum in state.tail_id..=state.head_id {
            let path = self.dir.join(data_name(&self.name, fnum, self.compression));
            if let Ok(meta) = fs::metadata(path) {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Marks the table closed; further operations fail with
    /// [`Error::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether items are compressed before being written. Used by
    /// [`crate::batch::TableBatch`] to compress in the same place a direct
    /// `append` would.
    pub(crate) fn compression(&self) -> bool {
        self.compression
    }

    /// Configured rollover boundary. Used by the batch writer to decide
    /// when a pending blob needs a mid-batch rollover.
    pub(crate) fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Current head file-number and its byte length.
    pub(crate) fn head_file_state(&self) -> (u32, u64) {
        let state = self.state.read();
        (state.head_id, state.head_bytes)
    }

    /// Physically rotates the head file, as `append` would when a single
    /// item overflows it. Exposed for the batch writer's mid-batch
    /// rollover, where the flush that precedes the rotation has already
    /// made the old head file's committed length final.
    pub(crate) fn rotate_head_external(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut state = self.state.write();
        self.rotate_head(&mut state)
    }

    /// Commits a pre-buffered batch: one data write, one index write, one
    /// head bump. `entries` must all share a single file-number (the batch
    /// writer guarantees this by flushing before every mid-batch rollover)
    /// and `first_item` must equal the table's current head.
    pub(crate) fn commit_batch(
        &self,
        first_item: u64,
        data: &[u8],
        entries: &[IndexEntry],
    ) -> Result<usize> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if entries.is_empty() {
            return Ok(0);
        }
        let expected = self.head.load(Ordering::SeqCst);
        if expected != first_item {
            return Err(Error::OutOfOrder {
                expected,
                got: first_item,
            });
        }

        let mut state = self.state.write();
        let pre_head_bytes = state.head_bytes;
        let result = (|| -> Result<usize> {
            if entries[0].filenum != state.head_id {
                return Err(Error::corruption(
                    "batch targets a file-number other than the current head",
                ));
            }
            state.head_file.write_all(data)?;
            state.index.seek(SeekFrom::End(0))?;
            for entry in entries {
                state.index.write_all(&entry.encode())?;
            }
            state.head_bytes = entries.last().expect("non-empty").offset as u64;
            Ok(data.len())
        })();

        match result {
            Ok(written) => {
                self.head.fetch_add(entries.len() as u64, Ordering::SeqCst);
                metrics::gauge(
                    "ckb-freezer.size",
                    written as i64 + entries.len() as i64 * INDEX_ENTRY_SIZE as i64,
                );
                Ok(written)
            }
            Err(e) => {
                let _ = file_ops::truncate(&mut state.head_file, pre_head_bytes);
                state.head_bytes = pre_head_bytes;
                Err(e)
            }
        }
    }
}

/// Runs repair (writable) or validate (read-only) over an open index/meta
/// pair, returning `(tail_id, item_offset, last_index_record,
/// index_file_len, meta_needed_upgrade, virtual_tail)`.
fn repair_or_validate(
    index: &mut File,
    meta: &mut File,
    read_only: bool,
) -> Result<(u32, u64, IndexEntry, u64, bool, u64)> {
    let mut len = index.seek(SeekFrom::End(0))?;
    let remainder = len % INDEX_ENTRY_SIZE;
    if remainder != 0 {
        if read_only {
            return Err(Error::corruption("index file length is not a multiple of the record size"));
        }
        len -= remainder;
        file_ops::truncate(index, len)?;
    }

    if len == 0 {
        if read_only {
            return Err(Error::corruption("index file is empty"));
        }
        index.write_all(&IndexEntry::default().encode())?;
        len = INDEX_ENTRY_SIZE;
    }

    let mut count = len / INDEX_ENTRY_SIZE;
    let sentinel = read_index_record(index, 0)?;

    // Validate monotonicity, truncating at the first violation.
    let mut prev = sentinel;
    let mut first = true;
    let mut valid_records = 1u64;
    for i in 1..count {
        let rec = read_index_record(index, i)?;
        let ok = if first {
            rec.filenum == sentinel.filenum || rec.filenum == sentinel.filenum + 1
        } else {
            !(rec.filenum < prev.filenum
                || (rec.filenum == prev.filenum && rec.offset < prev.offset)
                || (rec.filenum == prev.filenum + 1 && rec.offset == 0))
        };
        if !ok {
            if read_only {
                return Err(Error::corruption(format!(
                    "index record {i} violates monotonicity"
                )));
            }
            log::warn!("freezer: truncating index at record {i} (corruption)");
            break;
        }
        valid_records += 1;
        prev = rec;
        first = false;
    }
    if valid_records < count {
        len = valid_records * INDEX_ENTRY_SIZE;
        file_ops::truncate(index, len)?;
        count = valid_records;
    }

    let tail_id = sentinel.filenum;
    let item_offset = sentinel.offset as u64;

    let mut meta_buf = Vec::new();
    meta.seek(SeekFrom::Start(0))?;
    meta.read_to_end(&mut meta_buf)?;
    let (virtual_tail, meta_upgraded) = if meta_buf.is_empty() {
        (item_offset, false)
    } else {
        match Metadata::decode(&meta_buf) {
            Ok(m) => (m.virtual_tail, m.version < crate::index::META_VERSION),
            Err(e) => {
                if read_only {
                    return Err(e);
                }
                log::warn!("freezer: meta record corrupt, resetting to item_offset: {e}");
                (item_offset, true)
            }
        }
    };

    let last = read_index_record(index, count - 1)?;
    Ok((tail_id, item_offset, last, len, meta_upgraded, virtual_tail))
}

fn read_index_record(index: &mut File, i: u64) -> Result<IndexEntry> {
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    index.seek(SeekFrom::Start(i * INDEX_ENTRY_SIZE))?;
    index.read_exact(&mut buf)?;
    IndexEntry::decode(&buf)
}
