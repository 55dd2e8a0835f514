//! The freezer aggregator (§4.E): a group of tables advancing in lockstep
//! under one directory and one process lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::batch::TableBatch;
use crate::error::{Error, Result};
use crate::lock::DirLock;
use crate::table::{FreezerTable, TableOptions, DEFAULT_MAX_FILE_SIZE, DEFAULT_OPEN_FILES_LIMIT};

/// Declares one table a freezer should manage.
#[derive(Clone)]
pub struct TableSpec {
    /// Logical name, e.g. `"headers"`.
    pub name: String,
    /// Whether items are snappy-compressed before being written.
    pub compression: bool,
    /// Whether `Freezer::truncate_tail` should prune this table. A
    /// non-prunable table (e.g. a small derived index) always keeps a
    /// virtual tail of zero.
    pub prunable: bool,
}

impl TableSpec {
    /// A compressed, prunable table — the common case (headers, bodies,
    /// receipts, ...).
    pub fn new(name: impl Into<String>) -> Self {
        TableSpec {
            name: name.into(),
            compression: true,
            prunable: true,
        }
    }

    /// Marks this table as not participating in tail pruning.
    pub fn non_prunable(mut self) -> Self {
        self.prunable = false;
        self
    }

    /// Disables compression for this table (e.g. fixed-width hashes, where
    /// snappy buys little and costs a decode on every read).
    pub fn uncompressed(mut self) -> Self {
        self.compression = false;
        self
    }
}

struct TableSlot {
    spec: TableSpec,
    table: RwLock<Arc<FreezerTable>>,
}

/// Configures and opens a [`Freezer`].
pub struct FreezerBuilder {
    dir: PathBuf,
    tables: Vec<TableSpec>,
    max_file_size: u64,
    open_files_limit: usize,
    read_only: bool,
    offset: u64,
}

impl FreezerBuilder {
    /// Starts a builder rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FreezerBuilder {
            dir: dir.into(),
            tables: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            open_files_limit: DEFAULT_OPEN_FILES_LIMIT,
            read_only: false,
            offset: 0,
        }
    }

    /// Registers a table. Tables are opened in the order they are added.
    pub fn table(mut self, spec: TableSpec) -> Self {
        self.tables.push(spec);
        self
    }

    /// Rollover boundary applied to every table.
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Cached read-only file descriptor budget applied to every table.
    pub fn open_files_limit(mut self, limit: usize) -> Self {
        self.open_files_limit = limit;
        self
    }

    /// Opens read-only: no repair, corruption is fatal, mutation fails.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Number of items that precede item 0 locally — set when earlier
    /// segments were pruned from the filesystem entirely but still count
    /// toward the global item numbering.
    pub fn starting_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Opens the freezer, acquiring its directory lock and running
    /// validate (read-only) or repair (writable) across every table.
    pub fn open(self) -> Result<Freezer> {
        let meta = fs::symlink_metadata(&self.dir);
        if let Ok(meta) = meta {
            if meta.file_type().is_symlink() {
                return Err(Error::SymlinkDatadir(self.dir));
            }
        }
        fs::create_dir_all(&self.dir)?;
        cleanup_leftover_migrations(&self.dir)?;

        let lock = DirLock::acquire(&self.dir)?;

        let mut slots = Vec::with_capacity(self.tables.len());
        let mut index = HashMap::with_capacity(self.tables.len());
        for spec in &self.tables {
            let mut opts = TableOptions::new(&self.dir, &spec.name);
            opts.compression = spec.compression;
            opts.read_only = self.read_only;
            opts.max_file_size = self.max_file_size;
            opts.open_files_limit = self.open_files_limit;
            let table = FreezerTable::open(opts)?;
            index.insert(spec.name.clone(), slots.len());
            slots.push(TableSlot {
                spec: spec.clone(),
                table: RwLock::new(Arc::new(table)),
            });
        }

        let freezer = Freezer {
            dir: self.dir,
            tables: slots,
            index,
            frozen: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            offset: self.offset,
            lock,
            read_only: self.read_only,
            write_lock: RwLock::new(()),
        };

        if self.read_only {
            freezer.validate()?;
        } else {
            freezer.repair()?;
        }

        Ok(freezer)
    }
}

/// A group of tables sharing one item counter and one process lock.
pub struct Freezer {
    dir: PathBuf,
    tables: Vec<TableSlot>,
    index: HashMap<String, usize>,
    frozen: AtomicU64,
    tail: AtomicU64,
    offset: u64,
    #[allow(dead_code)]
    lock: DirLock,
    read_only: bool,
    write_lock: RwLock<()>,
}

impl Freezer {
    fn slot(&self, kind: &str) -> Result<&TableSlot> {
        let idx = *self
            .index
            .get(kind)
            .ok_or_else(|| Error::unknown_table(kind))?;
        Ok(&self.tables[idx])
    }

    fn table(&self, kind: &str) -> Result<Arc<FreezerTable>> {
        Ok(self.slot(kind)?.table.read().clone())
    }

    fn validate(&self) -> Result<()> {
        let mut heads = Vec::new();
        let mut prunable_tails = Vec::new();
        for slot in &self.tables {
            let t = slot.table.read();
            heads.push(t.head());
            if slot.spec.prunable {
                prunable_tails.push(t.virtual_tail());
            } else if t.virtual_tail() != 0 {
                return Err(Error::corruption(format!(
                    "non-prunable table {} has nonzero virtual tail {}",
                    slot.spec.name,
                    t.virtual_tail()
                )));
            }
        }
        if let Some(first) = heads.first() {
            if heads.iter().any(|h| h != first) {
                return Err(Error::corruption(format!(
                    "tables disagree on head: {heads:?}"
                )));
            }
            self.frozen.store(*first, Ordering::SeqCst);
        }
        if let Some(first) = prunable_tails.first() {
            if prunable_tails.iter().any(|t| t != first) {
                return Err(Error::corruption(format!(
                    "prunable tables disagree on virtual tail: {prunable_tails:?}"
                )));
            }
            self.tail.store(*first, Ordering::SeqCst);
        }
        Ok(())
    }

    fn repair(&self) -> Result<()> {
        let min_head = self
            .tables
            .iter()
            .map(|s| s.table.read().head())
            .min()
            .unwrap_or(0);
        for slot in &self.tables {
            slot.table.read().truncate_head(min_head)?;
        }

        let max_tail = self
            .tables
            .iter()
            .filter(|s| s.spec.prunable)
            .map(|s| s.table.read().virtual_tail())
            .max()
            .unwrap_or(0);
        for slot in &self.tables {
            if slot.spec.prunable {
                slot.table.read().truncate_tail(max_tail)?;
            }
        }

        self.frozen.store(min_head, Ordering::SeqCst);
        self.tail.store(max_tail, Ordering::SeqCst);
        Ok(())
    }

    /// Whether item `n` (global numbering) is present in `kind`.
    pub fn has(&self, kind: &str, n: u64) -> Result<bool> {
        let table = self.table(kind)?;
        if n < self.offset {
            return Ok(false);
        }
        let local = n - self.offset;
        Ok(local >= table.virtual_tail() && local < table.head())
    }

    /// Reads item `n` (global numbering) from `kind`.
    pub fn read(&self, kind: &str, n: u64) -> Result<Vec<u8>> {
        let table = self.table(kind)?;
        if n < self.offset {
            return Err(Error::OutOfBounds {
                item: n,
                tail: self.offset,
                head: self.offset + table.head(),
            });
        }
        table.retrieve(n - self.offset)
    }

    /// Reads a contiguous range starting at global item `start`.
    pub fn read_range(
        &self,
        kind: &str,
        start: u64,
        count: u64,
        max_bytes: u64,
    ) -> Result<Vec<Vec<u8>>> {
        let table = self.table(kind)?;
        if start < self.offset {
            return Err(Error::OutOfBounds {
                item: start,
                tail: self.offset,
                head: self.offset + table.head(),
            });
        }
        table.retrieve_range(start - self.offset, count, max_bytes)
    }

    /// Global head: largest item number + 1.
    pub fn ancients(&self) -> u64 {
        self.offset + self.frozen.load(Ordering::SeqCst)
    }

    /// Global virtual tail: smallest visible item number.
    pub fn tail(&self) -> u64 {
        self.offset + self.tail.load(Ordering::SeqCst)
    }

    /// On-disk byte size of `kind`.
    pub fn size(&self, kind: &str) -> Result<u64> {
        self.table(kind)?.size()
    }

    /// Runs `f` while holding the freezer's reader-writer lock for
    /// *reading*: no `modify` call may proceed for the duration, so `f` sees
    /// a single consistent head/tail across every table it touches.
    pub fn read_transaction<T>(&self, f: impl FnOnce(&Freezer) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.read();
        f(self)
    }

    /// Holds the freezer-wide writer lock across `f`, which appends through
    /// the provided [`FreezerWriteBatch`]. On success every table's batch is
    /// flushed and the freezer's head advances by the number of items
    /// appended. On any error — from `f` itself or from a flush — every
    /// table is rolled back to the pre-call head and the error propagates.
    ///
    /// Cross-table atomicity here is best-effort at the OS-crash boundary
    /// only: a crash between two tables' flushes leaves them at different
    /// physical heads, and the next open's repair re-converges them to
    /// their common minimum.
    pub fn modify(&self, f: impl FnOnce(&mut FreezerWriteBatch) -> Result<()>) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let _guard = self.write_lock.write();
        let pre_head = self.frozen.load(Ordering::SeqCst);

        let tables: Vec<Arc<FreezerTable>> =
            self.tables.iter().map(|s| s.table.read().clone()).collect();
        let mut batch = FreezerWriteBatch::new(&self.index, &tables, self.offset);

        let result = (|| -> Result<u64> {
            f(&mut batch)?;
            let mut total_written = 0u64;
            for tb in batch.batches.values_mut() {
                total_written += tb.flush()? as u64;
            }
            Ok(total_written)
        })();

        match result {
            Ok(written) => {
                let new_head = tables
                    .first()
                    .map(|t| t.head())
                    .unwrap_or(pre_head);
                self.frozen.store(new_head, Ordering::SeqCst);
                Ok(written)
            }
            Err(e) => {
                for t in &tables {
                    let _ = t.truncate_head(pre_head);
                }
                Err(e)
            }
        }
    }

    /// Fans out to every table. A no-op if `n >= ancients()`.
    pub fn truncate_head(&self, n: u64) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let _guard = self.write_lock.write();
        let prev = self.ancients();
        if n < self.offset {
            return Err(Error::corruption(format!(
                "truncate_head({n}) is below the freezer's starting offset {}",
                self.offset
            )));
        }
        let local = n - self.offset;
        for slot in &self.tables {
            slot.table.read().truncate_head(local)?;
        }
        self.frozen.store(local, Ordering::SeqCst);
        Ok(prev)
    }

    /// Fans out to every prunable table, skipping non-prunable ones.
    pub fn truncate_tail(&self, n: u64) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let _guard = self.write_lock.write();
        let prev = self.tail();
        if n < self.offset {
            return Ok(prev);
        }
        let local = n - self.offset;
        for slot in &self.tables {
            if slot.spec.prunable {
                slot.table.read().truncate_tail(local)?;
            }
        }
        self.tail.store(local, Ordering::SeqCst);
        Ok(prev)
    }

    /// Fsyncs every table.
    pub fn sync(&self) -> Result<()> {
        for slot in &self.tables {
            slot.table.read().sync()?;
        }
        Ok(())
    }

    /// Offline rewrite of `kind` through `convert`, staged in an adjacent
    /// migration directory and cut over via per-file rename once the
    /// rewrite is complete and fsynced. Refused on a tail-pruned table
    /// (virtual tail > 0): there is no well-defined dense renumbering for a
    /// table whose visible range doesn't start at item 0.
    pub fn migrate_table(
        &self,
        kind: &str,
        convert: impl Fn(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let idx = *self
            .index
            .get(kind)
            .ok_or_else(|| Error::unknown_table(kind))?;

        let _guard = self.write_lock.write();
        let slot = &self.tables[idx];
        let old_table = slot.table.read().clone();
        if slot.spec.prunable && old_table.virtual_tail() > 0 {
            return Err(Error::not_supported(
                "migrate_table is not supported on a tail-pruned table",
            ));
        }

        let staging_root = self.dir.join("migration");
        let staging_dir = staging_root.join(kind);
        let _ = fs::remove_dir_all(&staging_dir);
        fs::create_dir_all(&staging_dir)?;

        {
            let mut opts = TableOptions::new(&staging_dir, kind);
            opts.compression = slot.spec.compression;
            let new_table = FreezerTable::open(opts)?;
            let head = old_table.head();
            for n in 0..head {
                let blob = old_table.retrieve(n)?;
                let converted = convert(&blob)?;
                new_table.append(n, &converted)?;
            }
            new_table.sync()?;
        }

        cutover_table_files(&self.dir, &staging_dir, kind)?;
        let _ = fs::remove_dir_all(&staging_root);

        let mut opts = TableOptions::new(&self.dir, kind);
        opts.compression = slot.spec.compression;
        let reopened = FreezerTable::open(opts)?;
        old_table.close();
        *slot.table.write() = Arc::new(reopened);
        Ok(())
    }

    /// Marks every table closed.
    pub fn close(&self) {
        for slot in &self.tables {
            slot.table.read().close();
        }
    }

    /// Directory this freezer is rooted at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// The per-table append surface exposed inside a [`Freezer::modify`]
/// callback. Appends are buffered per table (see
/// [`crate::batch::TableBatch`]) and only hit disk when `modify` flushes
/// them after the callback returns successfully.
pub struct FreezerWriteBatch<'t> {
    index: &'t HashMap<String, usize>,
    batches: HashMap<String, TableBatch<'t>>,
    offset: u64,
}

impl<'t> FreezerWriteBatch<'t> {
    fn new(index: &'t HashMap<String, usize>, tables: &'t [Arc<FreezerTable>], offset: u64) -> Self {
        let mut batches = HashMap::with_capacity(tables.len());
        for (name, &idx) in index {
            batches.insert(name.clone(), TableBatch::new(&tables[idx]));
        }
        FreezerWriteBatch {
            index,
            batches,
            offset,
        }
    }

    /// Buffers `data` as global item `number` in table `kind`.
    pub fn append(&mut self, kind: &str, number: u64, data: &[u8]) -> Result<()> {
        if !self.index.contains_key(kind) {
            return Err(Error::unknown_table(kind));
        }
        let local = number
            .checked_sub(self.offset)
            .ok_or_else(|| Error::corruption("append below the freezer's starting offset"))?;
        let batch = self.batches.get_mut(kind).expect("registered above");
        batch.append(local, data)
    }
}

fn cutover_table_files(root: &Path, staging_dir: &Path, name: &str) -> Result<()> {
    let prefix = format!("{name}.");
    let mut backups = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let fname = entry.file_name().to_string_lossy().to_string();
        if fname.starts_with(&prefix) {
            let backup = root.join(format!("{fname}.migrating-old"));
            fs::rename(entry.path(), &backup)?;
            backups.push(backup);
        }
    }

    let cutover = (|| -> Result<()> {
        for entry in fs::read_dir(staging_dir)? {
            let entry = entry?;
            let target = root.join(entry.file_name());
            fs::rename(entry.path(), target)?;
        }
        Ok(())
    })();

    match cutover {
        Ok(()) => {
            for backup in backups {
                crate::file_ops::remove_file_if_exists(backup)?;
            }
            Ok(())
        }
        Err(e) => {
            // Best-effort restoration; a crash here is recovered by
            // `cleanup_leftover_migrations` on the next open.
            for backup in &backups {
                if let Some(orig) = backup
                    .to_string_lossy()
                    .strip_suffix(".migrating-old")
                    .map(PathBuf::from)
                {
                    let _ = fs::rename(backup, orig);
                }
            }
            Err(e)
        }
    }
}

/// Cleans up `.migrating-old` backups and a leftover `migration/` staging
/// directory from an interrupted `migrate_table` call, so the next open
/// converges on a consistent state regardless of when the crash happened.
fn cleanup_leftover_migrations(dir: &Path) -> Result<()> {
    let migration_dir = dir.join("migration");
    if migration_dir.exists() {
        fs::remove_dir_all(&migration_dir)?;
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let fname = entry.file_name().to_string_lossy().to_string();
            if let Some(orig) = fname.strip_suffix(".migrating-old") {
                let orig_path = dir.join(orig);
                if !orig_path.exists() {
                    fs::rename(entry.path(), orig_path)?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_two_table_freezer(dir: &Path) -> Freezer {
        FreezerBuilder::new(dir)
            .table(TableSpec::new("headers"))
            .table(TableSpec::new("bodies"))
            .max_file_size(DEFAULT_MAX_FILE_SIZE)
            .open()
            .unwrap()
    }

    #[test]
    fn modify_appends_in_lockstep_across_tables() {
        let dir = tempdir().unwrap();
        let fz = open_two_table_freezer(dir.path());
        fz.modify(|b| {
            for i in 0u64..5 {
                b.append("headers", i, &vec![i as u8; 4])?;
                b.append("bodies", i, &vec![i as u8; 8])?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(fz.ancients(), 5);
        assert_eq!(fz.read("headers", 3).unwrap(), vec![3u8; 4]);
        assert_eq!(fz.read("bodies", 3).unwrap(), vec![3u8; 8]);
    }

    #[test]
    fn modify_rolls_back_every_table_on_error() {
        let dir = tempdir().unwrap();
        let fz = open_two_table_freezer(dir.path());
        fz.modify(|b| {
            b.append("headers", 0, b"a")?;
            b.append("bodies", 0, b"b")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fz.ancients(), 1);

        let err = fz.modify(|b| {
            b.append("headers", 1, b"ok")?;
            b.append("bodies", 1, b"ok")?;
            // headers moves ahead of bodies, then bodies gets an out-of-order
            // append: the whole call must fail and neither table should keep
            // its half-written item.
            b.append("headers", 2, b"ok")?;
            b.append("bodies", 5, b"boom")?;
            Ok(())
        });
        assert!(err.is_err());
        assert_eq!(fz.ancients(), 1);
        assert!(fz.read("headers", 1).is_err());
        assert!(fz.read("bodies", 1).is_err());
    }

    #[test]
    fn truncate_tail_skips_non_prunable_tables() {
        let dir = tempdir().unwrap();
        let fz = FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .table(TableSpec::new("tip_index").non_prunable())
            .open()
            .unwrap();
        fz.modify(|b| {
            for i in 0u64..10 {
                b.append("headers", i, &vec![i as u8; 4])?;
                b.append("tip_index", i, &vec![i as u8; 4])?;
            }
            Ok(())
        })
        .unwrap();

        fz.truncate_tail(6).unwrap();
        assert_eq!(fz.tail(), 6);
        assert!(fz.read("headers", 5).is_err());
        // Non-prunable table still has everything.
        assert!(fz.read("tip_index", 0).is_ok());
    }

    #[test]
    fn starting_offset_shifts_global_numbering() {
        let dir = tempdir().unwrap();
        let fz = FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .starting_offset(100)
            .open()
            .unwrap();
        fz.modify(|b| {
            b.append("headers", 100, b"first")?;
            b.append("headers", 101, b"second")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fz.ancients(), 102);
        assert_eq!(fz.tail(), 100);
        assert_eq!(fz.read("headers", 101).unwrap(), b"second");
        assert!(fz.read("headers", 0).is_err());
    }

    #[test]
    fn migrate_table_rewrites_items_in_place() {
        let dir = tempdir().unwrap();
        let fz = FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers").uncompressed())
            .open()
            .unwrap();
        fz.modify(|b| {
            for i in 0u64..5 {
                b.append("headers", i, &vec![i as u8; 4])?;
            }
            Ok(())
        })
        .unwrap();

        fz.migrate_table("headers", |data| {
            let mut out = data.to_vec();
            out.push(0xff);
            Ok(out)
        })
        .unwrap();

        for i in 0u64..5 {
            let mut expected = vec![i as u8; 4];
            expected.push(0xff);
            assert_eq!(fz.read("headers", i).unwrap(), expected);
        }
    }

    #[test]
    fn migrate_table_refuses_on_tail_pruned_table() {
        let dir = tempdir().unwrap();
        let fz = FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .open()
            .unwrap();
        fz.modify(|b| {
            for i in 0u64..5 {
                b.append("headers", i, &vec![i as u8; 4])?;
            }
            Ok(())
        })
        .unwrap();
        fz.truncate_tail(2).unwrap();

        let err = fz
            .migrate_table("headers", |data| Ok(data.to_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn open_rejects_symlinked_datadir() {
        let base = tempdir().unwrap();
        let real = base.path().join("real");
        fs::create_dir_all(&real).unwrap();
        let link = base.path().join("link");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&real, &link).unwrap();
            let err = FreezerBuilder::new(&link)
                .table(TableSpec::new("headers"))
                .open()
                .unwrap_err();
            assert!(matches!(err, Error::SymlinkDatadir(_)));
        }
    }
}
