//! An entirely in-memory stand-in for a [`crate::freezer::Freezer`] (§4.F).
//!
//! Used by tests and by callers (e.g. an in-process devnet) that want the
//! same dense-item-number semantics without touching disk. Mirrors the
//! on-disk freezer's API one-for-one so callers can swap between them
//! through [`crate::ancient_store::AncientStore`] without branching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::freezer::TableSpec;

struct MemTable {
    spec: TableSpec,
    items: RwLock<Vec<Vec<u8>>>,
    /// Count of items hidden by tail truncation; `items[0]` corresponds to
    /// item number `deleted_offset`.
    deleted_offset: AtomicU64,
}

impl MemTable {
    fn head(&self) -> u64 {
        self.deleted_offset.load(Ordering::SeqCst) + self.items.read().len() as u64
    }

    fn tail(&self) -> u64 {
        self.deleted_offset.load(Ordering::SeqCst)
    }
}

/// RAM-backed freezer with the same dense item-numbering contract as
/// [`crate::freezer::Freezer`].
pub struct MemoryFreezer {
    tables: Vec<MemTable>,
    index: HashMap<String, usize>,
    write_lock: RwLock<()>,
}

impl MemoryFreezer {
    /// Builds a freezer over `tables`, empty.
    pub fn new(tables: Vec<TableSpec>) -> Self {
        let mut index = HashMap::with_capacity(tables.len());
        let mem_tables = tables
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                index.insert(spec.name.clone(), i);
                MemTable {
                    spec,
                    items: RwLock::new(Vec::new()),
                    deleted_offset: AtomicU64::new(0),
                }
            })
            .collect();
        MemoryFreezer {
            tables: mem_tables,
            index,
            write_lock: RwLock::new(()),
        }
    }

    fn table(&self, kind: &str) -> Result<&MemTable> {
        let idx = *self
            .index
            .get(kind)
            .ok_or_else(|| Error::unknown_table(kind))?;
        Ok(&self.tables[idx])
    }

    /// Whether item `n` is present in `kind`.
    pub fn has(&self, kind: &str, n: u64) -> Result<bool> {
        let t = self.table(kind)?;
        Ok(n >= t.tail() && n < t.head())
    }

    /// Reads item `n` from `kind`.
    pub fn read(&self, kind: &str, n: u64) -> Result<Vec<u8>> {
        let t = self.table(kind)?;
        let tail = t.tail();
        let head = t.head();
        if n < tail || n >= head {
            return Err(Error::OutOfBounds {
                item: n,
                tail,
                head,
            });
        }
        Ok(t.items.read()[(n - tail) as usize].clone())
    }

    /// Reads a contiguous range, same semantics as
    /// [`crate::table::FreezerTable::retrieve_range`].
    pub fn read_range(&self, kind: &str, start: u64, count: u64, max_bytes: u64) -> Result<Vec<Vec<u8>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let t = self.table(kind)?;
        let tail = t.tail();
        let head = t.head();
        if start < tail || start >= head {
            return Err(Error::OutOfBounds {
                item: start,
                tail,
                head,
            });
        }
        let items = t.items.read();
        let last = std::cmp::min(start + count, head);
        let mut out = Vec::new();
        let mut budget = 0u64;
        for n in start..last {
            let item = &items[(n - tail) as usize];
            if !out.is_empty() && max_bytes > 0 && budget + item.len() as u64 > max_bytes {
                break;
            }
            budget += item.len() as u64;
            out.push(item.clone());
        }
        Ok(out)
    }

    /// Largest item number across tables, plus one (assumes all tables are
    /// kept in lockstep by the caller via [`MemoryFreezer::modify`]).
    pub fn ancients(&self) -> u64 {
        self.tables.first().map(|t| t.head()).unwrap_or(0)
    }

    /// Smallest visible item number.
    pub fn tail(&self) -> u64 {
        self.tables
            .iter()
            .filter(|t| t.spec.prunable)
            .map(|t| t.tail())
            .max()
            .unwrap_or(0)
    }

    /// Sum of buffered payload bytes for `kind`.
    pub fn size(&self, kind: &str) -> Result<u64> {
        let t = self.table(kind)?;
        Ok(t.items.read().iter().map(|i| i.len() as u64).sum())
    }

    /// No-op: nothing here ever leaves memory.
    pub fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Shared-lock read transaction, matching the on-disk freezer.
    pub fn read_transaction<T>(&self, f: impl FnOnce(&MemoryFreezer) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.read();
        f(self)
    }

    /// Buffers appends through a [`MemoryWriteBatch`], committing them only
    /// if `f` returns `Ok`. On error every table is rolled back to its
    /// pre-call length.
    pub fn modify(&self, f: impl FnOnce(&mut MemoryWriteBatch) -> Result<()>) -> Result<u64> {
        let _guard = self.write_lock.write();
        let pre_lens: Vec<usize> = self.tables.iter().map(|t| t.items.read().len()).collect();
        let mut batch = MemoryWriteBatch {
            index: &self.index,
            pending: self.tables.iter().map(|t| (t.head(), Vec::new())).collect(),
        };

        let result = f(&mut batch);
        match result {
            Ok(()) => {
                let mut written = 0u64;
                for (idx, (_, items)) in batch.pending.into_iter().enumerate() {
                    written += items.iter().map(|i: &Vec<u8>| i.len() as u64).sum::<u64>();
                    self.tables[idx].items.write().extend(items);
                }
                Ok(written)
            }
            Err(e) => {
                for (idx, pre_len) in pre_lens.into_iter().enumerate() {
                    self.tables[idx].items.write().truncate(pre_len);
                }
                Err(e)
            }
        }
    }

    /// Fans out to every table.
    pub fn truncate_head(&self, n: u64) -> Result<u64> {
        let _guard = self.write_lock.write();
        let prev = self.ancients();
        for t in &self.tables {
            let tail = t.tail();
            let new_len = n.saturating_sub(tail) as usize;
            let mut items = t.items.write();
            if new_len < items.len() {
                items.truncate(new_len);
            }
        }
        Ok(prev)
    }

    /// Fans out to every prunable table.
    pub fn truncate_tail(&self, n: u64) -> Result<u64> {
        let _guard = self.write_lock.write();
        let prev = self.tail();
        for t in &self.tables {
            if !t.spec.prunable {
                continue;
            }
            let tail = t.tail();
            if n <= tail {
                continue;
            }
            let drop_count = (n - tail) as usize;
            let mut items = t.items.write();
            let drop_count = drop_count.min(items.len());
            items.drain(0..drop_count);
            t.deleted_offset.fetch_add(drop_count as u64, Ordering::SeqCst);
        }
        Ok(prev)
    }

    /// Marks the freezer closed. In-memory state is simply dropped; there is
    /// nothing to flush.
    pub fn close(&self) {}
}

/// The per-table append surface inside a [`MemoryFreezer::modify`] callback.
pub struct MemoryWriteBatch<'t> {
    index: &'t HashMap<String, usize>,
    pending: Vec<(u64, Vec<Vec<u8>>)>,
}

impl<'t> MemoryWriteBatch<'t> {
    /// Buffers `data` as item `number` in table `kind`.
    pub fn append(&mut self, kind: &str, number: u64, data: &[u8]) -> Result<()> {
        let idx = *self
            .index
            .get(kind)
            .ok_or_else(|| Error::unknown_table(kind))?;
        let (expected, pending) = &mut self.pending[idx];
        let cur_item = *expected + pending.len() as u64;
        if number != cur_item {
            return Err(Error::OutOfOrder {
                expected: cur_item,
                got: number,
            });
        }
        pending.push(data.to_vec());
        Ok(())
    }
}
