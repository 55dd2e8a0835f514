//! Unifies the three concrete ancient-item stores behind one capability set
//! (§9): disk-backed, in-memory, and resettable. A tagged enum rather than a
//! trait object, since the set of implementations is closed and callers
//! generally know at construction time which one they built.

use crate::error::{Error, Result};
use crate::freezer::{Freezer, FreezerWriteBatch};
use crate::memory::{MemoryFreezer, MemoryWriteBatch};
use crate::resettable::ResettableFreezer;

/// The append surface a [`AncientStore::modify`] callback writes through,
/// regardless of which concrete store backs it.
pub trait WriteBatch {
    /// Buffers `data` as item `number` in table `kind`.
    fn append(&mut self, kind: &str, number: u64, data: &[u8]) -> Result<()>;
}

impl<'t> WriteBatch for FreezerWriteBatch<'t> {
    fn append(&mut self, kind: &str, number: u64, data: &[u8]) -> Result<()> {
        FreezerWriteBatch::append(self, kind, number, data)
    }
}

impl<'t> WriteBatch for MemoryWriteBatch<'t> {
    fn append(&mut self, kind: &str, number: u64, data: &[u8]) -> Result<()> {
        MemoryWriteBatch::append(self, kind, number, data)
    }
}

/// One of the three concrete ancient-item stores.
pub enum AncientStore {
    /// Flat-file backed, the production path.
    Disk(Freezer),
    /// RAM-backed, for tests and in-process use.
    Memory(MemoryFreezer),
    /// Disk-backed but droppable wholesale via `reset`.
    Resettable(ResettableFreezer),
}

impl AncientStore {
    /// Whether item `n` is present in `kind`.
    pub fn has(&self, kind: &str, n: u64) -> Result<bool> {
        match self {
            AncientStore::Disk(f) => f.has(kind, n),
            AncientStore::Memory(m) => m.has(kind, n),
            AncientStore::Resettable(r) => r.has(kind, n),
        }
    }

    /// Reads item `n` from `kind`.
    pub fn read(&self, kind: &str, n: u64) -> Result<Vec<u8>> {
        match self {
            AncientStore::Disk(f) => f.read(kind, n),
            AncientStore::Memory(m) => m.read(kind, n),
            AncientStore::Resettable(r) => r.read(kind, n),
        }
    }

    /// Reads a contiguous range starting at `start`.
    pub fn read_range(&self, kind: &str, start: u64, count: u64, max_bytes: u64) -> Result<Vec<Vec<u8>>> {
        match self {
            AncientStore::Disk(f) => f.read_range(kind, start, count, max_bytes),
            AncientStore::Memory(m) => m.read_range(kind, start, count, max_bytes),
            AncientStore::Resettable(r) => r.read_range(kind, start, count, max_bytes),
        }
    }

    /// Global head: largest item number + 1.
    pub fn ancients(&self) -> u64 {
        match self {
            AncientStore::Disk(f) => f.ancients(),
            AncientStore::Memory(m) => m.ancients(),
            AncientStore::Resettable(r) => r.ancients(),
        }
    }

    /// Global virtual tail: smallest visible item number.
    pub fn tail(&self) -> u64 {
        match self {
            AncientStore::Disk(f) => f.tail(),
            AncientStore::Memory(m) => m.tail(),
            AncientStore::Resettable(r) => r.tail(),
        }
    }

    /// On-disk (or in-memory) byte size of `kind`.
    pub fn size(&self, kind: &str) -> Result<u64> {
        match self {
            AncientStore::Disk(f) => f.size(kind),
            AncientStore::Memory(m) => m.size(kind),
            AncientStore::Resettable(r) => r.size(kind),
        }
    }

    /// Flushes any buffered writes to their durable medium. A no-op for the
    /// in-memory variant.
    pub fn sync(&self) -> Result<()> {
        match self {
            AncientStore::Disk(f) => f.sync(),
            AncientStore::Memory(m) => m.sync(),
            AncientStore::Resettable(r) => r.sync(),
        }
    }

    /// Runs `f` under the store's read lock, so a multi-table read sees a
    /// single consistent head/tail. The resettable variant does not hold a
    /// lock spanning the whole call (each delegated read takes its own),
    /// which only matters if a concurrent `reset` can interleave.
    pub fn read_transaction<T>(&self, f: impl FnOnce(&AncientStore) -> Result<T>) -> Result<T> {
        match self {
            AncientStore::Disk(fz) => fz.read_transaction(|_| f(self)),
            AncientStore::Memory(m) => m.read_transaction(|_| f(self)),
            AncientStore::Resettable(_) => f(self),
        }
    }

    /// Runs `f` against a per-table write batch, committing every table on
    /// success or rolling every table back on error.
    pub fn modify(&self, f: impl FnOnce(&mut dyn WriteBatch) -> Result<()>) -> Result<u64> {
        match self {
            AncientStore::Disk(fz) => fz.modify(|b| f(b)),
            AncientStore::Memory(m) => m.modify(|b| f(b)),
            AncientStore::Resettable(r) => r.modify(|b| f(b)),
        }
    }

    /// Fans out to every table.
    pub fn truncate_head(&self, n: u64) -> Result<u64> {
        match self {
            AncientStore::Disk(f) => f.truncate_head(n),
            AncientStore::Memory(m) => m.truncate_head(n),
            AncientStore::Resettable(r) => r.truncate_head(n),
        }
    }

    /// Fans out to every prunable table.
    pub fn truncate_tail(&self, n: u64) -> Result<u64> {
        match self {
            AncientStore::Disk(f) => f.truncate_tail(n),
            AncientStore::Memory(m) => m.truncate_tail(n),
            AncientStore::Resettable(r) => r.truncate_tail(n),
        }
    }

    /// Rewrites `kind` through `convert`. Not supported on the in-memory
    /// variant, which returns [`Error::NotSupported`].
    pub fn migrate_table(&self, kind: &str, convert: impl Fn(&[u8]) -> Result<Vec<u8>>) -> Result<()> {
        match self {
            AncientStore::Disk(f) => f.migrate_table(kind, convert),
            AncientStore::Resettable(r) => r.migrate_table(kind, convert),
            AncientStore::Memory(_) => Err(Error::not_supported(
                "migrate_table is not supported on the in-memory store",
            )),
        }
    }

    /// Drops all data and reopens empty. Only supported on the resettable
    /// variant.
    pub fn reset(&self) -> Result<()> {
        match self {
            AncientStore::Resettable(r) => r.reset(),
            _ => Err(Error::not_supported(
                "reset is only supported on the resettable store",
            )),
        }
    }

    /// Marks the store closed.
    pub fn close(&self) {
        match self {
            AncientStore::Disk(f) => f.close(),
            AncientStore::Memory(m) => m.close(),
            AncientStore::Resettable(r) => r.close(),
        }
    }
}
