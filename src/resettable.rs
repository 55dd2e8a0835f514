//! A freezer wrapper that can be dropped and rebuilt from scratch (§4.G).
//!
//! Used where the caller's notion of "ancient" data changes wholesale — a
//! chain reorg past the freezing point, or a resync that invalidates
//! everything already migrated. `reset` closes the current freezer, moves
//! its directory aside, deletes it, and reopens an empty one in its place.
//! A crash between the move and the delete leaves a `.reset.tmp` directory
//! behind; the next open finishes the delete before doing anything else.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::freezer::{Freezer, FreezerBuilder, TableSpec};

fn tmp_sibling(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".reset.tmp");
    dir.with_file_name(name)
}

/// Removes a leftover `.reset.tmp` directory from an interrupted reset.
fn cleanup_leftover_reset(dir: &Path) -> Result<()> {
    let tmp = tmp_sibling(dir);
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    Ok(())
}

/// Fixed configuration a [`ResettableFreezer`] remembers so it can rebuild
/// an identical, empty freezer after a reset.
struct Config {
    dir: PathBuf,
    tables: Vec<TableSpec>,
    max_file_size: u64,
    open_files_limit: usize,
    read_only: bool,
}

impl Config {
    fn open(&self) -> Result<Freezer> {
        let mut builder = FreezerBuilder::new(&self.dir)
            .max_file_size(self.max_file_size)
            .open_files_limit(self.open_files_limit)
            .read_only(self.read_only);
        for spec in &self.tables {
            builder = builder.table(spec.clone());
        }
        builder.open()
    }
}

/// Wraps a [`Freezer`], adding an atomic-drop-and-recreate `reset`.
pub struct ResettableFreezer {
    config: Config,
    inner: RwLock<Option<Freezer>>,
}

impl ResettableFreezer {
    /// Opens (or creates) a writable freezer at `dir` with the given
    /// tables. Use [`ResettableFreezer::open_read_only`] for a read-only
    /// handle, which refuses `reset`.
    pub fn open(
        dir: impl Into<PathBuf>,
        tables: Vec<TableSpec>,
        max_file_size: u64,
        open_files_limit: usize,
    ) -> Result<Self> {
        Self::open_with(dir, tables, max_file_size, open_files_limit, false)
    }

    /// Opens `dir` read-only. `reset` fails with [`Error::ReadOnly`] on the
    /// returned handle.
    pub fn open_read_only(
        dir: impl Into<PathBuf>,
        tables: Vec<TableSpec>,
        max_file_size: u64,
        open_files_limit: usize,
    ) -> Result<Self> {
        Self::open_with(dir, tables, max_file_size, open_files_limit, true)
    }

    fn open_with(
        dir: impl Into<PathBuf>,
        tables: Vec<TableSpec>,
        max_file_size: u64,
        open_files_limit: usize,
        read_only: bool,
    ) -> Result<Self> {
        let dir = dir.into();
        cleanup_leftover_reset(&dir)?;
        let config = Config {
            dir,
            tables,
            max_file_size,
            open_files_limit,
            read_only,
        };
        let freezer = config.open()?;
        Ok(ResettableFreezer {
            config,
            inner: RwLock::new(Some(freezer)),
        })
    }

    fn with_inner<T>(&self, f: impl FnOnce(&Freezer) -> Result<T>) -> Result<T> {
        let guard = self.inner.read();
        let freezer = guard.as_ref().ok_or(Error::Closed)?;
        f(freezer)
    }

    /// See [`Freezer::has`].
    pub fn has(&self, kind: &str, n: u64) -> Result<bool> {
        self.with_inner(|f| f.has(kind, n))
    }

    /// See [`Freezer::read`].
    pub fn read(&self, kind: &str, n: u64) -> Result<Vec<u8>> {
        self.with_inner(|f| f.read(kind, n))
    }

    /// See [`Freezer::read_range`].
    pub fn read_range(&self, kind: &str, start: u64, count: u64, max_bytes: u64) -> Result<Vec<Vec<u8>>> {
        self.with_inner(|f| f.read_range(kind, start, count, max_bytes))
    }

    /// See [`Freezer::ancients`].
    pub fn ancients(&self) -> u64 {
        self.with_inner(|f| Ok(f.ancients())).unwrap_or(0)
    }

    /// See [`Freezer::tail`].
    pub fn tail(&self) -> u64 {
        self.with_inner(|f| Ok(f.tail())).unwrap_or(0)
    }

    /// See [`Freezer::size`].
    pub fn size(&self, kind: &str) -> Result<u64> {
        self.with_inner(|f| f.size(kind))
    }

    /// See [`Freezer::sync`].
    pub fn sync(&self) -> Result<()> {
        self.with_inner(|f| f.sync())
    }

    /// See [`Freezer::modify`]. The closure's append surface is the same
    /// [`crate::freezer::FreezerWriteBatch`] the underlying freezer uses.
    pub fn modify(
        &self,
        f: impl FnOnce(&mut crate::freezer::FreezerWriteBatch) -> Result<()>,
    ) -> Result<u64> {
        self.with_inner(|freezer| freezer.modify(f))
    }

    /// See [`Freezer::truncate_head`].
    pub fn truncate_head(&self, n: u64) -> Result<u64> {
        self.with_inner(|f| f.truncate_head(n))
    }

    /// See [`Freezer::truncate_tail`].
    pub fn truncate_tail(&self, n: u64) -> Result<u64> {
        self.with_inner(|f| f.truncate_tail(n))
    }

    /// See [`Freezer::migrate_table`].
    pub fn migrate_table(&self, kind: &str, convert: impl Fn(&[u8]) -> Result<Vec<u8>>) -> Result<()> {
        self.with_inner(|f| f.migrate_table(kind, &convert))
    }

    /// Closes the current freezer, deletes its directory, and reopens an
    /// empty freezer with the same table configuration in its place. Never
    /// supported on a read-only handle.
    pub fn reset(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        let mut guard = self.inner.write();
        let old = guard.take().ok_or(Error::Closed)?;
        old.close();
        drop(old);

        let tmp = tmp_sibling(&self.config.dir);
        let _ = fs::remove_dir_all(&tmp);
        fs::rename(&self.config.dir, &tmp)?;
        fs::create_dir_all(&self.config.dir)?;
        fs::remove_dir_all(&tmp)?;

        let fresh = self.config.open()?;
        *guard = Some(fresh);
        Ok(())
    }

    /// Closes the wrapped freezer without reopening it. Further calls fail
    /// with [`Error::Closed`] until the process restarts and reopens it.
    pub fn close(&self) {
        if let Some(f) = self.inner.write().take() {
            f.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reset_drops_all_data_and_reopens_empty() {
        let dir = tempdir().unwrap();
        let rf = ResettableFreezer::open(
            dir.path(),
            vec![TableSpec::new("headers")],
            crate::table::DEFAULT_MAX_FILE_SIZE,
            crate::table::DEFAULT_OPEN_FILES_LIMIT,
        )
        .unwrap();
        rf.modify(|b| {
            for i in 0u64..5 {
                b.append("headers", i, &vec![i as u8; 4])?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(rf.ancients(), 5);

        rf.reset().unwrap();
        assert_eq!(rf.ancients(), 0);
        assert!(rf.read("headers", 0).is_err());

        rf.modify(|b| b.append("headers", 0, b"fresh")).unwrap();
        assert_eq!(rf.read("headers", 0).unwrap(), b"fresh");
    }

    #[test]
    fn reset_is_refused_on_a_read_only_handle() {
        let dir = tempdir().unwrap();
        {
            let rf = ResettableFreezer::open(
                dir.path(),
                vec![TableSpec::new("headers")],
                crate::table::DEFAULT_MAX_FILE_SIZE,
                crate::table::DEFAULT_OPEN_FILES_LIMIT,
            )
            .unwrap();
            rf.modify(|b| b.append("headers", 0, b"x")).unwrap();
        }

        let rf = ResettableFreezer::open_read_only(
            dir.path(),
            vec![TableSpec::new("headers")],
            crate::table::DEFAULT_MAX_FILE_SIZE,
            crate::table::DEFAULT_OPEN_FILES_LIMIT,
        )
        .unwrap();
        let err = rf.reset().unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
    }

    #[test]
    fn open_cleans_up_leftover_reset_tmp_dir() {
        let dir = tempdir().unwrap();
        let tmp = tmp_sibling(dir.path());
        fs::create_dir_all(tmp.join("junk")).unwrap();
        assert!(tmp.exists());

        let _rf = ResettableFreezer::open(
            dir.path(),
            vec![TableSpec::new("headers")],
            crate::table::DEFAULT_MAX_FILE_SIZE,
            crate::table::DEFAULT_OPEN_FILES_LIMIT,
        )
        .unwrap();
        assert!(!tmp.exists());
    }
}
