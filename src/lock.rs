//! Process-exclusive advisory lock on a freezer directory.
//!
//! `FLOCK` is the only cross-process coordination the engine relies on: a
//! second writable open of the same directory must fail fast rather than
//! silently corrupt the first writer's files.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE_NAME: &str = "FLOCK";

/// A held exclusive lock on a freezer directory's `FLOCK` file. Released
/// when dropped.
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Attempts to acquire the exclusive lock immediately, failing with
    /// [`Error::LockFailed`] if another process already holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::LockFailed(path.clone()))?;
        Ok(DirLock { file, path })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for DirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLock").field("path", &self.path).finish()
    }
}
