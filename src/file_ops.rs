//! File helpers: open/append/truncate/read-only/copy-from.
//!
//! These are the leaf primitives every higher layer builds on. Nothing here
//! knows about index records or items; it only knows about files.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

/// Opens `path` for append, creating it if it doesn't exist. The returned
/// file's cursor is positioned at the end.
pub fn open_append(path: impl AsRef<Path>) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    Ok(file)
}

/// Opens `path` read-only. Used for historical data files and for
/// read-only table/freezer handles.
pub fn open_readonly(path: impl AsRef<Path>) -> Result<File> {
    let file = OpenOptions::new().read(true).open(path)?;
    Ok(file)
}

/// Creates (or replaces) `path` truncated to zero length, opened for
/// read-write. Used when rolling over to a new head data file.
pub fn open_truncate(path: impl AsRef<Path>) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(file)
}

/// Resizes `file` to `size` bytes and seeks to the new end.
///
/// Used both to grow a freshly re-opened file back to its expected size (a
/// no-op in practice, since files don't grow on re-open) and, more commonly,
/// to shrink a file back to a previously committed offset during repair or
/// truncation.
pub fn truncate(file: &mut File, size: u64) -> Result<()> {
    file.set_len(size)?;
    file.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Writes `prologue` into a fresh temp file alongside `dst`, then appends
/// `src[offset..]`, then atomically renames the temp file over `dst`.
///
/// `src == dst` is explicitly supported: the source is read in full (or from
/// `offset` onward) before the rename target is touched, so overwriting a
/// file with a prefix-modified copy of itself is safe. This is the
/// primitive tail-truncation's index rewrite relies on.
pub fn copy_from(src: &Path, dst: &Path, offset: u64, prologue: &[u8]) -> Result<()> {
    let tmp_path = tmp_sibling(dst);
    {
        let mut tmp = open_truncate(&tmp_path)?;
        tmp.write_all(prologue)?;

        let mut src_file = open_readonly(src)?;
        src_file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        src_file.read_to_end(&mut buf)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, dst)?;
    Ok(())
}

fn tmp_sibling(dst: &Path) -> std::path::PathBuf {
    let mut name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".copyfrom.tmp");
    dst.with_file_name(name)
}

/// Removes a file if present, ignoring a not-found error (idempotent
/// cleanup used by head/tail truncation and migration cutover).
pub fn remove_file_if_exists(path: impl AsRef<Path>) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
