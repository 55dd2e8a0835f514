//! Error types for the freezer storage engine.
//!
//! A single typed [`Error`] enum covers every failure mode named in the
//! design: callers match on [`ErrorKind`]-shaped variants instead of
//! downcasting through `std::io::Error::other`, while the file-helper and
//! table layers still propagate raw I/O failures with `?` via
//! `From<std::io::Error>`.

use std::io;
use thiserror::Error;

/// Errors returned by the freezer storage engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation issued on a closed table or freezer.
    #[error("operation on a closed freezer/table")]
    Closed,

    /// Read below the virtual tail or at/above the head.
    #[error("item {item} out of bounds (tail={tail}, head={head})")]
    OutOfBounds {
        /// The item number that was requested.
        item: u64,
        /// The current virtual tail.
        tail: u64,
        /// The current head.
        head: u64,
    },

    /// A table kind was requested that is not configured for this freezer.
    #[error("unknown table {0:?}")]
    UnknownTable(String),

    /// Append target did not equal the current head.
    #[error("out-of-order append: expected {expected}, got {got}")]
    OutOfOrder {
        /// The expected next item number (current head).
        expected: u64,
        /// The item number actually supplied.
        got: u64,
    },

    /// Mutation attempted on a read-only handle.
    #[error("mutation attempted on a read-only freezer/table")]
    ReadOnly,

    /// The freezer directory is a symlink; refused for safety.
    #[error("freezer directory {0:?} is a symlink, refusing to open")]
    SymlinkDatadir(std::path::PathBuf),

    /// The `FLOCK` advisory lock could not be acquired.
    #[error("failed to acquire exclusive lock on freezer directory {0:?}")]
    LockFailed(std::path::PathBuf),

    /// Detected a non-recoverable on-disk inconsistency.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The requested operation is not supported in this configuration.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for building a [`Error::Corruption`].
    pub fn corruption<S: Into<String>>(reason: S) -> Self {
        Error::Corruption(reason.into())
    }

    /// Shorthand for building a [`Error::NotSupported`].
    pub fn not_supported<S: Into<String>>(reason: S) -> Self {
        Error::NotSupported(reason.into())
    }

    /// Shorthand for building a [`Error::UnknownTable`].
    pub fn unknown_table<S: Into<String>>(kind: S) -> Self {
        Error::UnknownTable(kind.into())
    }

    /// True if this error represents a read past the visible range, as
    /// opposed to a structural failure.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Error::OutOfBounds { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
