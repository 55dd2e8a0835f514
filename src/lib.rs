//! Append-only freezer storage engine for moving immutable chain data into
//! flat files, leaving the hot key-value store holding only the recent,
//! still-mutable suffix of the chain.

mod ancient_store;
mod batch;
mod error;
mod file_ops;
mod freezer;
mod hot_store;
mod index;
mod lock;
mod memory;
mod metrics;
mod mover;
mod resettable;
mod table;

pub use ancient_store::{AncientStore, WriteBatch};
pub use error::{Error, Result};
pub use freezer::{Freezer, FreezerBuilder, FreezerWriteBatch, TableSpec};
pub use hot_store::HotStore;
pub use memory::{MemoryFreezer, MemoryWriteBatch};
pub use metrics::{set_sink, Sink};
pub use mover::{ChainFreezerMover, MoverConfig};
pub use resettable::ResettableFreezer;
pub use table::{FreezerTable, TableOptions, DEFAULT_MAX_FILE_SIZE, DEFAULT_OPEN_FILES_LIMIT};
