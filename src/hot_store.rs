//! The collaborator contract a [`crate::mover::ChainFreezerMover`] needs from
//! whatever hot key-value store holds recent, not-yet-frozen chain data.
//!
//! This crate does not implement a hot store itself — it only defines the
//! shape the mover drives. A real node wires its own KV layer in here.

use crate::error::Result;

/// Read/delete access to the hot store the mover migrates data out of.
pub trait HotStore: Send + Sync {
    /// Highest item number the hot store currently holds (the chain tip).
    fn tip_number(&self) -> u64;

    /// Reads item `number` from `kind`, or `None` if the hot store doesn't
    /// have it (already frozen, or never existed).
    fn read(&self, kind: &str, number: u64) -> Result<Option<Vec<u8>>>;

    /// Deletes the canonical entry for item `number` in `kind`.
    fn delete(&self, kind: &str, number: u64) -> Result<()>;

    /// Hashes of non-canonical (side-chain) blocks at height `number`, if
    /// any. The mover deletes these from the hot store once `number` is
    /// frozen, since no future reorg can resurrect them past the
    /// immutability threshold.
    fn side_chain_hashes_at(&self, number: u64) -> Result<Vec<Vec<u8>>>;

    /// Deletes every record keyed by `hash` across `kind`, used to clean up
    /// side-chain and dangling-descendant entries after freezing.
    fn delete_by_hash(&self, kind: &str, hash: &[u8]) -> Result<()>;

    /// Hashes of blocks whose parent is `hash`, if any are still present in
    /// the hot store. Used to walk forward from a just-deleted side-chain
    /// block to its dangling descendants, since a reorg can leave children
    /// of a discarded fork behind after their common ancestor is pruned.
    fn children_of_hash(&self, hash: &[u8]) -> Result<Vec<Vec<u8>>>;
}
