//! The chain-freezer background mover (§4.H): a timer-driven loop that
//! migrates items from a hot store into the freezer once they're old enough
//! to be immutable, and then cleans up what's left behind in the hot store.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::error::{Error, Result};
use crate::freezer::Freezer;
use crate::hot_store::HotStore;

/// Tuning knobs for [`ChainFreezerMover`].
#[derive(Clone, Debug)]
pub struct MoverConfig {
    /// How often the mover wakes up on its own, absent an explicit trigger.
    pub recheck_interval: Duration,
    /// Max items migrated per `modify` call, bounding how long the
    /// freezer's writer lock is held at a time.
    pub batch_limit: u64,
    /// Items within this many blocks of the hot store's tip are never
    /// frozen, however old they are by wall-clock time: the mover only
    /// migrates what can no longer be reorganized away.
    pub immutability_threshold: u64,
}

impl Default for MoverConfig {
    fn default() -> Self {
        MoverConfig {
            recheck_interval: Duration::from_secs(60),
            batch_limit: 30_000,
            immutability_threshold: 90_000,
        }
    }
}

/// Drives items from a [`HotStore`] into a [`Freezer`] on a timer, cleaning
/// up migrated and side-chain entries from the hot store as it goes.
pub struct ChainFreezerMover<H: HotStore> {
    freezer: Arc<Freezer>,
    hot: Arc<H>,
    config: MoverConfig,
    kinds: Vec<String>,
    trigger_tx: Sender<()>,
    trigger_rx: Receiver<()>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl<H: HotStore + 'static> ChainFreezerMover<H> {
    /// Builds a mover over `kinds`, all of which are appended to in lockstep
    /// on every migrated item.
    pub fn new(freezer: Arc<Freezer>, hot: Arc<H>, config: MoverConfig, kinds: Vec<String>) -> Self {
        let (trigger_tx, trigger_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        ChainFreezerMover {
            freezer,
            hot,
            config,
            kinds,
            trigger_tx,
            trigger_rx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Wakes the mover immediately instead of waiting for the next recheck
    /// tick. Safe to call from any thread; coalesces if a trigger is
    /// already pending.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Signals the mover's loop to exit after its current batch, if any.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Spawns the mover's loop on its own thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// Runs one freeze pass synchronously, without the timer/trigger loop.
    /// Exposed for tests and for callers driving the mover from their own
    /// scheduler instead of `spawn`.
    pub fn run_once(&self) -> Result<()> {
        self.freeze_once()
    }

    fn run(&self) {
        loop {
            select! {
                recv(self.shutdown_rx) -> _ => {
                    log::info!("chain freezer mover: shutting down");
                    return;
                }
                recv(self.trigger_rx) -> _ => {}
                default(self.config.recheck_interval) => {}
            }

            if let Err(e) = self.freeze_once() {
                log::warn!("chain freezer mover: freeze pass failed: {e}, backing off");
                thread::sleep(self.config.recheck_interval);
            }
        }
    }

    /// Migrates everything currently safe to freeze, in batches of at most
    /// `config.batch_limit` items, fanning each batch across every
    /// registered table and deleting the hot-store originals once the batch
    /// is committed. Side-chain siblings at each migrated height are deleted
    /// too, along with their dangling descendants: a reorg can leave a
    /// discarded fork's children behind after the fork point itself is
    /// pruned, so the cleanup walks forward from each side-chain hash until
    /// no descendants remain.
    fn freeze_once(&self) -> Result<()> {
        let tip = self.hot.tip_number();
        let safe_head = tip.saturating_sub(self.config.immutability_threshold);
        let mut frozen_to = self.freezer.ancients();

        while frozen_to < safe_head {
            let batch_end = std::cmp::min(frozen_to + self.config.batch_limit, safe_head);
            let start = frozen_to;

            self.freezer.modify(|batch| {
                for n in start..batch_end {
                    for kind in &self.kinds {
                        let data = self.hot.read(kind, n)?.ok_or_else(|| {
                            Error::corruption(format!(
                                "hot store missing item {n} in table {kind} below the immutability threshold"
                            ))
                        })?;
                        batch.append(kind, n, &data)?;
                    }
                }
                Ok(())
            })?;

            for n in start..batch_end {
                for kind in &self.kinds {
                    let _ = self.hot.delete(kind, n);
                }

                let mut frontier = self.hot.side_chain_hashes_at(n)?;
                while let Some(hash) = frontier.pop() {
                    let mut children = self.hot.children_of_hash(&hash)?;
                    for kind in &self.kinds {
                        let _ = self.hot.delete_by_hash(kind, &hash);
                    }
                    frontier.append(&mut children);
                }
            }

            frozen_to = batch_end;
            log::debug!("chain freezer mover: migrated up to item {frozen_to}");
        }
        Ok(())
    }
}
