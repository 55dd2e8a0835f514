//! End-to-end chain-freezer mover test (§8 scenario S6): seed a hot store,
//! raise the immutability threshold so nothing is eligible, lower it, then
//! verify the mover migrates exactly the newly-eligible range and cleans up
//! the hot store behind it.

use ckb_freezer::{ChainFreezerMover, Error, FreezerBuilder, HotStore, MoverConfig, Result, TableSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct SeededHotStore {
    tip: Mutex<u64>,
    canonical: Mutex<HashMap<u64, HashMap<String, Vec<u8>>>>,
    side_chains: Mutex<HashMap<u64, Vec<Vec<u8>>>>,
    children: Mutex<HashMap<Vec<u8>, Vec<Vec<u8>>>>,
    deleted: Mutex<Vec<u64>>,
    hashes_deleted: Mutex<Vec<Vec<u8>>>,
}

impl SeededHotStore {
    fn new(tip: u64) -> Self {
        SeededHotStore {
            tip: Mutex::new(tip),
            canonical: Mutex::new(HashMap::new()),
            side_chains: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            hashes_deleted: Mutex::new(Vec::new()),
        }
    }

    fn seed(&self, n: u64, kinds: &[&str]) {
        let mut record = HashMap::new();
        for kind in kinds {
            record.insert(kind.to_string(), vec![(n % 251) as u8; 12]);
        }
        self.canonical.lock().insert(n, record);
    }

    fn seed_side_chain(&self, at: u64, hash: Vec<u8>) {
        self.side_chains.lock().entry(at).or_default().push(hash);
    }

    fn seed_child(&self, parent: Vec<u8>, child: Vec<u8>) {
        self.children.lock().entry(parent).or_default().push(child);
    }
}

impl HotStore for SeededHotStore {
    fn tip_number(&self) -> u64 {
        *self.tip.lock()
    }

    fn read(&self, kind: &str, number: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .canonical
            .lock()
            .get(&number)
            .and_then(|rec| rec.get(kind).cloned()))
    }

    fn delete(&self, _kind: &str, number: u64) -> Result<()> {
        self.canonical.lock().remove(&number);
        self.deleted.lock().push(number);
        Ok(())
    }

    fn side_chain_hashes_at(&self, number: u64) -> Result<Vec<Vec<u8>>> {
        Ok(self.side_chains.lock().remove(&number).unwrap_or_default())
    }

    fn delete_by_hash(&self, _kind: &str, hash: &[u8]) -> Result<()> {
        self.hashes_deleted.lock().push(hash.to_vec());
        Ok(())
    }

    fn children_of_hash(&self, hash: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.children.lock().remove(hash).unwrap_or_default())
    }
}

#[test]
fn mover_migrates_exactly_the_eligible_range_and_retains_genesis() {
    const TIP: u64 = 10_000;
    let kinds = ["headers", "bodies"];

    let hot = Arc::new(SeededHotStore::new(TIP));
    for n in 0..TIP {
        hot.seed(n, &kinds);
    }

    let dir = tempfile::tempdir().unwrap();
    let freezer = Arc::new(
        FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .table(TableSpec::new("bodies"))
            .open()
            .unwrap(),
    );

    // With the threshold set above the current tip, nothing is eligible yet.
    let dormant_mover = ChainFreezerMover::new(
        freezer.clone(),
        hot.clone(),
        MoverConfig {
            recheck_interval: Duration::from_millis(10),
            batch_limit: 30_000,
            immutability_threshold: 60_000,
        },
        kinds.iter().map(|s| s.to_string()).collect(),
    );
    dormant_mover.run_once().unwrap();
    assert_eq!(freezer.ancients(), 0);

    // Lowering the threshold makes everything up to tip-100 eligible.
    let mover = ChainFreezerMover::new(
        freezer.clone(),
        hot.clone(),
        MoverConfig {
            recheck_interval: Duration::from_millis(10),
            batch_limit: 30_000,
            immutability_threshold: 100,
        },
        kinds.iter().map(|s| s.to_string()).collect(),
    );
    mover.run_once().unwrap();

    assert_eq!(freezer.ancients(), TIP - 100);
    for n in 0..(TIP - 100) {
        for kind in kinds {
            assert_eq!(
                freezer.read(kind, n).unwrap(),
                vec![(n % 251) as u8; 12]
            );
        }
    }
    // Migrated items are gone from the hot store...
    for n in 0..(TIP - 100) {
        assert!(hot.read("headers", n).unwrap().is_none());
    }
    // ...but the still-recent suffix and genesis weren't touched.
    assert!(hot.read("headers", TIP - 1).unwrap().is_some());
    assert!(!hot.deleted.lock().contains(&(TIP - 1)));
}

#[test]
fn mover_resume_after_partial_freeze_does_not_duplicate_items() {
    const TOTAL: u64 = 50;
    let kinds = ["headers"];
    let hot = Arc::new(SeededHotStore::new(TOTAL));
    for n in 0..TOTAL {
        hot.seed(n, &kinds);
    }

    let dir = tempfile::tempdir().unwrap();
    let freezer = Arc::new(
        FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .open()
            .unwrap(),
    );

    // First pass only gets partway, as if interrupted after a few batches.
    let mover = ChainFreezerMover::new(
        freezer.clone(),
        hot.clone(),
        MoverConfig {
            recheck_interval: Duration::from_millis(10),
            batch_limit: 7,
            immutability_threshold: 0,
        },
        kinds.iter().map(|s| s.to_string()).collect(),
    );
    mover.run_once().unwrap();
    let partial_head = freezer.ancients();
    assert!(partial_head > 0 && partial_head <= TOTAL);

    // Resuming (a fresh mover instance, as after a restart) must continue
    // from where it left off and reach the same final head, without
    // re-appending already-migrated items.
    let resumed = ChainFreezerMover::new(
        freezer.clone(),
        hot.clone(),
        MoverConfig {
            recheck_interval: Duration::from_millis(10),
            batch_limit: 7,
            immutability_threshold: 0,
        },
        kinds.iter().map(|s| s.to_string()).collect(),
    );
    resumed.run_once().unwrap();

    assert_eq!(freezer.ancients(), TOTAL);
    for n in 0..TOTAL {
        assert_eq!(
            freezer.read("headers", n).unwrap(),
            vec![(n % 251) as u8; 12]
        );
    }
}

#[test]
fn mover_deletes_side_chain_descendants_transitively() {
    let kinds = ["headers"];
    let hot = Arc::new(SeededHotStore::new(20));
    for n in 0..20u64 {
        hot.seed(n, &kinds);
    }

    // A side-chain block at height 5 with two generations of descendants
    // left behind by an earlier reorg.
    let fork = vec![0xAA];
    let grandchild_a = vec![0xBB];
    let grandchild_b = vec![0xCC];
    let great_grandchild = vec![0xDD];
    hot.seed_side_chain(5, fork.clone());
    hot.seed_child(fork.clone(), grandchild_a.clone());
    hot.seed_child(fork.clone(), grandchild_b.clone());
    hot.seed_child(grandchild_a.clone(), great_grandchild.clone());

    let dir = tempfile::tempdir().unwrap();
    let freezer = Arc::new(
        FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .open()
            .unwrap(),
    );
    let mover = ChainFreezerMover::new(
        freezer.clone(),
        hot.clone(),
        MoverConfig {
            recheck_interval: Duration::from_millis(10),
            batch_limit: 30,
            immutability_threshold: 0,
        },
        kinds.iter().map(|s| s.to_string()).collect(),
    );
    mover.run_once().unwrap();

    assert_eq!(freezer.ancients(), 20);
    let deleted = hot.hashes_deleted.lock();
    for hash in [&fork, &grandchild_a, &grandchild_b, &great_grandchild] {
        assert!(deleted.contains(hash), "expected {hash:?} to be cleaned up");
    }
}

#[test]
fn missing_hot_store_record_aborts_the_batch_with_corruption() {
    let kinds = ["headers"];
    let hot = Arc::new(SeededHotStore::new(10));
    // Deliberately leave item 3 unseeded.
    for n in [0u64, 1, 2, 4, 5, 6, 7, 8, 9] {
        hot.seed(n, &kinds);
    }

    let dir = tempfile::tempdir().unwrap();
    let freezer = Arc::new(
        FreezerBuilder::new(dir.path())
            .table(TableSpec::new("headers"))
            .open()
            .unwrap(),
    );
    let mover = ChainFreezerMover::new(
        freezer.clone(),
        hot,
        MoverConfig {
            recheck_interval: Duration::from_millis(10),
            batch_limit: 30,
            immutability_threshold: 0,
        },
        kinds.iter().map(|s| s.to_string()).collect(),
    );

    let err = mover.run_once().unwrap_err();
    assert!(matches!(err, Error::Corruption(_)));
    // Nothing from the aborted batch should have been committed.
    assert_eq!(freezer.ancients(), 0);
}
