#![allow(dead_code)]

use std::fs;

use ledger_core::{constants::DIFFICULTY, pow::search_proof, store::LedgerStore, Block, Transaction};
use ledger_storage::SledStore;
use tempfile::{tempdir, TempDir};

pub fn create_temp_store() -> (TempDir, SledStore) {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().to_path_buf();
    (
        temp_dir,
        SledStore::open(db_path).expect("Failed to open SledStore"),
    )
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let db_path = temp_dir.path().to_path_buf();
    store.close().expect("Failed to flush the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    assert!(!db_path.exists(), "Database directory should be removed");
}

pub fn block_at(store: &SledStore, index: u64) -> Option<Block> {
    store
        .load_blocks()
        .expect("Failed to load blocks")
        .into_iter()
        .find(|block| block.index == index)
}

pub fn tip_index(store: &SledStore) -> Option<u64> {
    store
        .load_blocks()
        .expect("Failed to load blocks")
        .last()
        .map(|block| block.index)
}

pub fn tx(sender: &str, amount: f64, timestamp: u64) -> Transaction {
    Transaction::new(sender, "0xBBBBBB", amount, None, timestamp).expect("valid transaction")
}

/// A block on top of `parent` carrying `transactions`, with a real proof.
pub fn child_of(parent: &Block, transactions: Vec<Transaction>) -> Block {
    Block {
        index: parent.index + 1,
        timestamp: parent.timestamp + 1_000,
        transactions,
        proof: search_proof(parent.proof, DIFFICULTY),
        previous_hash: parent.hash(),
    }
}

pub fn genesis() -> Block {
    Block {
        index: 1,
        timestamp: 1_700_000_000_000,
        transactions: vec![],
        proof: 100,
        previous_hash: "1".into(),
    }
}
