//! Storage contract the ledger and peer registry persist through.
//!
//! The trait lives in `ledger-core` so storage backends can depend on the
//! core types without a cycle. [`MemoryStore`] backs the unit tests.

use crate::{Block, Transaction};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};

/// A transaction as kept in the `transactions` collection. `block_index` is
/// `None` while the transaction sits in the pending pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub tx: Transaction,
    pub block_index: Option<u64>,
}

pub trait LedgerStore: Send + Sync {
    /// All blocks ordered by index.
    fn load_blocks(&self) -> Result<Vec<Block>>;
    /// Transactions not yet sealed, in submission order.
    fn load_pending(&self) -> Result<Vec<Transaction>>;
    fn append_pending(&self, tx: &Transaction) -> Result<()>;
    /// Inserts the block and tags the pending transactions it contains with
    /// its index. Block transactions with no pending counterpart, such as a
    /// mining reward, are stored as sealed. Nothing is written on failure.
    fn commit_block(&self, block: &Block) -> Result<()>;
    /// Deletes every stored block and inserts `chain` in their place.
    fn replace_chain(&self, chain: &[Block]) -> Result<()>;
    fn load_peers(&self) -> Result<Vec<String>>;
    /// Inserts the address if absent.
    fn upsert_peer(&self, address: &str) -> Result<()>;
    fn remove_peer(&self, address: &str) -> Result<()>;
}

/// Counts transaction hashes so sealing can tag exactly as many pending
/// entries as the block holds, duplicates included.
pub fn hash_multiset(block: &Block) -> HashMap<&str, usize> {
    let mut wanted: HashMap<&str, usize> = HashMap::new();
    for tx in &block.transactions {
        *wanted.entry(tx.hash.as_str()).or_default() += 1;
    }
    wanted
}

/// Block transactions still counted in `unmatched` after pending entries were
/// tagged, in block order.
pub fn unmatched_transactions<'a>(
    block: &'a Block,
    mut unmatched: HashMap<&str, usize>,
) -> Vec<&'a Transaction> {
    block
        .transactions
        .iter()
        .filter(|tx| match unmatched.get_mut(tx.hash.as_str()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        })
        .collect()
}

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<u64, Block>,
    transactions: Vec<StoredTransaction>,
    peers: BTreeSet<String>,
}

/// In-process store with switches to simulate read and write failures.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fails `commit_block` only; other writes still succeed.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Every stored transaction, sealed or not.
    pub fn transactions(&self) -> Result<Vec<StoredTransaction>> {
        Ok(self.lock()?.transactions.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    fn read(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("simulated read failure");
        }
        self.lock()
    }

    fn write(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("simulated write failure");
        }
        self.lock()
    }
}

impl LedgerStore for MemoryStore {
    fn load_blocks(&self) -> Result<Vec<Block>> {
        Ok(self.read()?.blocks.values().cloned().collect())
    }

    fn load_pending(&self) -> Result<Vec<Transaction>> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .filter(|stored| stored.block_index.is_none())
            .map(|stored| stored.tx.clone())
            .collect())
    }

    fn append_pending(&self, tx: &Transaction) -> Result<()> {
        self.write()?.transactions.push(StoredTransaction {
            tx: tx.clone(),
            block_index: None,
        });
        Ok(())
    }

    fn commit_block(&self, block: &Block) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            bail!("simulated commit failure");
        }
        let mut state = self.write()?;
        if state.blocks.contains_key(&block.index) {
            bail!("block {} already stored", block.index);
        }
        let mut wanted = hash_multiset(block);
        for stored in state.transactions.iter_mut() {
            if stored.block_index.is_some() {
                continue;
            }
            if let Some(count) = wanted.get_mut(stored.tx.hash.as_str()) {
                if *count > 0 {
                    *count -= 1;
                    stored.block_index = Some(block.index);
                }
            }
        }
        let sealed: Vec<StoredTransaction> = unmatched_transactions(block, wanted)
            .into_iter()
            .map(|tx| StoredTransaction {
                tx: tx.clone(),
                block_index: Some(block.index),
            })
            .collect();
        state.transactions.extend(sealed);
        state.blocks.insert(block.index, block.clone());
        Ok(())
    }

    fn replace_chain(&self, chain: &[Block]) -> Result<()> {
        let mut state = self.write()?;
        state.blocks = chain.iter().map(|b| (b.index, b.clone())).collect();
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<String>> {
        Ok(self.read()?.peers.iter().cloned().collect())
    }

    fn upsert_peer(&self, address: &str) -> Result<()> {
        self.write()?.peers.insert(address.to_string());
        Ok(())
    }

    fn remove_peer(&self, address: &str) -> Result<()> {
        self.write()?.peers.remove(address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(amount: f64) -> Transaction {
        Transaction::new("0xAAAAAA", "0xBBBBBB", amount, None, 1_700_000_000_000).unwrap()
    }

    fn block(index: u64, transactions: Vec<Transaction>) -> Block {
        Block {
            index,
            timestamp: 1,
            transactions,
            proof: 0,
            previous_hash: "1".into(),
        }
    }

    #[test]
    fn commit_tags_only_sealed_duplicates() {
        let store = MemoryStore::new();
        store.append_pending(&tx(1.0)).unwrap();
        store.append_pending(&tx(1.0)).unwrap();
        store.append_pending(&tx(2.0)).unwrap();

        store.commit_block(&block(2, vec![tx(1.0)])).unwrap();

        let pending = store.load_pending().unwrap();
        assert_eq!(pending, vec![tx(1.0), tx(2.0)]);
        let sealed: Vec<_> = store
            .transactions()
            .unwrap()
            .into_iter()
            .filter(|s| s.block_index == Some(2))
            .collect();
        assert_eq!(sealed.len(), 1);
    }

    #[test]
    fn commit_stores_transactions_missing_from_pool() {
        let store = MemoryStore::new();
        store.append_pending(&tx(1.0)).unwrap();

        store
            .commit_block(&block(2, vec![tx(1.0), tx(5.0), tx(5.0)]))
            .unwrap();

        let stored = store.transactions().unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|s| s.block_index == Some(2)));
        assert!(store.load_pending().unwrap().is_empty());
    }

    #[test]
    fn failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        store.append_pending(&tx(1.0)).unwrap();
        store.set_fail_commits(true);

        assert!(store.commit_block(&block(2, vec![tx(1.0), tx(5.0)])).is_err());
        assert!(store.load_blocks().unwrap().is_empty());
        assert_eq!(store.transactions().unwrap().len(), 1);
        assert_eq!(store.load_pending().unwrap(), vec![tx(1.0)]);
        store.append_pending(&tx(2.0)).unwrap();
    }

    #[test]
    fn commit_rejects_duplicate_index() {
        let store = MemoryStore::new();
        store.commit_block(&block(1, vec![])).unwrap();
        assert!(store.commit_block(&block(1, vec![])).is_err());
    }

    #[test]
    fn replace_chain_drops_previous_blocks() {
        let store = MemoryStore::new();
        for i in 1..=3 {
            store.commit_block(&block(i, vec![])).unwrap();
        }
        store.replace_chain(&[block(1, vec![]), block(2, vec![])]).unwrap();
        let indexes: Vec<u64> = store.load_blocks().unwrap().iter().map(|b| b.index).collect();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[test]
    fn simulated_failures() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.upsert_peer("a:1").is_err());
        store.set_fail_writes(false);
        store.upsert_peer("a:1").unwrap();
        store.upsert_peer("a:1").unwrap();
        store.set_fail_reads(true);
        assert!(store.load_peers().is_err());
        store.set_fail_reads(false);
        assert_eq!(store.load_peers().unwrap(), vec!["a:1".to_string()]);
    }
}
