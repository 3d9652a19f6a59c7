//! The ledger: sealed chain plus pending pool, persisted through a
//! [`LedgerStore`].
//!
//! All mutation happens under one write lock and only after the store has
//! accepted the change, so a failed write leaves memory as it was and a
//! reader sees either the whole old chain or the whole new one.

use crate::constants::{DIFFICULTY, GENESIS_PROOF, GENESIS_SENTINEL};
use crate::pow::valid_proof;
use crate::store::LedgerStore;
use crate::validate::{is_valid, validate_chain};
use crate::{now_millis, Block, Hash, LedgerError, Result, Transaction};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Genesis block: index 1, fixed proof, sentinel previous hash, no transactions.
pub fn genesis_block() -> Block {
    Block {
        index: 1,
        timestamp: now_millis(),
        transactions: vec![],
        proof: GENESIS_PROOF,
        previous_hash: GENESIS_SENTINEL.to_string(),
    }
}

struct LedgerState {
    chain: Vec<Block>,
    pending: Vec<Transaction>,
}

impl LedgerState {
    fn tip(&self) -> &Block {
        self.chain.last().expect("chain always holds the genesis block")
    }
}

pub struct Ledger<S: LedgerStore> {
    store: Arc<S>,
    state: RwLock<LedgerState>,
}

impl<S: LedgerStore> Ledger<S> {
    /// Loads the persisted chain and pending pool. Read failures degrade to an
    /// empty state; an empty chain gets a freshly persisted genesis block.
    pub fn open(store: Arc<S>) -> Result<Self> {
        let (mut chain, unreadable) = match store.load_blocks() {
            Ok(chain) => (chain, false),
            Err(err) => {
                warn!("could not load blocks, starting from an empty chain: {err:#}");
                (Vec::new(), true)
            }
        };
        let pending = store.load_pending().unwrap_or_else(|err| {
            warn!("could not load pending transactions, starting with an empty pool: {err:#}");
            Vec::new()
        });

        if chain.is_empty() {
            let genesis = genesis_block();
            // unreadable block data is overwritten rather than appended to
            let persisted = if unreadable {
                store.replace_chain(std::slice::from_ref(&genesis))
            } else {
                store.commit_block(&genesis)
            };
            persisted.map_err(LedgerError::Persistence)?;
            info!("created genesis block");
            chain.push(genesis);
        } else if let Err(violation) = validate_chain(&chain) {
            warn!("persisted chain failed validation: {violation}");
        }

        info!(
            "ledger opened with {} block(s) and {} pending transaction(s)",
            chain.len(),
            pending.len()
        );
        Ok(Self {
            store,
            state: RwLock::new(LedgerState { chain, pending }),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Adds a transaction to the pending pool. Returns the index of the block
    /// that will hold it together with the queued transaction. Identical
    /// transactions are kept as distinct entries.
    pub fn new_transaction(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: f64,
        signature: Option<String>,
        timestamp: Option<u64>,
    ) -> Result<(u64, Transaction)> {
        let tx = Transaction::new(
            sender,
            recipient,
            amount,
            signature,
            timestamp.unwrap_or_else(now_millis),
        )?;
        let mut state = self.write();
        self.store
            .append_pending(&tx)
            .map_err(LedgerError::Persistence)?;
        debug!("queued transaction {}", tx.hash);
        state.pending.push(tx.clone());
        Ok((state.tip().index + 1, tx))
    }

    /// Seals the pending pool into a new block. `previous_hash` defaults to the
    /// hash of the current tip.
    pub fn seal_block(&self, proof: u64, previous_hash: Option<Hash>) -> Result<Block> {
        let mut state = self.write();
        self.seal_locked(&mut state, proof, previous_hash, None)
    }

    /// Seals on top of `parent` only if it is still the tip and `proof` links
    /// to it. Used after a proof search that ran without holding the lock.
    ///
    /// `reward` is appended after the pending transactions and reaches the
    /// store only as part of the committed block; it never enters the pool.
    pub fn seal_on(
        &self,
        parent: &Block,
        proof: u64,
        reward: Option<Transaction>,
    ) -> Result<Block> {
        let mut state = self.write();
        let parent_hash = parent.hash();
        if state.tip().hash() != parent_hash {
            return Err(LedgerError::StaleTip);
        }
        if !valid_proof(parent.proof, proof, DIFFICULTY) {
            return Err(LedgerError::InvalidProof);
        }
        self.seal_locked(&mut state, proof, Some(parent_hash), reward)
    }

    fn seal_locked(
        &self,
        state: &mut LedgerState,
        proof: u64,
        previous_hash: Option<Hash>,
        reward: Option<Transaction>,
    ) -> Result<Block> {
        let tip = state.tip();
        let mut transactions = state.pending.clone();
        transactions.extend(reward);
        let block = Block {
            index: tip.index + 1,
            timestamp: now_millis(),
            transactions,
            proof,
            previous_hash: previous_hash.unwrap_or_else(|| tip.hash()),
        };
        self.store
            .commit_block(&block)
            .map_err(LedgerError::Persistence)?;
        state.pending.clear();
        state.chain.push(block.clone());
        info!(
            "sealed block {} with {} transaction(s)",
            block.index,
            block.transactions.len()
        );
        Ok(block)
    }

    /// Replaces the whole chain with `candidate` if it is valid and still
    /// longer than the local chain. The store is overwritten first.
    pub fn adopt_chain(&self, candidate: Vec<Block>) -> Result<bool> {
        if let Err(violation) = validate_chain(&candidate) {
            debug!("refusing candidate chain: {violation}");
            return Ok(false);
        }
        let mut state = self.write();
        if candidate.len() <= state.chain.len() {
            debug!(
                "candidate chain of {} block(s) no longer beats local length {}",
                candidate.len(),
                state.chain.len()
            );
            return Ok(false);
        }
        self.store
            .replace_chain(&candidate)
            .map_err(LedgerError::Persistence)?;
        info!(
            "replaced chain of {} block(s) with {} block(s)",
            state.chain.len(),
            candidate.len()
        );
        state.chain = candidate;
        Ok(true)
    }

    pub fn last_block(&self) -> Block {
        self.read().tip().clone()
    }

    pub fn chain(&self) -> Vec<Block> {
        self.read().chain.clone()
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.read().pending.clone()
    }

    /// Number of blocks, genesis included.
    pub fn height(&self) -> usize {
        self.read().chain.len()
    }

    pub fn hash(block: &Block) -> Hash {
        block.hash()
    }

    pub fn is_valid(&self) -> bool {
        is_valid(&self.read().chain)
    }

    // Every mutation completes its fallible steps before touching the state,
    // so a poisoned lock still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MINING_REWARD, MINING_SENDER};
    use crate::pow::search_proof;
    use crate::store::MemoryStore;
    use crate::validate::tests::build_chain;

    fn open() -> (Arc<MemoryStore>, Ledger<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::open(store.clone()).unwrap();
        (store, ledger)
    }

    fn mine_next(ledger: &Ledger<MemoryStore>) -> Block {
        let last = ledger.last_block();
        let proof = search_proof(last.proof, DIFFICULTY);
        ledger.seal_block(proof, None).unwrap()
    }

    #[test]
    fn fresh_ledger_has_genesis() {
        let (store, ledger) = open();
        let chain = ledger.chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 1);
        assert_eq!(chain[0].previous_hash, GENESIS_SENTINEL);
        assert_eq!(chain[0].proof, GENESIS_PROOF);
        assert_eq!(store.load_blocks().unwrap(), chain);
    }

    #[test]
    fn reopening_restores_chain_and_pool() {
        let (store, ledger) = open();
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 3.0, None, None)
            .unwrap();
        mine_next(&ledger);
        ledger
            .new_transaction("0xCCCCCC", "0xDDDDDD", 4.0, None, None)
            .unwrap();

        let reopened = Ledger::open(store).unwrap();
        assert_eq!(reopened.chain(), ledger.chain());
        assert_eq!(reopened.pending(), ledger.pending());
        assert_eq!(reopened.pending().len(), 1);
    }

    #[test]
    fn read_failures_fall_back_to_genesis() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let ledger = Ledger::open(store).unwrap();
        assert_eq!(ledger.height(), 1);
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn unreadable_blocks_are_replaced_by_genesis() {
        let store = Arc::new(MemoryStore::new());
        for block in build_chain(2) {
            store.commit_block(&block).unwrap();
        }
        store.set_fail_reads(true);
        let ledger = Ledger::open(store.clone()).unwrap();
        store.set_fail_reads(false);
        assert_eq!(store.load_blocks().unwrap(), ledger.chain());
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn genesis_write_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        assert!(matches!(
            Ledger::open(store),
            Err(LedgerError::Persistence(_))
        ));
    }

    #[test]
    fn new_transaction_returns_next_index() {
        let (_, ledger) = open();
        let (index, queued) = ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 10.0, None, Some(5))
            .unwrap();
        assert_eq!(index, 2);
        let pending = ledger.pending();
        assert_eq!(pending, vec![queued.clone()]);
        assert_eq!(pending[0].hash, queued.hash);
        assert_eq!(pending[0].timestamp, 5);
        assert_eq!(pending[0].hash, pending[0].compute_hash());
    }

    #[test]
    fn duplicates_are_kept() {
        let (_, ledger) = open();
        for _ in 0..2 {
            ledger
                .new_transaction("0xAAAAAA", "0xBBBBBB", 1.0, None, Some(5))
                .unwrap();
        }
        assert_eq!(ledger.pending().len(), 2);
    }

    #[test]
    fn invalid_transaction_leaves_pool_unchanged() {
        let (_, ledger) = open();
        let err = ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 0.0, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction(_)));
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn store_failure_on_submit_leaves_pool_unchanged() {
        let (store, ledger) = open();
        store.set_fail_writes(true);
        let err = ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 1.0, None, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn seal_grows_chain_and_drains_pool() {
        let (store, ledger) = open();
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 10.0, None, None)
            .unwrap();
        let before = ledger.last_block();
        let block = mine_next(&ledger);

        assert_eq!(ledger.height(), 2);
        assert_eq!(block.index, before.index + 1);
        assert_eq!(block.previous_hash, before.hash());
        assert_eq!(block.transactions.len(), 1);
        assert!(ledger.pending().is_empty());
        assert!(store.load_pending().unwrap().is_empty());
        assert!(store
            .transactions()
            .unwrap()
            .iter()
            .all(|s| s.block_index == Some(2)));
        assert_eq!(ledger.last_block(), block);
    }

    #[test]
    fn sealed_block_is_a_snapshot() {
        let (_, ledger) = open();
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 1.0, None, None)
            .unwrap();
        let block = mine_next(&ledger);
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 2.0, None, None)
            .unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(ledger.chain()[1].transactions.len(), 1);
    }

    #[test]
    fn explicit_previous_hash_is_used() {
        let (_, ledger) = open();
        let block = ledger.seal_block(12345, Some("previous_hash".into())).unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(block.proof, 12345);
        assert_eq!(block.previous_hash, "previous_hash");
        assert!(block.transactions.is_empty());
        assert!(!ledger.is_valid());
    }

    #[test]
    fn failed_seal_rolls_back() {
        let (store, ledger) = open();
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 1.0, None, None)
            .unwrap();
        let chain_before = ledger.chain();
        store.set_fail_writes(true);

        let err = ledger.seal_block(1, None).unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert_eq!(ledger.chain(), chain_before);
        assert_eq!(ledger.pending().len(), 1);
    }

    #[test]
    fn seal_on_checks_tip_and_proof() {
        let (_, ledger) = open();
        let parent = ledger.last_block();
        let proof = search_proof(parent.proof, DIFFICULTY);

        assert!(matches!(
            ledger.seal_on(&parent, proof + 1, None),
            Err(LedgerError::InvalidProof)
        ));
        let block = ledger.seal_on(&parent, proof, None).unwrap();
        assert_eq!(block.previous_hash, parent.hash());
        assert!(matches!(
            ledger.seal_on(&parent, proof, None),
            Err(LedgerError::StaleTip)
        ));
        assert!(ledger.is_valid());
    }

    #[test]
    fn seal_on_includes_reward() {
        let (store, ledger) = open();
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 10.0, None, None)
            .unwrap();
        let parent = ledger.last_block();
        let proof = search_proof(parent.proof, DIFFICULTY);
        let reward = Transaction::new(MINING_SENDER, "node-1", MINING_REWARD, None, 1).unwrap();

        let block = ledger.seal_on(&parent, proof, Some(reward.clone())).unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[1], reward);
        assert!(store.load_pending().unwrap().is_empty());
        let stored = store.transactions().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|s| s.block_index == Some(2)));
    }

    #[test]
    fn failed_commit_leaves_reward_out_of_the_pool() {
        let (store, ledger) = open();
        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 10.0, None, None)
            .unwrap();
        let parent = ledger.last_block();
        let proof = search_proof(parent.proof, DIFFICULTY);
        let reward = Transaction::new(MINING_SENDER, "node-1", MINING_REWARD, None, 1).unwrap();

        store.set_fail_commits(true);
        let err = ledger
            .seal_on(&parent, proof, Some(reward.clone()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.pending().len(), 1);
        assert_eq!(store.load_pending().unwrap().len(), 1);

        store.set_fail_commits(false);
        let block = ledger.seal_on(&parent, proof, Some(reward)).unwrap();
        let rewards = block
            .transactions
            .iter()
            .filter(|tx| tx.sender == MINING_SENDER)
            .count();
        assert_eq!(rewards, 1);
        assert_eq!(block.transactions.len(), 2);
        assert!(ledger.pending().is_empty());
        assert!(store.load_pending().unwrap().is_empty());
    }

    #[test]
    fn stale_seal_does_not_queue_reward() {
        let (_, ledger) = open();
        let parent = ledger.last_block();
        mine_next(&ledger);
        let reward = Transaction::new(MINING_SENDER, "node-1", MINING_REWARD, None, 1).unwrap();
        assert!(matches!(
            ledger.seal_on(&parent, 0, Some(reward)),
            Err(LedgerError::StaleTip)
        ));
        assert!(ledger.pending().is_empty());
    }

    #[test]
    fn adopts_longer_valid_chain() {
        let (store, ledger) = open();
        let candidate = build_chain(3);
        assert!(ledger.adopt_chain(candidate.clone()).unwrap());
        assert_eq!(ledger.chain(), candidate);
        assert_eq!(store.load_blocks().unwrap(), candidate);
    }

    #[test]
    fn refuses_shorter_or_invalid_chain() {
        let (_, ledger) = open();
        mine_next(&ledger);
        mine_next(&ledger);
        let local = ledger.chain();

        assert!(!ledger.adopt_chain(build_chain(2)).unwrap());
        let mut broken = build_chain(5);
        broken[3].previous_hash = "bogus".into();
        assert!(!ledger.adopt_chain(broken).unwrap());
        assert_eq!(ledger.chain(), local);
    }

    #[test]
    fn failed_adoption_keeps_local_chain() {
        let (store, ledger) = open();
        let local = ledger.chain();
        store.set_fail_writes(true);
        assert!(matches!(
            ledger.adopt_chain(build_chain(3)),
            Err(LedgerError::Persistence(_))
        ));
        assert_eq!(ledger.chain(), local);
    }

    #[test]
    fn scenario_first_block_after_genesis() {
        let (_, ledger) = open();
        let genesis = ledger.last_block();
        assert_eq!(genesis.proof, 100);

        ledger
            .new_transaction("0xAAAAAA", "0xBBBBBB", 10.0, None, None)
            .unwrap();
        let proof = search_proof(100, DIFFICULTY);
        let block = ledger.seal_block(proof, None).unwrap();

        assert_eq!(block.index, 2);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.previous_hash, Ledger::<MemoryStore>::hash(&genesis));
        assert!(ledger.is_valid());
    }

    #[test]
    fn concurrent_seals_never_duplicate_transactions() {
        let (_, ledger) = open();
        let ledger = Arc::new(ledger);
        for i in 0..8 {
            ledger
                .new_transaction("0xAAAAAA", "0xBBBBBB", (i + 1) as f64, None, None)
                .unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.seal_block(0, None).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let sealed: usize = ledger.chain().iter().map(|b| b.transactions.len()).sum();
        assert_eq!(sealed, 8);
        assert_eq!(ledger.height(), 5);
    }
}
