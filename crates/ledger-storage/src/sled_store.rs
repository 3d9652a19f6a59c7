use anyhow::{anyhow, Context, Result};
use ledger_core::store::{hash_multiset, unmatched_transactions, LedgerStore, StoredTransaction};
use ledger_core::{Block, Transaction};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

const TREE_BLOCKS: &str = "blocks";
const TREE_TRANSACTIONS: &str = "transactions";
const TREE_PEERS: &str = "peers";

/// sled-backed store. Blocks are keyed by big-endian index so iteration is in
/// chain order; transactions by a sled-generated id, which keeps submission
/// order; peers by their normalized address.
#[derive(Clone)]
pub struct SledStore {
  db: Db,
  blocks: Tree,
  transactions: Tree,
  peers: Tree,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let db = sled::open(path.as_ref())
      .with_context(|| format!("opening sled store at {}", path.as_ref().display()))?;
    let blocks = db.open_tree(TREE_BLOCKS)?;
    let transactions = db.open_tree(TREE_TRANSACTIONS)?;
    let peers = db.open_tree(TREE_PEERS)?;
    info!("sled store opened");
    Ok(Self {
      db,
      blocks,
      transactions,
      peers,
    })
  }

  /// Every stored transaction with its sealing block, in submission order.
  pub fn transactions(&self) -> Result<Vec<StoredTransaction>> {
    self
      .transactions
      .iter()
      .values()
      .map(|bytes| decode_stored(&bytes?))
      .collect()
  }

  pub fn close(&self) -> Result<()> {
    self.db.flush()?;
    Ok(())
  }

  fn pending_entries(&self) -> Result<Vec<(IVec, StoredTransaction)>> {
    let mut out = Vec::new();
    for entry in self.transactions.iter() {
      let (key, bytes) = entry?;
      let stored = decode_stored(&bytes)?;
      if stored.block_index.is_none() {
        out.push((key, stored));
      }
    }
    Ok(out)
  }
}

impl LedgerStore for SledStore {
  fn load_blocks(&self) -> Result<Vec<Block>> {
    self
      .blocks
      .iter()
      .values()
      .map(|bytes| decode_block(&bytes?))
      .collect()
  }

  fn load_pending(&self) -> Result<Vec<Transaction>> {
    Ok(
      self
        .pending_entries()?
        .into_iter()
        .map(|(_, stored)| stored.tx)
        .collect(),
    )
  }

  fn append_pending(&self, tx: &Transaction) -> Result<()> {
    let id = self.db.generate_id()?;
    let stored = StoredTransaction {
      tx: tx.clone(),
      block_index: None,
    };
    self
      .transactions
      .insert(id.to_be_bytes(), bincode::serialize(&stored)?)?;
    self.db.flush()?;
    Ok(())
  }

  fn commit_block(&self, block: &Block) -> Result<()> {
    let key = block.index.to_be_bytes().to_vec();
    let block_bytes = bincode::serialize(block)?;

    // Tag exactly the pending entries the block carries, duplicates included.
    let mut wanted = hash_multiset(block);
    let mut tagged: Vec<(IVec, Vec<u8>)> = Vec::new();
    for (tx_key, mut stored) in self.pending_entries()? {
      if let Some(count) = wanted.get_mut(stored.tx.hash.as_str()) {
        if *count > 0 {
          *count -= 1;
          stored.block_index = Some(block.index);
          tagged.push((tx_key, bincode::serialize(&stored)?));
        }
      }
    }
    let retagged = tagged.len();
    // Transactions the pool never held, such as the mining reward.
    for tx in unmatched_transactions(block, wanted) {
      let stored = StoredTransaction {
        tx: tx.clone(),
        block_index: Some(block.index),
      };
      let id = self.db.generate_id()?;
      tagged.push((IVec::from(&id.to_be_bytes()[..]), bincode::serialize(&stored)?));
    }

    let result: Result<(), TransactionError<String>> =
      (&self.blocks, &self.transactions).transaction(|(blocks, transactions)| {
        if blocks.get(&key)?.is_some() {
          return Err(ConflictableTransactionError::Abort(format!(
            "block {} already stored",
            block.index
          )));
        }
        blocks.insert(key.clone(), block_bytes.clone())?;
        for (tx_key, bytes) in &tagged {
          transactions.insert(tx_key.clone(), bytes.clone())?;
        }
        Ok(())
      });
    result.map_err(transaction_error)?;
    self.db.flush()?;
    debug!(
      "stored block {}, tagged {} pending and added {} sealed transaction(s)",
      block.index,
      retagged,
      tagged.len() - retagged
    );
    Ok(())
  }

  fn replace_chain(&self, chain: &[Block]) -> Result<()> {
    let stale: Vec<IVec> = self.blocks.iter().keys().collect::<sled::Result<_>>()?;
    let fresh: Vec<(Vec<u8>, Vec<u8>)> = chain
      .iter()
      .map(|block| -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((block.index.to_be_bytes().to_vec(), bincode::serialize(block)?))
      })
      .collect::<Result<_>>()?;

    let result: Result<(), TransactionError<String>> = self.blocks.transaction(|blocks| {
      for key in &stale {
        blocks.remove(key.clone())?;
      }
      for (key, bytes) in &fresh {
        blocks.insert(key.clone(), bytes.clone())?;
      }
      Ok(())
    });
    result.map_err(transaction_error)?;
    self.db.flush()?;
    info!(
      "replaced {} stored block(s) with {} block(s)",
      stale.len(),
      fresh.len()
    );
    Ok(())
  }

  fn load_peers(&self) -> Result<Vec<String>> {
    self
      .peers
      .iter()
      .keys()
      .map(|key| -> Result<String> { Ok(String::from_utf8(key?.to_vec())?) })
      .collect()
  }

  fn upsert_peer(&self, address: &str) -> Result<()> {
    self.peers.insert(address.as_bytes(), Vec::<u8>::new())?;
    self.db.flush()?;
    Ok(())
  }

  fn remove_peer(&self, address: &str) -> Result<()> {
    self.peers.remove(address.as_bytes())?;
    self.db.flush()?;
    Ok(())
  }
}

fn decode_block(bytes: &[u8]) -> Result<Block> {
  bincode::deserialize(bytes).context("decoding stored block")
}

fn decode_stored(bytes: &[u8]) -> Result<StoredTransaction> {
  bincode::deserialize(bytes).context("decoding stored transaction")
}

fn transaction_error(err: TransactionError<String>) -> anyhow::Error {
  match err {
    TransactionError::Abort(reason) => anyhow!(reason),
    TransactionError::Storage(err) => err.into(),
  }
}
