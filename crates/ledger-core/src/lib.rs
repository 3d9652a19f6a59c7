pub mod codec;
pub mod consensus;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod mine;
pub mod peers;
pub mod pow;
pub mod store;
pub mod validate;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use peers::PeerRegistry;

use codec::Canonical;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lowercase hex SHA-256 digest.
pub type Hash = String;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Random 16-byte hex identifier for a node; used as the mining reward recipient.
pub fn new_node_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    #[serde(default)]
    pub signature: Option<String>,
    pub timestamp: u64,
    /// Canonical digest of the other fields; recomputed, never trusted from the wire.
    #[serde(default)]
    pub hash: Hash,
}

impl Transaction {
    /// Validates the fields and attaches the canonical hash.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: f64,
        signature: Option<String>,
        timestamp: u64,
    ) -> Result<Self> {
        let sender = sender.into();
        let recipient = recipient.into();
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::InvalidTransaction(format!(
                "amount must be positive, got {amount}"
            )));
        }
        for (role, address) in [("sender", &sender), ("recipient", &recipient)] {
            if address.trim().is_empty() || address.chars().any(char::is_whitespace) {
                return Err(LedgerError::InvalidTransaction(format!(
                    "{role} address {address:?} is malformed"
                )));
            }
        }
        let mut tx = Self {
            sender,
            recipient,
            amount,
            signature,
            timestamp,
            hash: Hash::new(),
        };
        tx.hash = tx.compute_hash();
        Ok(tx)
    }

    pub fn compute_hash(&self) -> Hash {
        codec::hash(self)
    }

    /// Client-facing address format: `0x` followed by at least six hex digits.
    pub fn is_well_formed_address(address: &str) -> bool {
        address
            .strip_prefix("0x")
            .is_some_and(|digits| digits.len() >= 6 && digits.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

impl Canonical for Transaction {
    fn canonical(&self) -> Value {
        json!({
            "sender": self.sender,
            "recipient": self.recipient,
            "amount": self.amount,
            "signature": self.signature.as_deref().unwrap_or(""),
            "timestamp": self.timestamp,
        })
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.amount == other.amount
            && self.sender == other.sender
            && self.recipient == other.recipient
            && self.signature == other.signature
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
    pub proof: u64,
    pub previous_hash: Hash,
}

impl Block {
    /// Recomputed from the canonical form on every call, so it is never stale.
    pub fn hash(&self) -> Hash {
        codec::hash(self)
    }
}

impl Canonical for Block {
    fn canonical(&self) -> Value {
        let transactions: Vec<Value> = self.transactions.iter().map(Canonical::canonical).collect();
        json!({
            "index": self.index,
            "timestamp": self.timestamp,
            "transactions": transactions,
            "proof": self.proof,
            "previous_hash": self.previous_hash,
        })
    }
}
