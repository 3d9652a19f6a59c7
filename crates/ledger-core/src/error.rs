//! Error types for the ledger engine.

use thiserror::Error;

/// Errors surfaced by the ledger, the peer registry and the mining flow.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Non-positive or non-finite amount, or a malformed address.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// A peer address without a usable host component.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// The store rejected a write; in-memory state is unchanged.
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),

    /// The block a proof was searched against is no longer the tip.
    #[error("chain tip moved while mining")]
    StaleTip,

    #[error("proof does not satisfy the difficulty against its parent")]
    InvalidProof,
}

pub type Result<T> = std::result::Result<T, LedgerError>;
