//! Persistent backends for the ledger's storage contract.
//!
//! The contract itself, [`LedgerStore`], lives in `ledger-core` so the ledger
//! can persist without depending on this crate.

pub mod sled_store;

pub use ledger_core::store::{LedgerStore, StoredTransaction};
pub use sled_store::SledStore;
