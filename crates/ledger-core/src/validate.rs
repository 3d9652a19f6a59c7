//! End-to-end validation of a chain, local or received from a peer.
//!
//! Only field values are consulted; a candidate chain is treated as
//! untrusted input and every hash is recomputed.

use crate::constants::{DIFFICULTY, GENESIS_SENTINEL};
use crate::pow::valid_proof;
use crate::Block;
use thiserror::Error;

/// The first rule a chain breaks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainViolation {
    #[error("chain is empty")]
    Empty,

    #[error("genesis block has index {index} and previous hash {previous_hash:?}")]
    Genesis { index: u64, previous_hash: String },

    #[error("block at position {position} has index {index}, expected {expected}")]
    IndexGap {
        position: usize,
        index: u64,
        expected: u64,
    },

    #[error("block {index} does not link to the hash of block {parent}")]
    HashLink { index: u64, parent: u64 },

    #[error("block {index} proof {proof} is not valid against parent proof {parent_proof}")]
    ProofLink {
        index: u64,
        proof: u64,
        parent_proof: u64,
    },
}

pub fn validate_chain(chain: &[Block]) -> Result<(), ChainViolation> {
    let genesis = chain.first().ok_or(ChainViolation::Empty)?;
    if genesis.index != 1 || genesis.previous_hash != GENESIS_SENTINEL {
        return Err(ChainViolation::Genesis {
            index: genesis.index,
            previous_hash: genesis.previous_hash.clone(),
        });
    }

    for (position, pair) in chain.windows(2).enumerate() {
        let (parent, block) = (&pair[0], &pair[1]);
        let expected = parent.index + 1;
        if block.index != expected {
            return Err(ChainViolation::IndexGap {
                position: position + 1,
                index: block.index,
                expected,
            });
        }
        if block.previous_hash != parent.hash() {
            return Err(ChainViolation::HashLink {
                index: block.index,
                parent: parent.index,
            });
        }
        if !valid_proof(parent.proof, block.proof, DIFFICULTY) {
            return Err(ChainViolation::ProofLink {
                index: block.index,
                proof: block.proof,
                parent_proof: parent.proof,
            });
        }
    }
    Ok(())
}

/// Fails closed: an empty chain is invalid.
pub fn is_valid(chain: &[Block]) -> bool {
    validate_chain(chain).is_ok()
}
