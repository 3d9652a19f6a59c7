//! Proof-of-work predicate linking each block's proof to its parent's.

use sha2::{Digest, Sha256};

/// `SHA-256("{last_proof}{proof}")` must start with `difficulty` zero hex digits.
pub fn valid_proof(last_proof: u64, proof: u64, difficulty: usize) -> bool {
    let guess = format!("{last_proof}{proof}");
    let digest: [u8; 32] = Sha256::digest(guess.as_bytes()).into();
    count_leading_zero_nibbles(&digest) >= difficulty
}

/// Brute-force search from 0 upward; returns the first proof accepted by
/// [`valid_proof`].
pub fn search_proof(last_proof: u64, difficulty: usize) -> u64 {
    let mut proof = 0u64;
    while !valid_proof(last_proof, proof, difficulty) {
        proof = proof.wrapping_add(1);
    }
    proof
}

/// Number of leading zero hex characters in the digest's hex rendering.
pub fn count_leading_zero_nibbles(hash: &[u8]) -> usize {
    let mut total = 0usize;
    for b in hash {
        if *b == 0 {
            total += 2;
        } else {
            if *b >> 4 == 0 {
                total += 1;
            }
            break;
        }
    }
    total
}
