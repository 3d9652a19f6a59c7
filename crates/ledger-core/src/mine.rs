use crate::pow::valid_proof;
use rayon::prelude::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::{debug, info};

/// Shared flag used to abort an in-flight proof search.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Searches proofs in parallel until one satisfies `difficulty` against
/// `last_proof`, returning the smallest such proof. Returns `None` when the
/// token is cancelled before a proof is found.
pub fn search_proof_cancellable(
    last_proof: u64,
    difficulty: usize,
    cancel: &CancelToken,
) -> Option<u64> {
    // Rayon splits the range across threads; `find_first` keeps the lowest hit.
    // Once cancelled every remaining candidate matches, which ends the search.
    let found = (0u64..u64::MAX)
        .into_par_iter()
        .find_first(|proof| cancel.is_cancelled() || valid_proof(last_proof, *proof, difficulty))
        .filter(|proof| valid_proof(last_proof, *proof, difficulty));

    match found {
        Some(proof) => {
            info!("Found proof {} against parent proof {}", proof, last_proof);
            Some(proof)
        }
        None => {
            debug!("Proof search against parent proof {} cancelled", last_proof);
            None
        }
    }
}

/// Allows at most one proof search at a time and lets other flows abort it.
#[derive(Debug, Default)]
pub struct MiningSlot {
    current: Mutex<Option<CancelToken>>,
}

impl MiningSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot, or returns `None` while another search is running.
    pub fn try_begin(&self) -> Option<MiningGuard<'_>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return None;
        }
        let token = CancelToken::new();
        *current = Some(token.clone());
        Some(MiningGuard { slot: self, token })
    }

    /// Cancels the running search, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Holds the mining slot; releases it on drop.
#[derive(Debug)]
pub struct MiningGuard<'a> {
    slot: &'a MiningSlot,
    token: CancelToken,
}

impl MiningGuard<'_> {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for MiningGuard<'_> {
    fn drop(&mut self) {
        let mut current = self
            .slot
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *current = None;
    }
}
