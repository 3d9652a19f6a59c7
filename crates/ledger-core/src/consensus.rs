//! Longest-valid-chain consensus over the registered peers.
//!
//! Peers are queried concurrently, each under its own timeout. Selection only
//! starts once every response is in. Among valid chains longer than the local
//! one the longest wins; equal lengths are broken by the lexicographically
//! smallest tip hash so every node picks the same chain from the same
//! responses. Length is compared, not accumulated work.

use crate::store::LedgerStore;
use crate::validate::validate_chain;
use crate::{Block, Ledger, LedgerError, PeerRegistry, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// What a peer reports from `GET /chain`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerChain {
    pub chain: Vec<Block>,
    pub length: usize,
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("peer {peer} timed out after {timeout:?}")]
    Timeout { peer: String, timeout: Duration },

    #[error("peer {peer} sent a malformed response: {reason}")]
    Malformed { peer: String, reason: String },
}

/// Fetches a peer's current chain.
pub trait ChainSource: Send + Sync {
    fn fetch_chain(&self, peer: &str) -> impl Future<Output = std::result::Result<PeerChain, PeerError>> + Send;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub chain: Vec<Block>,
    pub replaced: bool,
}

pub struct Resolver<C> {
    source: C,
    timeout: Duration,
}

impl<C: ChainSource> Resolver<C> {
    pub fn new(source: C, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Picks the chain to run on. Unreachable, slow, malformed, shorter and
    /// invalid peers are skipped; none of them is an error.
    pub async fn resolve(&self, local_chain: &[Block], peers: &[String]) -> Resolution {
        if peers.is_empty() {
            debug!("no peers registered, keeping local chain");
            return Resolution {
                chain: local_chain.to_vec(),
                replaced: false,
            };
        }

        info!("resolving conflicts with {} peer(s)", peers.len());
        let responses = join_all(peers.iter().map(|peer| self.fetch(peer))).await;

        let local_len = local_chain.len();
        let mut best: Option<(Vec<Block>, String)> = None;
        for (peer, response) in peers.iter().zip(responses) {
            let reported = match response {
                Ok(reported) => reported,
                Err(err) => {
                    warn!("skipping peer: {err}");
                    continue;
                }
            };
            if reported.length != reported.chain.len() {
                warn!(
                    "skipping peer {peer}: reported length {} but sent {} block(s)",
                    reported.length,
                    reported.chain.len()
                );
                continue;
            }
            if reported.length <= local_len {
                debug!("peer {peer} chain length {} not longer than {local_len}", reported.length);
                continue;
            }
            if let Err(violation) = validate_chain(&reported.chain) {
                debug!("excluding invalid chain from peer {peer}: {violation}");
                continue;
            }
            let tip_hash = reported
                .chain
                .last()
                .map(Block::hash)
                .unwrap_or_default();
            let better = match &best {
                None => true,
                Some((current, current_tip)) => {
                    reported.chain.len() > current.len()
                        || (reported.chain.len() == current.len() && tip_hash < *current_tip)
                }
            };
            if better {
                debug!("peer {peer} offers a valid chain of {} block(s)", reported.length);
                best = Some((reported.chain, tip_hash));
            }
        }

        match best {
            Some((chain, _)) => Resolution {
                chain,
                replaced: true,
            },
            None => {
                info!("no longer valid chain found");
                Resolution {
                    chain: local_chain.to_vec(),
                    replaced: false,
                }
            }
        }
    }

    /// Resolves against the registry's peers and, when a longer valid chain
    /// wins, installs it in the ledger and its store. The store write runs on
    /// the blocking pool.
    pub async fn resolve_ledger<S: LedgerStore + 'static>(
        &self,
        ledger: &Arc<Ledger<S>>,
        registry: &PeerRegistry<S>,
    ) -> Result<Resolution> {
        let local = ledger.chain();
        let peers: Vec<String> = registry.list().into_iter().collect();
        let resolution = self.resolve(&local, &peers).await;
        if !resolution.replaced {
            return Ok(resolution);
        }
        let adopting = Arc::clone(ledger);
        let adopted = tokio::task::spawn_blocking(move || adopting.adopt_chain(resolution.chain))
            .await
            .map_err(|err| LedgerError::Persistence(anyhow::Error::new(err)))??;
        if adopted {
            Ok(Resolution {
                chain: ledger.chain(),
                replaced: true,
            })
        } else {
            // the local chain grew while peers were being queried
            Ok(Resolution {
                chain: ledger.chain(),
                replaced: false,
            })
        }
    }

    async fn fetch(&self, peer: &str) -> std::result::Result<PeerChain, PeerError> {
        match tokio::time::timeout(self.timeout, self.source.fetch_chain(peer)).await {
            Ok(response) => response,
            Err(_) => Err(PeerError::Timeout {
                peer: peer.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}
