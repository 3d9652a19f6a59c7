//! HTTP implementation of the consensus resolver's chain source.

use crate::constants::CHAIN_PATH;
use ledger_core::consensus::{ChainSource, PeerChain, PeerError};
use reqwest::Client;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct HttpChainSource {
    http: Client,
    timeout: Duration,
}

impl HttpChainSource {
    pub(crate) fn new(timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, timeout })
    }
}

pub(crate) fn chain_url(peer: &str) -> String {
    format!("http://{peer}{CHAIN_PATH}")
}

impl ChainSource for HttpChainSource {
    async fn fetch_chain(&self, peer: &str) -> Result<PeerChain, PeerError> {
        let response = self
            .http
            .get(chain_url(peer))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| {
                if err.is_timeout() {
                    PeerError::Timeout {
                        peer: peer.to_string(),
                        timeout: self.timeout,
                    }
                } else {
                    PeerError::Unreachable {
                        peer: peer.to_string(),
                        reason: err.to_string(),
                    }
                }
            })?;
        response
            .json::<PeerChain>()
            .await
            .map_err(|err| PeerError::Malformed {
                peer: peer.to_string(),
                reason: err.to_string(),
            })
    }
}
