//! Registry of known peer nodes, keyed by normalized `host:port`.

use crate::store::LedgerStore;
use crate::{LedgerError, Result};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};
use url::Url;

/// Normalizes `http://host:port/path`, `https://host`, or bare `host:port` to
/// `host:port`. A missing port takes the scheme's default.
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidAddress("empty address".into()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|err| LedgerError::InvalidAddress(format!("{address}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LedgerError::InvalidAddress(format!(
            "{address}: unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| LedgerError::InvalidAddress(format!("{address}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| LedgerError::InvalidAddress(format!("{address}: missing port")))?;
    Ok(format!("{host}:{port}"))
}

/// Deduplicated peer set. The registry does not detect this node's own
/// address; callers filter it out before registering.
pub struct PeerRegistry<S: LedgerStore> {
    store: Arc<S>,
    peers: RwLock<BTreeSet<String>>,
}

impl<S: LedgerStore> PeerRegistry<S> {
    /// Loads persisted peers. A read failure starts with an empty registry.
    pub fn open(store: Arc<S>) -> Self {
        let stored = store.load_peers().unwrap_or_else(|err| {
            warn!("could not load peers, starting with none: {err:#}");
            Vec::new()
        });
        let peers = stored
            .iter()
            .filter_map(|address| match normalize_address(address) {
                Ok(normalized) => Some(normalized),
                Err(err) => {
                    warn!("dropping stored peer: {err}");
                    None
                }
            })
            .collect();
        Self {
            store,
            peers: RwLock::new(peers),
        }
    }

    /// Registers a peer and returns its normalized form. Re-registering a
    /// known peer is a no-op.
    pub fn register(&self, address: &str) -> Result<String> {
        let normalized = normalize_address(address)?;
        let mut peers = self.write();
        if peers.contains(&normalized) {
            return Ok(normalized);
        }
        self.store
            .upsert_peer(&normalized)
            .map_err(LedgerError::Persistence)?;
        peers.insert(normalized.clone());
        info!("registered peer {normalized}");
        Ok(normalized)
    }

    /// Removes a peer. Returns whether it was known.
    pub fn unregister(&self, address: &str) -> Result<bool> {
        let normalized = normalize_address(address)?;
        let mut peers = self.write();
        if !peers.contains(&normalized) {
            return Ok(false);
        }
        self.store
            .remove_peer(&normalized)
            .map_err(LedgerError::Persistence)?;
        peers.remove(&normalized);
        info!("unregistered peer {normalized}");
        Ok(true)
    }

    pub fn list(&self) -> BTreeSet<String> {
        self.read().clone()
    }

    pub fn contains(&self, address: &str) -> bool {
        normalize_address(address)
            .map(|normalized| self.read().contains(&normalized))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeSet<String>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeSet<String>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
