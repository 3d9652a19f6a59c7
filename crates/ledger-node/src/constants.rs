pub(crate) const CHAIN_PATH: &str = "/chain";
pub(crate) const DEFAULT_PEER_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_RESOLVE_INTERVAL_SECS: u64 = 30;
