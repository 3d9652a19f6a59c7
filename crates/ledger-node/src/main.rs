mod constants;
mod peer_client;
mod routes;

use clap::Parser;
use constants::{DEFAULT_PEER_TIMEOUT_MS, DEFAULT_RESOLVE_INTERVAL_SECS};
use ledger_core::{
    consensus::Resolver, mine::MiningSlot, new_node_id, peers::normalize_address, Ledger,
    PeerRegistry,
};
use ledger_storage::SledStore;
use peer_client::HttpChainSource;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ledger-node", version, about = "Proof-of-work ledger node")]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:5000
    #[arg(long, env = "LEDGER_LISTEN", default_value = "127.0.0.1:5000")]
    listen: String,

    /// Address peers reach this node at; defaults to the listen address
    #[arg(long, env = "LEDGER_ADVERTISE")]
    advertise: Option<String>,

    /// Data directory for sled
    #[arg(long, env = "LEDGER_DATA_DIR", default_value = "./data")]
    data_dir: String,

    /// Recipient of mining rewards; random when unset
    #[arg(long, env = "LEDGER_NODE_ID")]
    node_id: Option<String>,

    /// Peers to register at startup, comma separated
    #[arg(long, env = "LEDGER_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Per-peer timeout for chain fetches
    #[arg(long, env = "LEDGER_PEER_TIMEOUT_MS", default_value_t = DEFAULT_PEER_TIMEOUT_MS)]
    peer_timeout_ms: u64,

    /// Seconds between background consensus rounds, 0 disables them
    #[arg(long, env = "LEDGER_RESOLVE_INTERVAL_SECS", default_value_t = DEFAULT_RESOLVE_INTERVAL_SECS)]
    resolve_interval_secs: u64,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ledger: Arc<Ledger<SledStore>>,
    pub(crate) peers: Arc<PeerRegistry<SledStore>>,
    pub(crate) resolver: Arc<Resolver<HttpChainSource>>,
    pub(crate) mining: Arc<MiningSlot>,
    pub(crate) node_id: Arc<str>,
    /// Normalized `host:port` of this node, filtered out of peer registration.
    pub(crate) advertise: Option<Arc<str>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = Arc::new(SledStore::open(&args.data_dir)?);
    let ledger = Ledger::open(store.clone())?;
    let peers = PeerRegistry::open(store.clone());

    let timeout = Duration::from_millis(args.peer_timeout_ms);
    let resolver = Resolver::new(HttpChainSource::new(timeout)?, timeout);
    let advertise = normalize_address(args.advertise.as_deref().unwrap_or(&args.listen))?;
    let node_id = args.node_id.unwrap_or_else(new_node_id);

    let state = AppState {
        ledger: Arc::new(ledger),
        peers: Arc::new(peers),
        resolver: Arc::new(resolver),
        mining: Arc::new(MiningSlot::new()),
        node_id: node_id.into(),
        advertise: Some(advertise.into()),
    };

    for peer in &args.peers {
        if let Err(err) = routes::register_peer(&state, peer) {
            warn!("ignoring startup peer {peer:?}: {err}");
        }
    }

    if args.resolve_interval_secs > 0 {
        spawn_resolver(state.clone(), Duration::from_secs(args.resolve_interval_secs));
    }

    let app = routes::router(state.clone());
    let addr: SocketAddr = args.listen.parse()?;
    info!(
        "ledger-node {} listening on http://{addr} (chain length {}, {} peers)",
        state.node_id,
        state.ledger.height(),
        state.peers.len()
    );
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.mining.cancel();
    store.close()?;
    info!("ledger-node stopped");
    Ok(())
}

/// Runs a consensus round every `every`, skipping rounds while no peers are
/// registered.
fn spawn_resolver(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if state.peers.is_empty() {
                continue;
            }
            match routes::run_consensus(&state).await {
                Ok(resolution) if resolution.replaced => {
                    info!("adopted peer chain of length {}", resolution.chain.len())
                }
                Ok(_) => {}
                Err(err) => warn!("background consensus failed: {err}"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
