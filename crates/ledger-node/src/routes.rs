//! HTTP routes for submitting transactions, mining, and peer consensus.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use ledger_core::{
    consensus::Resolution,
    constants::{DIFFICULTY, MINING_REWARD, MINING_SENDER},
    mine::search_proof_cancellable,
    now_millis,
    peers::normalize_address,
    Block, Hash, LedgerError, Transaction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::AppState;

type ApiError = (StatusCode, String);

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(node_info))
        .route("/health", get(health))
        .route("/chain", get(full_chain))
        .route("/transactions/pending", get(pending_transactions))
        .route("/transactions", post(new_transaction))
        .route("/mine", get(mine))
        .route("/nodes", get(list_nodes))
        .route("/nodes/register", post(register_nodes))
        .route("/nodes/{address}", delete(unregister_node))
        .route("/nodes/resolve", get(resolve_conflicts))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn ledger_error(err: LedgerError) -> ApiError {
    let status = match &err {
        LedgerError::InvalidTransaction(_) | LedgerError::InvalidAddress(_) => {
            StatusCode::BAD_REQUEST
        }
        LedgerError::StaleTip | LedgerError::InvalidProof => StatusCode::CONFLICT,
        LedgerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("request failed: {err}");
    }
    (status, err.to_string())
}

/// Runs a store-writing ledger call on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> ledger_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(ledger_error)
}

/// A block as served to clients and peers, with its hash attached.
#[derive(Debug, Serialize)]
pub(crate) struct BlockView {
    #[serde(flatten)]
    block: Block,
    hash: Hash,
}

impl From<Block> for BlockView {
    fn from(block: Block) -> Self {
        let hash = block.hash();
        Self { block, hash }
    }
}

#[derive(Serialize)]
pub(crate) struct ChainResponse {
    chain: Vec<BlockView>,
    length: usize,
    total_transactions: usize,
}

impl From<Vec<Block>> for ChainResponse {
    fn from(chain: Vec<Block>) -> Self {
        let total_transactions = chain.iter().map(|b| b.transactions.len()).sum();
        Self {
            length: chain.len(),
            total_transactions,
            chain: chain.into_iter().map(BlockView::from).collect(),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct NodeInfo {
    node_id: String,
    address: Option<String>,
    difficulty: usize,
    length: usize,
    peers: usize,
    routes: &'static [&'static str],
}

/// GET /
async fn node_info(State(state): State<AppState>) -> Json<NodeInfo> {
    Json(NodeInfo {
        node_id: state.node_id.to_string(),
        address: state.advertise.as_deref().map(str::to_string),
        difficulty: DIFFICULTY,
        length: state.ledger.height(),
        peers: state.peers.len(),
        routes: &[
            "GET /chain",
            "GET /transactions/pending",
            "POST /transactions",
            "GET /mine",
            "GET /nodes",
            "POST /nodes/register",
            "DELETE /nodes/{address}",
            "GET /nodes/resolve",
        ],
    })
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// GET /chain
async fn full_chain(State(state): State<AppState>) -> Json<ChainResponse> {
    Json(state.ledger.chain().into())
}

/// GET /transactions/pending
async fn pending_transactions(State(state): State<AppState>) -> Json<Vec<Transaction>> {
    Json(state.ledger.pending())
}

#[derive(Deserialize)]
pub(crate) struct TransactionInput {
    sender: String,
    recipient: String,
    amount: f64,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TransactionAccepted {
    message: String,
    block_index: u64,
    transaction: Transaction,
}

/// POST /transactions
async fn new_transaction(
    State(state): State<AppState>,
    Json(input): Json<TransactionInput>,
) -> Result<(StatusCode, Json<TransactionAccepted>), ApiError> {
    for address in [&input.sender, &input.recipient] {
        if !Transaction::is_well_formed_address(address) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("invalid address {address:?}: expected 0x followed by at least 6 hex digits"),
            ));
        }
    }
    let ledger = Arc::clone(&state.ledger);
    let (block_index, transaction) = blocking(move || {
        ledger.new_transaction(
            input.sender,
            input.recipient,
            input.amount,
            input.signature,
            input.timestamp,
        )
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(TransactionAccepted {
            message: format!("Transaction will be added to Block {block_index}"),
            block_index,
            transaction,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub(crate) struct Mined {
    message: &'static str,
    block: BlockView,
    miner: String,
    reward: f64,
}

/// GET /mine
///
/// The proof search runs on the blocking pool without holding the ledger
/// lock; the block is sealed only if the searched parent is still the tip.
async fn mine(State(state): State<AppState>) -> Result<Json<Mined>, ApiError> {
    let Some(guard) = state.mining.try_begin() else {
        return Err((StatusCode::CONFLICT, "mining already in progress".into()));
    };
    let parent = state.ledger.last_block();
    let token = guard.token().clone();
    let last_proof = parent.proof;
    let found = tokio::task::spawn_blocking(move || {
        search_proof_cancellable(last_proof, DIFFICULTY, &token)
    })
    .await
    .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let Some(proof) = found else {
        return Err((
            StatusCode::CONFLICT,
            "mining cancelled: chain was replaced".into(),
        ));
    };

    let reward = Transaction::new(
        MINING_SENDER,
        &*state.node_id,
        MINING_REWARD,
        None,
        now_millis(),
    )
    .map_err(ledger_error)?;
    let ledger = Arc::clone(&state.ledger);
    let block = blocking(move || ledger.seal_on(&parent, proof, Some(reward))).await?;
    drop(guard);
    info!("mined block {} with proof {proof}", block.index);

    Ok(Json(Mined {
        message: "New block forged",
        block: block.into(),
        miner: state.node_id.to_string(),
        reward: MINING_REWARD,
    }))
}

#[derive(Deserialize)]
pub(crate) struct NodeRegistration {
    nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NodeList {
    message: String,
    nodes: Vec<String>,
    total_nodes: usize,
}

/// GET /nodes
async fn list_nodes(State(state): State<AppState>) -> Json<NodeList> {
    let nodes: Vec<String> = state.peers.list().into_iter().collect();
    Json(NodeList {
        message: "Registered nodes".into(),
        total_nodes: nodes.len(),
        nodes,
    })
}

/// POST /nodes/register
async fn register_nodes(
    State(state): State<AppState>,
    Json(input): Json<NodeRegistration>,
) -> Result<(StatusCode, Json<NodeList>), ApiError> {
    let registering = state.clone();
    let registered = blocking(move || {
        let mut registered = Vec::new();
        for node in &input.nodes {
            match register_peer(&registering, node) {
                Ok(Some(address)) => registered.push(address),
                Ok(None) => {}
                Err(err @ LedgerError::Persistence(_)) => return Err(err),
                Err(err) => warn!("skipping node {node:?}: {err}"),
            }
        }
        Ok(registered)
    })
    .await?;
    if registered.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "no valid nodes were registered".into(),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(NodeList {
            message: format!("Registered {} node(s)", registered.len()),
            nodes: registered,
            total_nodes: state.peers.len(),
        }),
    ))
}

/// Registers `address` unless it names this node. Returns the normalized
/// form of a registered peer.
pub(crate) fn register_peer(
    state: &AppState,
    address: &str,
) -> ledger_core::Result<Option<String>> {
    let normalized = normalize_address(address)?;
    if state.advertise.as_deref() == Some(normalized.as_str()) {
        info!("ignoring own address {normalized}");
        return Ok(None);
    }
    state.peers.register(&normalized).map(Some)
}

#[derive(Debug, Serialize)]
pub(crate) struct Removed {
    removed: String,
}

/// DELETE /nodes/{address}
async fn unregister_node(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Removed>, ApiError> {
    let normalized = normalize_address(&address).map_err(ledger_error)?;
    let peers = Arc::clone(&state.peers);
    let removing = normalized.clone();
    if blocking(move || peers.unregister(&removing)).await? {
        Ok(Json(Removed {
            removed: normalized,
        }))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            format!("{normalized} is not registered"),
        ))
    }
}

#[derive(Serialize)]
pub(crate) struct Resolved {
    message: &'static str,
    replaced: bool,
    #[serde(flatten)]
    chain: ChainResponse,
}

/// GET /nodes/resolve
async fn resolve_conflicts(State(state): State<AppState>) -> Result<Json<Resolved>, ApiError> {
    let resolution = run_consensus(&state).await.map_err(ledger_error)?;
    let message = if resolution.replaced {
        "Chain was replaced with a longer valid chain"
    } else {
        "Local chain is authoritative"
    };
    Ok(Json(Resolved {
        message,
        replaced: resolution.replaced,
        chain: resolution.chain.into(),
    }))
}

/// One consensus round against every registered peer. An in-flight proof
/// search is cancelled when the chain is replaced.
pub(crate) async fn run_consensus(state: &AppState) -> ledger_core::Result<Resolution> {
    let resolution = state
        .resolver
        .resolve_ledger(&state.ledger, &state.peers)
        .await?;
    if resolution.replaced && state.mining.cancel() {
        info!("cancelled in-flight mining after chain replacement");
    }
    Ok(resolution)
}
