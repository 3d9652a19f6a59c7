use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, Response, Url};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "CLI client for the proof-of-work ledger node")]
struct Cli {
    /// Node base URL (e.g. http://127.0.0.1:5000)
    #[arg(long, global = true, env = "LEDGER_NODE_URL", default_value = "http://127.0.0.1:5000")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a transaction to the pending pool
    Submit {
        /// Sender address, 0x followed by hex digits
        #[arg(long)]
        sender: String,
        /// Recipient address
        #[arg(long)]
        recipient: String,
        /// Amount, must be positive
        #[arg(long)]
        amount: f64,
        /// Opaque signature carried with the transaction
        #[arg(long)]
        signature: Option<String>,
    },
    /// Mine the pending pool into a new block
    Mine,
    /// Print the full chain
    Chain,
    /// Print the pending pool
    Pending,
    /// Register peer nodes
    Register {
        /// Peer addresses, e.g. http://10.0.0.2:5000
        #[arg(required = true)]
        nodes: Vec<String>,
    },
    /// Remove a registered peer
    Unregister {
        /// Peer address, as host:port or a URL
        address: String,
    },
    /// List registered peers
    Peers,
    /// Run consensus against registered peers
    Resolve,
}

#[derive(Serialize)]
struct TransactionInput {
    sender: String,
    recipient: String,
    amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Serialize)]
struct NodeRegistration {
    nodes: Vec<String>,
}

/// Appends `segments` to the node URL, percent-encoding each one.
fn endpoint(node: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(node).with_context(|| format!("invalid node URL {node:?}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("node URL {node:?} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let node = cli.node.as_str();
    let request = match cli.cmd {
        Command::Submit {
            sender,
            recipient,
            amount,
            signature,
        } => {
            let tx = TransactionInput {
                sender,
                recipient,
                amount,
                signature,
            };
            client.post(endpoint(node, &["transactions"])?).json(&tx)
        }
        Command::Mine => client.get(endpoint(node, &["mine"])?),
        Command::Chain => client.get(endpoint(node, &["chain"])?),
        Command::Pending => client.get(endpoint(node, &["transactions", "pending"])?),
        Command::Register { nodes } => client
            .post(endpoint(node, &["nodes", "register"])?)
            .json(&NodeRegistration { nodes }),
        Command::Unregister { address } => {
            client.request(Method::DELETE, endpoint(node, &["nodes", address.as_str()])?)
        }
        Command::Peers => client.get(endpoint(node, &["nodes"])?),
        Command::Resolve => client.get(endpoint(node, &["nodes", "resolve"])?),
    };

    let res = request.send().await?;
    print_response(res).await
}

async fn print_response(res: Response) -> Result<()> {
    let status = res.status();
    debug!("response from {}", res.url());
    let body = res.text().await?;
    println!("status: {status}");
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{body}"),
    }
    if !status.is_success() {
        anyhow::bail!("request failed with {status}");
    }
    Ok(())
}
