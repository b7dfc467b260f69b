//! DHT node binary.
//!
//! Starts a node on a TCP listener, bootstraps from the given peers and then
//! reads simple commands from stdin.
//!
//! # Usage
//!
//! ```bash
//! webdht --listen 127.0.0.1:4000 --id-seed alice
//! webdht --listen 127.0.0.1:4001 --peer <hex-id>@127.0.0.1:4000
//! ```
//!
//! Commands: `put <key> <value>`, `get <key>`, `find <hex-id>`, `peers`,
//! `stats`, `quit`. Log verbosity follows `RUST_LOG` (default `info`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use webdht::{derive_node_id, Contact, DhtConfig, DhtNode, NodeEvent, NodeId, TcpTransport};

#[derive(Debug, Parser)]
#[command(name = "webdht", about = "Kademlia DHT node")]
struct Args {
    /// Address to accept peer connections on.
    #[arg(long, default_value = "127.0.0.1:4000")]
    listen: SocketAddr,

    /// Bootstrap peer as <hex-id>@<host:port>; may be repeated.
    #[arg(long = "peer")]
    peers: Vec<Contact>,

    /// Derive the node id from this string instead of picking one at random.
    #[arg(long)]
    id_seed: Option<String>,

    /// JSON configuration file; missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bucket size.
    #[arg(long)]
    k: Option<usize>,

    /// Override lookup parallelism.
    #[arg(long)]
    alpha: Option<usize>,
}

fn load_config(args: &Args) -> Result<DhtConfig> {
    let mut config = match &args.config {
        Some(path) => DhtConfig::from_json_file(path)?,
        None => DhtConfig::default(),
    };
    if let Some(k) = args.k {
        config.k = k;
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let id = match &args.id_seed {
        Some(seed) => derive_node_id(seed.as_bytes()),
        None => NodeId::random(),
    };
    let listener = TcpListener::bind(args.listen).await?;
    let self_contact = Contact::new(id, listener.local_addr()?.to_string());

    let (transport, transport_events) = TcpTransport::new(self_contact.clone());
    tokio::spawn(webdht::server::serve(listener, transport.clone()));

    let node = Arc::new(DhtNode::new(
        self_contact.clone(),
        transport,
        transport_events,
        config,
    )?);
    spawn_event_logger(&node);
    node.start().await?;

    println!("DHT node started");
    println!("  Contact: {self_contact}");

    if !args.peers.is_empty() {
        let reached = node.bootstrap(&args.peers).await;
        info!(reached, total = args.peers.len(), "bootstrap finished");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("put"), Some(key), Some(value)) => {
                let stored = node.put(key, value.as_bytes().to_vec()).await?;
                println!("stored={stored}");
            }
            (Some("get"), Some(key), None) => match node.get(key).await? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("not found"),
            },
            (Some("find"), Some(target), None) => match target.parse::<NodeId>() {
                Ok(target) => {
                    for contact in node.find_node(target).await {
                        println!("{contact}");
                    }
                }
                Err(err) => println!("{err}"),
            },
            (Some("peers"), None, None) => {
                for contact in node.peers().lock().await.connected_contacts() {
                    println!("{contact}");
                }
            }
            (Some("stats"), None, None) => {
                let snapshot = node.telemetry_snapshot().await;
                println!("{}", serde_json::to_string(&snapshot)?);
            }
            (Some("quit"), None, None) => break,
            (None, _, _) => {}
            _ => println!("commands: put <key> <value> | get <key> | find <hex-id> | peers | stats | quit"),
        }
    }

    node.shutdown().await;
    Ok(())
}

fn spawn_event_logger(node: &Arc<DhtNode<TcpTransport>>) {
    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NodeEvent::Signal { from, via, data }) => {
                    info!(%from, %via, "signal received: {data}");
                }
                Ok(event) => info!("{event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
