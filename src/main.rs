//! Orion node binary.
//!
//! Starts a single node on TCP from command-line arguments.
//!
//! # Usage
//! ```text
//! orion-node [listen_addr] [OPTIONS]
//! ```
//!
//! # Arguments
//! - `listen_addr`: Local address to bind (defaults to `0.0.0.0:6001`)
//!
//! # Options
//! - `--peer <addr>`: Peer to connect to on startup, may be repeated
//! - `--produce`: Produce blocks from pending transactions
//! - `--block-time <secs>`: Seconds between produced blocks (default 5)
//! - `--dev`: No proof of work and fast timers
//!
//! The log level is read from `ORION_LOG`.

use futures::future::join_all;
use orion_node::config::NodeConfig;
use orion_node::crypto::key_pair::PrivateKey;
use orion_node::network::tcp_transport::TcpTransport;
use orion_node::node::Node;
use orion_node::{error, info, warn};
use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6001";
const DEFAULT_BLOCK_TIME_SECS: u64 = 5;

struct Options {
    listen_addr: SocketAddr,
    peers: Vec<SocketAddr>,
    produce: bool,
    block_time: Duration,
    dev: bool,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.iter().skip(1).any(|a| a == "--help" || a == "-h") {
        print_usage(&args[0]);
        return;
    }

    let options = match parse_args(&args[1..]) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}\n", message);
            print_usage(&args[0]);
            process::exit(1);
        }
    };

    let config = if options.dev {
        NodeConfig::dev()
    } else {
        NodeConfig::default()
    };

    let transport = TcpTransport::new(options.listen_addr);
    let node = match Node::start(config, transport).await {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("failed to start node on {}: {}", options.listen_addr, e);
            process::exit(1);
        }
    };

    let dials = options.peers.iter().map(|peer| {
        info!("connecting to peer at {}", peer);
        node.connect(*peer)
    });
    for result in join_all(dials).await {
        if let Err(e) = result {
            error!("{}", e);
        }
    }

    if options.produce {
        let producer = PrivateKey::new().public_key().address();
        info!(
            "producing a block every {}s as {}",
            options.block_time.as_secs(),
            producer
        );
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut ticker = interval(options.block_time);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match node.produce_block(producer).await {
                    Ok(block) => info!(
                        "produced block {} at height {} with {} transactions",
                        block.hash(),
                        block.height(),
                        block.transactions().len()
                    ),
                    Err(e) => warn!("block production failed: {}", e),
                }
            }
        });
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl+C: {}", e);
        return;
    }
    info!("Ctrl+C received, shutting down...");
    node.shutdown().await;
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        listen_addr: DEFAULT_LISTEN_ADDR
            .parse()
            .map_err(|e| format!("invalid default address: {}", e))?,
        peers: Vec::new(),
        produce: false,
        block_time: Duration::from_secs(DEFAULT_BLOCK_TIME_SECS),
        dev: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--peer" => {
                let value = args.get(i + 1).ok_or("--peer requires an argument")?;
                let addr = value
                    .parse()
                    .map_err(|_| format!("Invalid peer address: {}", value))?;
                options.peers.push(addr);
                i += 2;
            }
            "--block-time" => {
                let value = args.get(i + 1).ok_or("--block-time requires an argument")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid block time: {}", value))?;
                options.block_time = Duration::from_secs(secs.max(1));
                i += 2;
            }
            "--produce" => {
                options.produce = true;
                i += 1;
            }
            "--dev" => {
                options.dev = true;
                i += 1;
            }
            other if i == 0 && !other.starts_with("--") => {
                options.listen_addr = other
                    .parse()
                    .map_err(|_| format!("Invalid listen address: {}", other))?;
                i += 1;
            }
            other => return Err(format!("Unexpected argument: {}", other)),
        }
    }
    Ok(options)
}

const USAGE: &str = "\
Orion Node

USAGE:
    {program} [listen_addr] [OPTIONS]

ARGS:
    [listen_addr]         Local address to bind (default 0.0.0.0:6001)

OPTIONS:
    --peer <addr>         Peer to connect to on startup (repeatable)
    --produce             Produce blocks from pending transactions
    --block-time <secs>   Seconds between produced blocks (default 5)
    --dev                 No proof of work, fast timers
    -h, --help            Print this help message

ENVIRONMENT:
    ORION_LOG             Minimum log level: debug, info, warn or error

EXAMPLES:
    # Start a producing node
    {program} 127.0.0.1:6001 --produce --dev

    # Join it
    {program} 127.0.0.1:6002 --peer 127.0.0.1:6001 --dev
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
