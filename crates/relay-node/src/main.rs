//! Relay Node
//!
//! Runs the pieces of a shared transport group from the command line:
//! - `hub` relays bridge frames between peer processes
//! - `peer` joins a group through a hub and shares one connection with the
//!   other peers (heartbeat election, since processes share no lock)
//! - `demo` runs a whole group in-process and walks through a handover

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use peer_bridge::{BroadcastBus, BusHub, HubBus, LocalBus};
use peer_election::LockRegistry;
use serde_json::json;
use shared_transport::{LoopbackFactory, SharedTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay bridge frames between peer processes
    Hub,
    /// Join an endpoint group through the hub
    Peer {
        /// Peer id (random when omitted)
        #[arg(long)]
        peer_id: Option<String>,

        /// Session to subscribe to; repeatable, overrides the config file
        #[arg(long = "session")]
        sessions: Vec<String>,

        /// Seconds between demo sends (0 = never), overrides the config file
        #[arg(long)]
        send_interval: Option<u64>,
    },
    /// Run several peers in-process and hand leadership around
    Demo {
        /// Number of peers
        #[arg(long, default_value = "3")]
        peers: usize,

        /// Elect by heartbeat race instead of the lock
        #[arg(long)]
        fallback: bool,
    },
}

/// Shared transport relay node
#[derive(Parser, Debug)]
#[command(name = "relay-node")]
#[command(about = "Share one server connection between peers of an endpoint", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hub address, overrides the config file
    #[arg(long, global = true)]
    hub_addr: Option<String>,

    /// Server endpoint, overrides the config file
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(hub_addr) = args.hub_addr {
        config.hub_addr = hub_addr;
    }
    if let Some(endpoint) = args.endpoint {
        config.transport.endpoint = endpoint;
    }

    match args.command {
        Command::Hub => run_hub(config).await,
        Command::Peer {
            peer_id,
            sessions,
            send_interval,
        } => {
            if !sessions.is_empty() {
                config.sessions = sessions;
            }
            if let Some(secs) = send_interval {
                config.send_interval_secs = secs;
            }
            run_peer(config, peer_id).await
        }
        Command::Demo { peers, fallback } => run_demo(config, peers, fallback).await,
    }
}

/// Run the bus hub until interrupted
async fn run_hub(config: NodeConfig) -> Result<()> {
    tracing::info!("Starting bus hub on {}", config.hub_addr);

    let hub = BusHub::new();
    hub.start(&config.hub_addr).await?;

    let mut report = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let stats = hub.stats();
                tracing::info!(
                    "Hub: {} peers connected, {} frames relayed",
                    stats.peers_connected,
                    stats.frames_relayed
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Hub shutting down");
    Ok(())
}

/// Run one peer process until interrupted
async fn run_peer(config: NodeConfig, peer_id: Option<String>) -> Result<()> {
    tracing::info!("Starting peer for {}", config.transport.endpoint);
    tracing::info!("  Hub: {}", config.hub_url());
    tracing::info!("  Sessions: {:?}", config.sessions);

    let bus: Arc<dyn BroadcastBus> = Arc::new(HubBus::new(config.hub_url()));
    let mut builder = SharedTransport::builder(config.transport.endpoint.clone())
        .config(config.transport.clone())
        .bus(bus)
        .factory(Arc::new(LoopbackFactory::new()));
    if let Some(peer_id) = peer_id {
        builder = builder.peer_id(peer_id);
    }
    let transport = builder.build().await?;

    transport.connect().await?;
    tracing::info!(
        "Peer {} connected as {} ({:?})",
        transport.peer_id(),
        if transport.is_leader() { "leader" } else { "follower" },
        transport.connection_id()
    );

    for session_id in &config.sessions {
        transport.subscribe_to_session(session_id).await?;
    }

    let mut events = transport.on_event();
    let sending = config.send_interval_secs > 0;
    let mut sends = tokio::time::interval(Duration::from_secs(config.send_interval_secs.max(1)));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => tracing::info!("Event {} on {}: {}", event.kind, event.session_id, event.payload),
                Err(RecvError::Closed) => break,
                Err(e) => tracing::warn!("Event feed interrupted: {}", e),
            },
            _ = sends.tick(), if sending => {
                counter += 1;
                if let Some(session_id) = config.sessions.first() {
                    let input = json!({ "chunks": [format!("ping {}", counter)] });
                    let mut stream = transport.send(input, session_id);
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => tracing::info!("Send {} -> {}", counter, event.kind),
                            Err(e) => {
                                tracing::warn!("Send {} failed: {}", counter, e);
                                break;
                            }
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.disconnect().await;
    tracing::info!("Peer shut down");
    Ok(())
}

/// Run a group in-process and walk through a leader handover
async fn run_demo(config: NodeConfig, peers: usize, fallback: bool) -> Result<()> {
    if peers < 2 {
        bail!("demo needs at least 2 peers, got {}", peers);
    }
    tracing::info!(
        "Starting demo: {} peers, {} election",
        peers,
        if fallback { "heartbeat" } else { "lock" }
    );

    let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new());
    let locks = (!fallback).then(LockRegistry::new);
    let factory = Arc::new(LoopbackFactory::new());

    let mut group = Vec::with_capacity(peers);
    for i in 0..peers {
        let transport = SharedTransport::builder(config.transport.endpoint.clone())
            .config(config.transport.clone())
            .peer_id(format!("peer-{}", i))
            .bus(bus.clone())
            .locks(locks.clone())
            .factory(factory.clone())
            .build()
            .await?;
        group.push(transport);
    }

    let results = futures::future::join_all(group.iter().map(|t| t.connect())).await;
    for result in results {
        result?;
    }

    for (i, transport) in group.iter().enumerate() {
        transport
            .subscribe_to_session(&format!("session-{}", i))
            .await?;
    }
    report(&group);

    let Some(leader) = group.iter().position(|t| t.is_leader()) else {
        bail!("no leader elected");
    };
    let follower = (leader + 1) % group.len();

    let input = json!({ "chunks": ["hello", "from", "a", "follower"] });
    let mut stream = group[follower].send(input, &format!("session-{}", follower));
    while let Some(item) = stream.next().await {
        let event = item?;
        tracing::info!("Forwarded send -> {} {}", event.kind, event.payload);
    }

    tracing::info!("Leader {} resigning", group[leader].peer_id());
    group[leader].resign().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    report(&group);

    if let Some(real) = factory.latest() {
        tracing::info!(
            "Connection {} restored sessions {:?}",
            real.id(),
            real.subscribed_sessions()
        );
    }

    for transport in &group {
        transport.disconnect().await;
    }
    tracing::info!("Demo finished");
    Ok(())
}

fn report(group: &[SharedTransport]) {
    for transport in group {
        let leadership = transport.leadership();
        tracing::info!(
            "  {} leader={} state={:?} connection={:?}",
            leadership.peer_id,
            leadership.is_leader,
            transport.state(),
            transport.connection_id()
        );
    }
}
