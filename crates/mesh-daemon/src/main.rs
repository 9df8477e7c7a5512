//! mesh-daemon: WebSocket relay and command-line mesh peer.
//!
//! `relay` runs the topic broker. `peer` joins a channel through a relay,
//! prints every membership notification as a JSON line, and sends stdin
//! lines as application messages.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mesh_core::{
    ChannelInfo, ChannelPolicy, Clock, Destination, EngineConfig, EventLog, MeshEngine, SystemClock,
};
use mesh_daemon::{RelayServer, WebSocketCarrier};

#[derive(Parser, Debug)]
#[command(name = "mesh-daemon")]
#[command(about = "Peer discovery and session membership over a WebSocket relay")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true, env = "MESH_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the topic relay
    Relay {
        /// Address to listen on for WebSocket clients
        #[arg(short, long, default_value = "0.0.0.0:9400", env = "MESH_LISTEN")]
        listen: String,
    },
    /// Join a channel as a mesh peer
    Peer(PeerArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    /// Relay URL
    #[arg(long, default_value = "ws://127.0.0.1:9400", env = "MESH_RELAY")]
    relay: String,

    /// Main channel name
    #[arg(long, default_value = "lobby", env = "MESH_CHANNEL")]
    channel: String,

    /// Application address (hex peer id if not provided)
    #[arg(long, env = "MESH_ADDRESS")]
    address: Option<String>,

    /// Data announced to peers in hellos
    #[arg(long, default_value = "", env = "MESH_HELLO")]
    hello: String,

    /// Extra subchannels to join once the main channel is up
    #[arg(long = "subchannel", env = "MESH_SUBCHANNELS", value_delimiter = ',')]
    subchannels: Vec<String>,

    /// Ping interval in ms (0 disables membership tracking)
    #[arg(long, default_value_t = 3000, env = "MESH_PING_MS")]
    ping_ms: u64,

    /// Silence after which a peer is dropped, in ms
    #[arg(long, default_value_t = 15000, env = "MESH_DROP_MS")]
    drop_ms: u64,

    /// Silence after which a peer is reported missing, in ms (0 disables)
    #[arg(long, default_value_t = 5000, env = "MESH_MISSING_MS")]
    missing_ms: u64,

    /// Clock sync interval in ms (0 disables)
    #[arg(long, default_value_t = 10000, env = "MESH_SYNC_MS")]
    sync_ms: u64,

    /// Channel capacity including us (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "MESH_MAX_PEERS")]
    max_peers: u32,

    /// Engine update interval in ms
    #[arg(long, default_value_t = 50, env = "MESH_TICK_MS")]
    tick_ms: u64,
}

impl PeerArgs {
    fn policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            drop_ms: self.drop_ms,
            ping_ms: self.ping_ms,
            missing_ms: self.missing_ms,
            sync_ms: self.sync_ms,
            max_peers: self.max_peers,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,mesh_daemon=debug,mesh_core=debug"
    } else {
        "info,mesh_daemon=info,mesh_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Relay { listen } => run_relay(&listen).await,
        Command::Peer(args) => run_peer(args).await,
    }
}

async fn run_relay(listen: &str) -> Result<()> {
    let listener = RelayServer::bind(listen).await?;
    let mut relay = RelayServer::new();

    info!("Relay running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => relay.accept_connection(stream, addr).await,
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }

            Some(event) = relay.recv_event() => {
                relay.handle_event(event).await;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    relay.shutdown().await;
    info!("Shutting down");
    Ok(())
}

async fn run_peer(args: PeerArgs) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let carrier = WebSocketCarrier::connect_with_clock(&args.relay, clock.clone()).await?;
    let config = EngineConfig {
        address: args.address.clone(),
        ..EngineConfig::default()
    };
    let mut engine = MeshEngine::new(config, clock, carrier, EventLog::new());

    let main_channel = ChannelInfo::new(&args.channel, args.policy());
    let main_id = main_channel.id;
    engine.join(main_channel, args.hello.clone())?;
    info!("Peer {} starting on {}", engine.local_address(), args.channel);

    let mut pending_subchannels = args.subchannels.clone();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.update();
                if engine.is_joined() && !pending_subchannels.is_empty() {
                    for name in pending_subchannels.drain(..) {
                        let channel = ChannelInfo::new(&name, args.policy());
                        if let Err(e) = engine.add_subchannel(channel, args.hello.clone()) {
                            warn!("Failed to add subchannel {}: {}", name, e);
                        }
                    }
                }
                for event in engine.client_mut().drain() {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => send_line(&mut engine, main_id, &line),
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    engine.leave();
    // Let the writer flush the goodbye before the runtime exits
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("Shutting down");
    Ok(())
}

/// `@address text` goes to one peer; anything else to the main channel.
fn send_line(engine: &mut MeshEngine<WebSocketCarrier, EventLog>, main_id: mesh_core::ChannelId, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    let (destination, payload) = match line.strip_prefix('@').and_then(|rest| rest.split_once(' ')) {
        Some((address, text)) => (Destination::Address(address.to_string()), text),
        None => (Destination::Channel(main_id), line),
    };
    if let Err(e) = engine.send(destination, payload) {
        warn!("Failed to send: {}", e);
    }
}
