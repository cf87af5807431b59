//! tab-relay: coordinator and peer processes for the tab relay.
//!
//! `tab-relay coordinator` hosts the singleton coordinator on a WebSocket
//! port. `tab-relay peer` plays one tab: it joins the coordinator, takes
//! whatever role it is given and accepts commands on stdin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::{
    Coordinator, CoordinatorSettings, KeyValueStore, MemoryStore, PeerHandle, PeerNode,
    PeerSettings, RelayConfig, RelayEvent,
};
use relay_daemon::{CoordinatorClient, JsonFileStore, ReconnectConfig, WebSocketHost, WebSocketLink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tab-relay")]
#[command(about = "Share one external connection between many tabs")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator that peers connect to
    Coordinator {
        /// Address to listen on for peer connections
        #[arg(short, long, default_value = "127.0.0.1:35943")]
        listen: String,

        /// Directory holding the persisted membership
        #[arg(long)]
        state_dir: PathBuf,

        /// How long a peer has to answer a liveness probe after a restart
        #[arg(long, default_value_t = 1000)]
        probe_timeout_ms: u64,
    },

    /// Run one peer
    Peer {
        /// Coordinator WebSocket URL
        #[arg(short, long, default_value = "ws://127.0.0.1:35943")]
        coordinator: String,

        /// Host of the external server
        #[arg(long, default_value = "localhost")]
        external_host: String,

        /// External server port (overrides the saved setting)
        #[arg(long)]
        port: Option<u16>,

        /// Match query to send once connected (overrides the saved setting)
        #[arg(long)]
        query: Option<String>,

        /// Directory holding the saved settings (in-memory if omitted)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Seconds before an unanswered external request is dropped
        #[arg(long, default_value_t = 30)]
        ledger_ttl_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,relay_daemon=debug"
    } else {
        "info,relay_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Coordinator {
            listen,
            state_dir,
            probe_timeout_ms,
        } => {
            let settings = CoordinatorSettings {
                probe_timeout: Duration::from_millis(probe_timeout_ms),
            };
            run_coordinator(&listen, state_dir, settings).await
        }
        Command::Peer {
            coordinator,
            external_host,
            port,
            query,
            state_dir,
            ledger_ttl_secs,
        } => {
            let settings = PeerSettings {
                external_host,
                ledger_ttl: Duration::from_secs(ledger_ttl_secs),
                ..Default::default()
            };
            run_peer(&coordinator, port, query, state_dir, settings).await
        }
    }
}

async fn run_coordinator(listen: &str, state_dir: PathBuf, settings: CoordinatorSettings) -> Result<()> {
    info!("Starting tab-relay coordinator");
    info!("State dir: {:?}", state_dir);

    let store = Arc::new(JsonFileStore::open(&state_dir));
    let (host, events) = WebSocketHost::resume_from(store.as_ref()).await;
    let listener = WebSocketHost::bind(listen).await?;

    // Accept before restoring: probes go out over live connections, and
    // peers that join meanwhile queue until the coordinator is ready.
    tokio::spawn(host.clone().serve(listener));

    let handle = Coordinator::init(Arc::new(host), events, store, settings).await?;
    info!("Coordinator running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = handle.shutdown().await {
        warn!("Coordinator did not shut down cleanly: {}", e);
    }
    Ok(())
}

async fn run_peer(
    coordinator: &str,
    port: Option<u16>,
    query: Option<String>,
    state_dir: Option<PathBuf>,
    settings: PeerSettings,
) -> Result<()> {
    info!("Starting tab-relay peer");

    let store: Arc<dyn KeyValueStore> = match state_dir {
        Some(dir) => {
            info!("State dir: {:?}", dir);
            Arc::new(JsonFileStore::open(&dir))
        }
        None => Arc::new(MemoryStore::new()),
    };

    let mut config = RelayConfig::load(store.as_ref())
        .await
        .context("Failed to load relay config")?;
    if let Some(port) = port {
        config.port = port;
    }

    let session = CoordinatorClient::connect(coordinator).await?;
    let (link, external) = WebSocketLink::new(ReconnectConfig::default());

    let node = PeerNode::new(
        session.peer_id,
        session.client.clone(),
        Arc::new(link),
        store,
        config,
        settings,
    );
    let handle = node.spawn(session.inbox, external);

    let peer_id = session.peer_id;
    let _subscription = handle.events().subscribe(move |event| log_event(peer_id, &event));

    if let Some(query) = query {
        handle.update_match_query(query).await;
    }

    info!("Peer {} running. Commands: query <q>, item <q>, port <n>, state", peer_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => run_command(&handle, line.trim()).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = handle.stopped() => {
                info!("Peer {} lost its coordinator", peer_id);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.client.close().await;
    Ok(())
}

async fn run_command(handle: &PeerHandle, line: &str) {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "query" => handle.update_match_query(arg).await,
        "item" => handle.get_item(arg).await,
        "port" => match arg.parse::<u16>() {
            Ok(port) => handle.set_port(port).await,
            Err(_) => error!("Invalid port: {:?}", arg),
        },
        "state" => match handle.state().await {
            Some(state) => println!(
                "{}",
                serde_json::to_string_pretty(&state).expect("PeerState serialization should not fail")
            ),
            None => warn!("Peer has stopped"),
        },
        other => error!("Unknown command: {}", other),
    }
}

fn log_event(peer_id: relay_core::PeerId, event: &RelayEvent) {
    match event {
        RelayEvent::RoleChanged { role } => info!("Peer {} is now {:?}", peer_id, role),
        RelayEvent::StatusChanged { status } => info!("External status: {:?}", status),
        RelayEvent::PendingChanged { pending } => info!("Pending requests: {:?}", pending),
        RelayEvent::MessageReceived { message } => info!(
            "External message: {}",
            serde_json::to_string(message).expect("ExternalResponse serialization should not fail")
        ),
        RelayEvent::PortChanged { port } => info!("External port: {}", port),
    }
}
