//! Command-line entry point for the reliable datagram transport.
//!
//! `rdt-node server` runs the server role, addressing peers by node id
//! through the session registry. `rdt-node client` talks to a single
//! fixed peer and can optionally fire one record before settling into
//! the receive loop. Both roles log every delivered record and their
//! own liveness transitions; Ctrl+C triggers a graceful shutdown.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rdt_dispatcher::{Dispatcher, DispatcherConfigInput, HandlerRegistry};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on how long the client's startup `--send` waits for the
/// initial probe's reply before giving up and attempting the send anyway.
/// Matches the transport's own retry budget (`MAX_RETRIES * RETRY_INTERVAL`).
const INITIAL_PROBE_WAIT: Duration = Duration::from_secs(3);
const INITIAL_PROBE_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "rdt-node", about = "Reliable datagram transport client/server")]
struct Cli {
    /// Path to a TOML config file, layered under the command-line flags.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Address peers by node id via the session registry.
    Server {
        /// Local bind address. Port 0 lets the OS assign one.
        #[arg(long, default_value = "0.0.0.0:9100")]
        bind: String,
    },
    /// Talk to a single fixed peer.
    Client {
        /// Peer address to send to and probe.
        #[arg(long)]
        peer: String,
        /// This client's own node id, stamped into every outbound record.
        #[arg(long, default_value_t = 0)]
        node_id: u32,
        /// Local bind address. Port 0 lets the OS assign one.
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: String,
        /// Send one JSON record on startup, module:payload, e.g.
        /// `telemetry:{"reading":41}`.
        #[arg(long, value_parser = parse_send_record)]
        send: Option<(String, serde_json::Value)>,
    },
}

fn parse_send_record(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (module, payload) = raw
        .split_once(':')
        .ok_or_else(|| "expected MODULE:JSON".to_string())?;
    let value: serde_json::Value = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    Ok((module.to_string(), value))
}

fn load_config_input(path: &Option<PathBuf>) -> anyhow::Result<DispatcherConfigInput> {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(DispatcherConfigInput::default()),
    }
}

fn install_default_handlers(handlers: &HandlerRegistry, delivered: Arc<AtomicU64>) {
    for module in ["node", "database", "plugin"] {
        let counter = delivered.clone();
        handlers.register(module, move |node_id, value, source| {
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::info!(module, node_id, %source, %value, "record delivered");
        });
    }
}

/// Poll `dispatcher.is_online(addr)` until it flips true or `timeout`
/// elapses. Used only to give the startup probe's reply a chance to land
/// before a one-shot `--send`; not a substitute for the transport's own
/// retry handling.
fn wait_for_online(dispatcher: &Dispatcher, addr: std::net::SocketAddr, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !dispatcher.is_online(addr) && Instant::now() < deadline {
        std::thread::sleep(INITIAL_PROBE_POLL);
    }
    if !dispatcher.is_online(addr) {
        tracing::warn!(%addr, "peer still not confirmed online after initial probe, sending anyway");
    }
}

fn run(running: Arc<AtomicBool>, dispatcher: Arc<Dispatcher>, delivered: Arc<AtomicU64>) {
    let mut last_stats = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
        if last_stats.elapsed() >= STATS_INTERVAL {
            tracing::info!(
                local = %dispatcher.local_address(),
                delivered = delivered.load(Ordering::Relaxed),
                "rdt-node stats"
            );
            last_stats = Instant::now();
        }
    }
    dispatcher.shutdown();
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config_input = load_config_input(&cli.config)?;

    let delivered = Arc::new(AtomicU64::new(0));
    let handlers = Arc::new(HandlerRegistry::new());
    install_default_handlers(&handlers, delivered.clone());

    let dispatcher = match cli.command {
        Command::Server { bind } => {
            config_input.role = Some("server".to_string());
            config_input.transport.bind_addr = Some(bind);
            let config = config_input
                .into_config()
                .context("invalid server configuration")?;
            tracing::info!(role = "server", "rdt-node starting");
            Dispatcher::new(config, handlers).context("failed to start server dispatcher")?
        }
        Command::Client {
            peer,
            node_id,
            bind,
            send,
        } => {
            config_input.role = Some("client".to_string());
            config_input.peer_addr = Some(peer.clone());
            config_input.node_id = Some(node_id);
            config_input.transport.bind_addr = Some(bind);
            let config = config_input
                .into_config()
                .context("invalid client configuration")?;
            tracing::info!(role = "client", peer = %peer, node_id, "rdt-node starting");
            let dispatcher =
                Dispatcher::new(config, handlers).context("failed to start client dispatcher")?;

            let peer_addr = peer.parse().context("invalid peer address")?;
            dispatcher.probe(peer_addr).context("initial probe failed")?;

            if let Some((module, payload)) = send {
                // `probe` only enqueues; the reply that would flip the peer
                // online arrives asynchronously. Give it a chance before
                // sending, so a fresh client doesn't refuse its own
                // startup `--send` as synchronously offline.
                wait_for_online(&dispatcher, peer_addr, INITIAL_PROBE_WAIT);
                dispatcher
                    .send(&module, node_id, &payload)
                    .context("send failed")?;
            }

            dispatcher
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            running.store(false, Ordering::Relaxed);
        })
        .context("failed to install signal handler")?;
    }

    run(running, dispatcher, delivered);
    Ok(())
}
