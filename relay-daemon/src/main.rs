//! relay-daemon: local-first message relay for CLI coding agents.
//!
//! Routes framed JSON envelopes between agent sessions over a unix socket:
//! unicast, broadcast, channels, topics, shadows, and request/response
//! correlation, with per-recipient ordering and ACK-driven flow control.
//!
//! Usage:
//!   relay-daemon [--socket /path/relay.sock] [--tcp 127.0.0.1:7391]

use anyhow::Result;
use clap::Parser;
use relay_daemon::config::DaemonConfig;
use relay_daemon::launcher::{CommandLauncher, Launcher};
use relay_daemon::{discovery, Daemon};
use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Local-first message relay daemon for CLI coding agents
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(about = "Message relay daemon for CLI coding agents")]
#[command(version)]
struct Args {
    #[command(flatten)]
    config: DaemonConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("relay-daemon v{}", env!("CARGO_PKG_VERSION"));

    let socket_path = discovery::bind_path(config.socket.as_deref());
    let launcher: Arc<dyn Launcher> = Arc::new(CommandLauncher::new(
        config.wrapper_bin.clone(),
        socket_path.clone(),
    ));

    let daemon = Daemon::start(config, launcher);
    info!("socket: {}", daemon.socket_path.display());

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    info!("shutting down...");
    daemon.shutdown().await;
    info!("goodbye");
    Ok(())
}
