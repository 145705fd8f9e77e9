//! relay-pty: PTY wrapper for reliable agent message injection.
//!
//! Wraps an agent CLI (claude, codex, gemini, ...) in a PTY, connects to
//! the relay daemon as that agent, injects incoming relay messages into the
//! terminal, and parses the agent's output for outbound `->relay:` commands.
//!
//! Usage:
//!   relay-pty --name myagent --cli claude -- claude --model opus

// Allow dead code - several components expose API surface that the binary
// itself does not reach (used by unit tests and kept for embedders).
#![allow(dead_code)]

mod idle;
mod inject;
mod parser;
mod protocol;
mod pty;
mod queue;
mod wrapper;

use anyhow::Result;
use clap::Parser;
use protocol::{CliKind, Config};
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// PTY wrapper bridging an agent CLI onto the relay daemon
#[derive(Parser, Debug)]
#[command(name = "relay-pty")]
#[command(about = "PTY wrapper bridging an agent CLI onto the relay daemon")]
#[command(version)]
struct Args {
    /// Agent name announced to the daemon
    #[arg(short, long)]
    name: String,

    /// Relay daemon socket path
    #[arg(long, env = "AGENT_RELAY_SOCKET")]
    daemon_socket: Option<PathBuf>,

    /// CLI family being wrapped (claude, codex, gemini, cursor, ...)
    #[arg(long, default_value = "other")]
    cli: String,

    /// Task description announced to the daemon
    #[arg(long)]
    task: Option<String>,

    /// Regex pattern to detect the agent prompt (default: per CLI family)
    #[arg(long)]
    prompt_pattern: Option<String>,

    /// Milliseconds of silence before considering the terminal idle
    #[arg(long, default_value = "1500")]
    min_silence: u64,

    /// Idle confidence required before injecting (0.0 - 1.0)
    #[arg(long, default_value = "0.7")]
    confidence_threshold: f64,

    /// Maximum messages in the injection queue before refusing
    #[arg(long, default_value = "50")]
    queue_max: usize,

    /// Maximum injection retries
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Base delay between retries in milliseconds (linear backoff)
    #[arg(long, default_value = "300")]
    retry_delay: u64,

    /// Delay between writing a message and pressing ENTER, in milliseconds
    #[arg(long, default_value = "50")]
    enter_delay: u64,

    /// How long to poll for the injected echo, in milliseconds
    #[arg(long, default_value = "2000")]
    verification_timeout: u64,

    /// Trust writes instead of verifying the echo (non-echoing children)
    #[arg(long)]
    skip_verification: bool,

    /// Output parsed relay commands as JSON to stderr
    #[arg(long)]
    json_output: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Terminal rows (for headless mode)
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns (for headless mode)
    #[arg(long)]
    cols: Option<u16>,

    /// Log file path for agent output (tees stdout to file)
    #[arg(long)]
    log_file: Option<String>,

    /// Command to run (after --)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

/// Fall back through the standard socket locations when none is given.
fn default_socket() -> PathBuf {
    let project = PathBuf::from(".agent-relay/relay.sock");
    if project.exists() {
        return project;
    }
    let legacy = PathBuf::from("/tmp/agent-relay.sock");
    if legacy.exists() {
        return legacy;
    }
    if let Ok(home) = std::env::var("HOME") {
        let home_sock = PathBuf::from(home).join(".agent-relay/relay.sock");
        if home_sock.exists() {
            return home_sock;
        }
    }
    project
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("relay-pty v{}", env!("CARGO_PKG_VERSION"));
    info!("agent: {}", args.name);
    info!("command: {:?}", args.command);

    let cli = CliKind::from_name(&args.cli);
    let prompt_pattern = args
        .prompt_pattern
        .unwrap_or_else(|| cli.prompt_pattern().to_string());
    let daemon_socket = args.daemon_socket.unwrap_or_else(default_socket);
    info!("daemon socket: {}", daemon_socket.display());

    let config = Config {
        name: args.name.clone(),
        cli,
        prompt_pattern,
        min_silence_ms: args.min_silence,
        confidence_threshold: args.confidence_threshold,
        queue_max: args.queue_max,
        max_retries: args.max_retries,
        retry_delay_ms: args.retry_delay,
        enter_delay_ms: args.enter_delay,
        verification_timeout_ms: args.verification_timeout,
        skip_verification: args.skip_verification,
        json_output: args.json_output,
    };

    wrapper::run(wrapper::WrapperOpts {
        config,
        daemon_socket,
        cli_name: args.cli,
        task: args.task,
        rows: args.rows,
        cols: args.cols,
        log_file: args.log_file,
        command: args.command,
    })
    .await
}
