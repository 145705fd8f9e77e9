//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the relay daemon.
#[derive(Debug, Clone, clap::Args)]
pub struct DaemonConfig {
    /// Unix socket path (default: discovered, see `discovery`).
    #[arg(long, env = "AGENT_RELAY_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Optional TCP listen address for testing (e.g. 127.0.0.1:7391).
    #[arg(long, env = "AGENT_RELAY_TCP")]
    pub tcp: Option<String>,

    /// Heartbeat interval in milliseconds; two missed PONGs tear a session down.
    #[arg(long, default_value_t = 15_000, env = "AGENT_RELAY_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Maximum frame size in bytes, declared to clients at WELCOME.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_frame_bytes: usize,

    /// Offline inbox retention per agent (most-recent records kept).
    #[arg(long, default_value_t = 200)]
    pub inbox_max: usize,

    /// Optional offline inbox age cap in milliseconds (0 disables).
    #[arg(long, default_value_t = 0)]
    pub inbox_max_age_ms: u64,

    /// Replay buffer retention per session (records).
    #[arg(long, default_value_t = 1000)]
    pub replay_max: usize,

    /// Replay buffer age cap in milliseconds.
    #[arg(long, default_value_t = 600_000)]
    pub replay_max_age_ms: u64,

    /// How long a detached session stays resumable, in milliseconds.
    #[arg(long, default_value_t = 300_000)]
    pub resume_ttl_ms: u64,

    /// Dedup horizon of recent envelope ids per session.
    #[arg(long, default_value_t = 2000)]
    pub dedup_capacity: usize,

    /// Retry hint carried on BUSY responses, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub busy_retry_ms: u64,

    /// How long SPAWN waits for AGENT_READY when asked to, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub spawn_ready_timeout_ms: u64,

    /// Channel store path (default: `channels.json` next to the socket).
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Wrapper binary the default launcher invokes for SPAWN.
    #[arg(long, default_value = "relay-pty")]
    pub wrapper_bin: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl DaemonConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn resume_ttl(&self) -> Duration {
        Duration::from_millis(self.resume_ttl_ms)
    }

    pub fn replay_max_age(&self) -> Duration {
        Duration::from_millis(self.replay_max_age_ms)
    }

    pub fn spawn_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_ready_timeout_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            tcp: None,
            heartbeat_ms: 15_000,
            max_frame_bytes: 1024 * 1024,
            inbox_max: 200,
            inbox_max_age_ms: 0,
            replay_max: 1000,
            replay_max_age_ms: 600_000,
            resume_ttl_ms: 300_000,
            dedup_capacity: 2000,
            busy_retry_ms: 250,
            spawn_ready_timeout_ms: 30_000,
            store: None,
            wrapper_bin: "relay-pty".to_string(),
            log_level: "info".to_string(),
        }
    }
}
