//! Relay daemon library.
//!
//! The binary is a thin wrapper around [`Daemon::start`]; integration tests
//! run the daemon in-process against a tempdir socket.

pub mod broker;
pub mod config;
pub mod control;
pub mod delivery;
pub mod discovery;
pub mod launcher;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod store;

use crate::config::DaemonConfig;
use crate::launcher::Launcher;
use crate::router::{Router, RouterCmd};
use crate::store::ChannelStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// A running daemon: routing task plus listeners.
pub struct Daemon {
    pub socket_path: PathBuf,
    router_tx: mpsc::Sender<RouterCmd>,
    router_handle: JoinHandle<()>,
    listener_handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Start the routing task and listeners. The socket file appears once
    /// the unix listener has bound.
    pub fn start(config: DaemonConfig, launcher: Arc<dyn Launcher>) -> Self {
        let socket_path = discovery::bind_path(config.socket.as_deref());
        let store_path = config
            .store
            .clone()
            .unwrap_or_else(|| match socket_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.join("channels.json"),
                _ => PathBuf::from("channels.json"),
            });
        let store = ChannelStore::new(store_path);

        let (router_tx, router_rx) = mpsc::channel(1024);
        let router = Router::new(config.clone(), launcher, Some(store));
        let router_handle = tokio::spawn(router.run(router_rx));

        let mut listener_handles = Vec::new();
        let unix_path = socket_path.to_string_lossy().to_string();
        let unix_tx = router_tx.clone();
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = server::run_unix_listener(unix_path, unix_tx).await {
                error!("unix listener failed: {:#}", e);
            }
        }));

        if let Some(addr) = config.tcp.clone() {
            let tcp_tx = router_tx.clone();
            listener_handles.push(tokio::spawn(async move {
                if let Err(e) = server::run_tcp_listener(addr, tcp_tx).await {
                    error!("tcp listener failed: {:#}", e);
                }
            }));
        }

        Self {
            socket_path,
            router_tx,
            router_handle,
            listener_handles,
        }
    }

    /// Stop listeners and the routing task, removing the socket file.
    pub async fn shutdown(self) {
        for handle in &self.listener_handles {
            handle.abort();
        }
        let _ = self.router_tx.send(RouterCmd::Shutdown).await;
        let _ = self.router_handle.await;
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
