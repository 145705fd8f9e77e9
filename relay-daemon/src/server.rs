//! Socket listeners and per-connection tasks.
//!
//! One accept task per listener. Each connection runs a single task that
//! reads frames into router commands and drains an outbound queue,
//! coalescing queued envelopes into one write to cut syscall overhead.
//! The router closes a connection by dropping its writer sender.

use crate::router::RouterCmd;
use anyhow::{Context, Result};
use relay_proto::envelope::Envelope;
use relay_proto::frame::{encode, FrameDecoder, Framing};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upper bound on one coalesced write.
const COALESCE_MAX_BYTES: usize = 256 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Bind the unix socket, apply 0600 permissions, and accept forever.
pub async fn run_unix_listener(
    socket_path: String,
    router_tx: mpsc::Sender<RouterCmd>,
) -> Result<()> {
    let path = Path::new(&socket_path);
    if path.exists() {
        std::fs::remove_file(path).context("remove existing socket")?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .context(format!("create socket directory {:?}", parent))?;
        }
    }

    let listener = UnixListener::bind(path).context(format!("bind socket at {}", socket_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            warn!("failed to set socket permissions: {}", e);
        }
    }

    info!("listening on {}", socket_path);
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                spawn_connection(stream, router_tx.clone());
            }
            Err(e) => {
                error!("accept error: {}", e);
            }
        }
    }
}

/// Optional TCP listener for testing.
pub async fn run_tcp_listener(addr: String, router_tx: mpsc::Sender<RouterCmd>) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .context(format!("bind tcp listener at {}", addr))?;
    info!("listening on tcp {}", addr);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("tcp connection from {}", peer);
                spawn_connection(stream, router_tx.clone());
            }
            Err(e) => {
                error!("tcp accept error: {}", e);
            }
        }
    }
}

/// Run one connection: reader + coalescing writer in a single task.
pub fn spawn_connection<S>(stream: S, router_tx: mpsc::Sender<RouterCmd>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    tokio::spawn(async move {
        if let Err(e) = connection_task(stream, conn_id, router_tx).await {
            debug!(conn_id, "connection ended: {}", e);
        }
    });
}

async fn connection_task<S>(
    stream: S,
    conn_id: u64,
    router_tx: mpsc::Sender<RouterCmd>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Envelope>(256);

    router_tx
        .send(RouterCmd::Connected {
            conn_id,
            writer: writer_tx,
        })
        .await
        .ok();

    let mut decoder = FrameDecoder::new();
    let mut read_buf = [0u8; 8192];
    let mut batch: Vec<u8> = Vec::with_capacity(4096);

    loop {
        tokio::select! {
            read = read_half.read(&mut read_buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => match decoder.push(&read_buf[..n]) {
                        Ok(envelopes) => {
                            for envelope in envelopes {
                                if router_tx
                                    .send(RouterCmd::Inbound { conn_id, envelope })
                                    .await
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => {
                            // The stream is poisoned; report and let the
                            // router decide the error surface.
                            let _ = router_tx
                                .send(RouterCmd::ProtocolError {
                                    conn_id,
                                    code: e.code(),
                                    message: e.to_string(),
                                })
                                .await;
                            // Drain any final outbound error before closing.
                            drain_outbound(&mut writer_rx, &mut write_half, &decoder, &mut batch)
                                .await;
                            return Ok(());
                        }
                    },
                    Err(e) => {
                        debug!(conn_id, "read error: {}", e);
                        break;
                    }
                }
            }
            outbound = writer_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        let framing = decoder.framing().unwrap_or(Framing::LengthPrefixed);
                        batch.clear();
                        if let Ok(bytes) = encode(&envelope, framing) {
                            batch.extend_from_slice(&bytes);
                        }
                        // Coalesce whatever else is already queued.
                        while batch.len() < COALESCE_MAX_BYTES {
                            match writer_rx.try_recv() {
                                Ok(envelope) => {
                                    if let Ok(bytes) = encode(&envelope, framing) {
                                        batch.extend_from_slice(&bytes);
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        if write_half.write_all(&batch).await.is_err() {
                            break;
                        }
                    }
                    // Router dropped the writer: close this connection.
                    None => break,
                }
            }
        }
    }

    let _ = router_tx.send(RouterCmd::Disconnected { conn_id }).await;
    Ok(())
}

/// Flush envelopes already queued for a closing connection.
async fn drain_outbound<W>(
    writer_rx: &mut mpsc::Receiver<Envelope>,
    write_half: &mut W,
    decoder: &FrameDecoder,
    batch: &mut Vec<u8>,
) where
    W: AsyncWrite + Send + Unpin,
{
    // Give the router a moment to queue its ERROR envelope.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let framing = decoder.framing().unwrap_or(Framing::LengthPrefixed);
    batch.clear();
    while let Ok(envelope) = writer_rx.try_recv() {
        if let Ok(bytes) = encode(&envelope, framing) {
            batch.extend_from_slice(&bytes);
        }
    }
    if !batch.is_empty() {
        let _ = write_half.write_all(batch).await;
    }
}
