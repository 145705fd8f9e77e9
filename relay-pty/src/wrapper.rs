//! Wrapper orchestrator: glues the PTY, parser, idle detector, injector,
//! and the daemon client together and owns the agent's lifecycle.

use crate::idle::{IdleConfig, IdleDetector, StuckEvent};
use crate::inject::{InjectOutcome, Injector};
use crate::parser::{strip_ansi, OutputParser, RelayCommand};
use crate::protocol::{Config, QueuedMessage};
use crate::pty::{AsyncPty, Pty};
use crate::queue::{EnqueueResult, MessageQueue};
use anyhow::{Context, Result};
use relay_proto::client::{ClientConfig, ClientEvent, RelayClient};
use relay_proto::envelope::{Body, Envelope, Message, PayloadMeta, SpawnRequest};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Everything the wrapper needs to run one agent.
pub struct WrapperOpts {
    pub config: Config,
    pub daemon_socket: PathBuf,
    pub cli_name: String,
    pub task: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub log_file: Option<String>,
    pub command: Vec<String>,
}

/// Best-effort response capture for a blocking sync message: collect the
/// agent's output after injection and ACK it once the terminal settles.
struct SyncCapture {
    correlation_id: String,
    buf: String,
    started: Instant,
    deadline: Instant,
}

/// Run the wrapper until the child exits or a shutdown signal arrives.
pub async fn run(opts: WrapperOpts) -> Result<()> {
    let config = opts.config.clone();

    let pty = Pty::spawn(&opts.command, opts.rows, opts.cols).context("failed to spawn agent")?;
    let child_pid = pty.child_pid_raw();

    let is_interactive = Pty::set_raw_mode().context("failed to set raw mode")?;
    if is_interactive {
        info!("running in interactive mode (TTY)");
    } else {
        info!("running in headless mode (no TTY)");
    }
    let mut async_pty = AsyncPty::new(pty).context("failed to bridge PTY")?;

    // Detection + injection pipeline.
    let detector = Arc::new(StdMutex::new(IdleDetector::new(
        IdleConfig {
            min_silence_ms: config.min_silence_ms,
            confidence_threshold: config.confidence_threshold,
            ..IdleConfig::default()
        },
        &config.prompt_pattern,
        Some(child_pid),
    )));
    let queue = Arc::new(MessageQueue::new(config.queue_max));
    let (inject_tx, mut inject_rx) = mpsc::channel::<Vec<u8>>(64);
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<InjectOutcome>(64);
    let injector = Arc::new(Injector::new(
        inject_tx,
        Arc::clone(&queue),
        Arc::clone(&detector),
        config.clone(),
        outcome_tx,
    ));
    let mut parser = OutputParser::new(config.name.clone(), &config.prompt_pattern);

    // Daemon client.
    let mut client_config = ClientConfig::new(&opts.daemon_socket, &config.name);
    client_config.cli = Some(opts.cli_name.clone());
    client_config.task = opts.task.clone();
    client_config.working_directory = std::env::current_dir()
        .ok()
        .map(|p| p.to_string_lossy().to_string());
    let (client, mut client_events) = RelayClient::connect(client_config);

    let injector_task = {
        let injector = Arc::clone(&injector);
        tokio::spawn(async move {
            if let Err(e) = injector.run().await {
                error!("injector error: {}", e);
            }
        })
    };

    // Signals.
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigwinch = signal(SignalKind::window_change())?;

    // Stdin reader thread (interactive and piped input both).
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let log_file = open_log_file(opts.log_file.as_deref())?;
    let mut stdout = tokio::io::stdout();

    // Cursor-position queries (CSI 6n) must be answered or some CLIs hang.
    // MCP approval prompts are auto-accepted once.
    let mut mcp_approved = false;
    let mut mcp_buffer = String::new();

    let mut sync_capture: Option<SyncCapture> = None;
    let mut stuck_tick = interval(Duration::from_secs(5));
    let mut sync_tick = interval(Duration::from_millis(250));

    info!(agent = %config.name, "wrapper started");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received");
                let _ = async_pty.signal(nix::sys::signal::Signal::SIGINT);
            }

            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }

            _ = sigwinch.recv() => {
                if let Some(ws) = crate::pty::current_winsize() {
                    let _ = async_pty.resize(ws.ws_row, ws.ws_col);
                }
            }

            Some(data) = stdin_rx.recv() => {
                if let Err(e) = async_pty.send(data).await {
                    error!("failed to forward stdin: {}", e);
                }
            }

            Some(data) = inject_rx.recv() => {
                if let Err(e) = async_pty.send(data).await {
                    error!("failed to inject: {}", e);
                }
            }

            result = async_pty.recv() => {
                let Some(data) = result else {
                    info!("PTY closed");
                    break;
                };
                let text = String::from_utf8_lossy(&data).to_string();

                if text.contains("\x1b[6n") || text.contains("\x1b[?6n") {
                    debug!("answering cursor position query");
                    let _ = async_pty.send(b"\x1b[1;1R".to_vec()).await;
                }

                if !mcp_approved {
                    mcp_buffer.push_str(&text);
                    if mcp_buffer.len() > 1000 {
                        mcp_buffer = mcp_buffer[mcp_buffer.len() - 500..].to_string();
                    }
                    if mcp_buffer.contains("MCP Server Approval Required")
                        && mcp_buffer.contains("[a] Approve all servers")
                    {
                        info!("auto-approving MCP servers");
                        mcp_approved = true;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let _ = async_pty.send(b"a".to_vec()).await;
                        mcp_buffer.clear();
                    }
                }

                stdout.write_all(&data).await?;
                stdout.flush().await?;
                if let Some(log) = &log_file {
                    let mut file = log.lock().await;
                    let _ = file.write_all(&data);
                    let _ = file.flush();
                }

                let clean = strip_ansi(&text);
                if let Some(capture) = sync_capture.as_mut() {
                    capture.buf.push_str(&clean);
                    if capture.buf.len() > 4000 {
                        let cut = capture.buf.len() - 4000;
                        capture.buf = capture.buf[cut..].to_string();
                    }
                }

                if let Ok(mut d) = detector.lock() {
                    d.record_output(&text, &clean);
                }
                injector.record_output(&clean).await;

                let parsed = parser.process(&data);
                if parsed.ready_signal {
                    if let Ok(mut d) = detector.lock() {
                        d.mark_ready();
                    }
                }
                for target in &parsed.rejected {
                    warn!(target = %target, "rejected placeholder relay target");
                }
                for cmd in parsed.commands {
                    if config.json_output {
                        if let Ok(json) = serde_json::to_string(&cmd) {
                            eprintln!("{}", json);
                        }
                    }
                    dispatch_command(&client, cmd).await;
                }
                for cont in parsed.continuity {
                    if config.json_output {
                        if let Ok(json) = serde_json::to_string(&cont) {
                            eprintln!("{}", json);
                        }
                    }
                    let _ = client
                        .log(format!("continuity:{} {}", cont.action, cont.content))
                        .await;
                }
            }

            event = client_events.recv() => {
                let Some(event) = event else {
                    warn!("daemon client closed");
                    break;
                };
                match event {
                    ClientEvent::Connected(welcome) => {
                        info!(session = %welcome.session_id, resumed = welcome.resumed, "relay session up");
                        if !welcome.resumed {
                            // Fresh delivery stream: old echo state is void.
                            queue.reset_dedup().await;
                            parser.reset();
                        }
                        let _ = client.ready().await;
                    }
                    ClientEvent::Delivery(env) => {
                        if let Some(msg) = QueuedMessage::from_delivery(&env) {
                            match queue.enqueue(msg).await {
                                EnqueueResult::Queued => {}
                                EnqueueResult::Duplicate => {
                                    debug!(id = %env.id, "duplicate delivery dropped");
                                }
                                EnqueueResult::Full => {
                                    warn!(id = %env.id, "injection queue full, dropping");
                                }
                            }
                        }
                    }
                    ClientEvent::Busy(busy) => {
                        warn!(to = %busy.to, "daemon backpressure, retry in {}ms", busy.retry_after_ms);
                    }
                    ClientEvent::ServerError(err) => {
                        warn!(code = %err.code, "server error: {}", err.message);
                    }
                    ClientEvent::StateChanged(state) => {
                        debug!("relay connection state: {:?}", state);
                    }
                    ClientEvent::Closed => {
                        warn!("relay connection halted");
                    }
                }
            }

            Some(outcome) = outcome_rx.recv() => {
                match outcome {
                    InjectOutcome::Delivered(msg) => {
                        debug!(id = %msg.id, "message delivered to terminal");
                        if let Some(sync) = &msg.sync {
                            let timeout = Duration::from_millis(sync.timeout_ms.max(1000));
                            sync_capture = Some(SyncCapture {
                                correlation_id: sync.correlation_id.clone(),
                                buf: String::new(),
                                started: Instant::now(),
                                deadline: Instant::now() + timeout,
                            });
                        }
                    }
                    InjectOutcome::Failed { msg, error } => {
                        error!(id = %msg.id, "injection failed: {}", error);
                        let _ = client.log(format!("injection failed for {}: {}", msg.id, error)).await;
                    }
                    InjectOutcome::Skipped { msg, reason } => {
                        warn!(id = %msg.id, "injection skipped: {}", reason);
                    }
                }
            }

            _ = stuck_tick.tick() => {
                let event = detector.lock().ok().and_then(|mut d| d.check_stuck());
                match event {
                    Some(StuckEvent::Stuck(reason)) => {
                        warn!(reason = reason.as_str(), "agent terminal stuck");
                        let _ = client.log(format!("stuck: {}", reason.as_str())).await;
                    }
                    Some(StuckEvent::Unstuck) => {
                        info!("agent terminal recovered");
                        let _ = client.log("unstuck".to_string()).await;
                    }
                    None => {}
                }
            }

            _ = sync_tick.tick() => {
                if let Some(capture) = sync_capture.take() {
                    sync_capture = settle_sync(&client, &detector, capture).await;
                }
            }
        }

        if !async_pty.is_running() {
            info!("child process exited");
            break;
        }
    }

    info!("shutting down...");
    let (total, first, retried, failed) = injector.metrics.snapshot();
    let _ = client
        .log(format!(
            "injector metrics: total={} first_try={} with_retry={} failed={} success_rate={:.2}",
            total,
            first,
            retried,
            failed,
            injector.metrics.success_rate()
        ))
        .await;
    let _ = client.close().await;
    match async_pty.shutdown() {
        Some(exit) => info!(code = exit.code(), "child exited"),
        None => warn!("child exit status unknown"),
    }
    Pty::restore_terminal();
    injector_task.abort();

    info!(total, first, retried, failed, "injection metrics");
    info!("goodbye");
    Ok(())
}

/// Forward one parsed command to the daemon.
async fn dispatch_command(client: &RelayClient, cmd: RelayCommand) {
    match cmd {
        RelayCommand::Message {
            to,
            body,
            thread,
            importance,
            reply_to,
            ..
        } => {
            let meta = if thread.is_some() || importance.is_some() || reply_to.is_some() {
                Some(PayloadMeta {
                    importance,
                    thread,
                    reply_to,
                    sync: None,
                })
            } else {
                None
            };
            let mut env = Envelope::new(Body::Send(Message::text(body))).with_to(to);
            env.payload_meta = meta;
            if let Err(e) = client.send_envelope(env).await {
                warn!("failed to send parsed command: {}", e);
            }
        }
        RelayCommand::Spawn {
            name, cli, task, ..
        } => {
            let client = client.clone();
            tokio::spawn(async move {
                let req = SpawnRequest {
                    name: name.clone(),
                    cli,
                    task: if task.is_empty() { None } else { Some(task) },
                    cwd: None,
                    team: None,
                    shadow_of: None,
                    await_ready: false,
                };
                match client.spawn_agent(req, Duration::from_secs(30)).await {
                    Ok(resp) => debug!(agent = %name, "spawn result: {}", resp.type_tag()),
                    Err(e) => warn!(agent = %name, "spawn failed: {}", e),
                }
            });
        }
        RelayCommand::Release { name, .. } => {
            let client = client.clone();
            tokio::spawn(async move {
                match client.release_agent(&name, Duration::from_secs(10)).await {
                    Ok(resp) => debug!(agent = %name, "release result: {}", resp.type_tag()),
                    Err(e) => warn!(agent = %name, "release failed: {}", e),
                }
            });
        }
    }
}

/// ACK a sync message with the agent's response text once the terminal has
/// settled; give back the capture while it is still collecting.
async fn settle_sync(
    client: &RelayClient,
    detector: &Arc<StdMutex<IdleDetector>>,
    capture: SyncCapture,
) -> Option<SyncCapture> {
    let now = Instant::now();
    if now >= capture.deadline {
        // The remote waiter has expired either way.
        debug!(cid = %capture.correlation_id, "sync capture expired");
        return None;
    }
    // Let the agent actually start answering before judging idleness.
    if now.duration_since(capture.started) < Duration::from_millis(500) {
        return Some(capture);
    }
    let idle = detector
        .lock()
        .map(|d| d.assess().is_idle)
        .unwrap_or(false);
    if !idle {
        return Some(capture);
    }
    let response = capture.buf.trim().to_string();
    let payload = if response.is_empty() {
        None
    } else {
        Some(serde_json::json!(response))
    };
    if let Err(e) = client
        .ack_sync(capture.correlation_id.clone(), payload)
        .await
    {
        warn!("failed to ACK sync request: {}", e);
    }
    None
}

fn open_log_file(path: Option<&str>) -> Result<Option<Arc<Mutex<File>>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = Path::new(path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("failed to create log directory {:?}: {}", parent, e);
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("failed to open log file: {}", path))?;
    info!("logging agent output to {}", path);
    Ok(Some(Arc::new(Mutex::new(file))))
}
