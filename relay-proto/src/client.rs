//! Daemon client used by wrappers, tools, and tests.
//!
//! Owns one connection to the relay daemon: handshake and resume, auto-PONG,
//! cumulative auto-ACK, delivery dedup, and reconnect with exponential
//! backoff plus jitter. Consumers receive events on an mpsc channel and issue
//! commands through cheap clonable handles; there is no callback registry.

use crate::dedup::DedupRing;
use crate::envelope::{
    self, Ack, Body, Capabilities, ChannelMessage, ChannelOp, Envelope, EntityType, ErrorBody,
    Hello, LogLine, Message, PayloadMeta, SessionRef, ShadowBinding, SpawnRequest, SyncMeta,
    TopicRef, Welcome,
};
use crate::error::{ClientError, ErrorCode, FailureCause};
use crate::frame::{encode, FrameDecoder, Framing};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Reconnect backoff base (doubles per attempt, jittered).
const BACKOFF_BASE_MS: u64 = 1000;
/// Reconnect backoff ceiling.
const BACKOFF_CAP_MS: u64 = 30_000;

/// Client connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Backoff,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub agent: String,
    pub entity: EntityType,
    pub cli: Option<String>,
    pub task: Option<String>,
    pub working_directory: Option<String>,
    pub capabilities: Capabilities,
    pub framing: Framing,
    /// Reconnect after transport errors (fatal server errors always halt).
    pub reconnect: bool,
    /// ACK deliveries as soon as the consumer channel accepts them.
    pub auto_ack: bool,
}

impl ClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>, agent: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            agent: agent.into(),
            entity: EntityType::Agent,
            cli: None,
            task: None,
            working_directory: None,
            capabilities: Capabilities::default(),
            framing: Framing::LengthPrefixed,
            reconnect: true,
            auto_ack: true,
        }
    }
}

/// Events surfaced to the consumer.
#[derive(Debug)]
pub enum ClientEvent {
    /// Handshake completed; carries the server's WELCOME.
    Connected(Welcome),
    /// A routed message. Deduplicated; ACKed already when auto-ack is on.
    Delivery(Envelope),
    /// Soft backpressure for a SEND this client produced.
    Busy(crate::envelope::Busy),
    /// Non-fatal server error not tied to a pending request.
    ServerError(ErrorBody),
    /// Connection state transition.
    StateChanged(ConnectionState),
    /// The client halted (fatal error or explicit close).
    Closed,
}

/// Resolution of a blocking sync SEND.
#[derive(Debug, Clone)]
pub struct SyncReply {
    pub correlation_id: String,
    pub response: Option<Value>,
}

enum Command {
    Send(Envelope),
    /// Control RPC correlated by envelope id.
    Request {
        env: Envelope,
        timeout: Duration,
        tx: oneshot::Sender<Result<Envelope, FailureCause>>,
    },
    /// Blocking sync SEND correlated by `payload_meta.sync.correlation_id`.
    SyncSend {
        env: Envelope,
        correlation_id: String,
        timeout: Duration,
        tx: oneshot::Sender<Result<SyncReply, FailureCause>>,
    },
    /// Reply-to request: resolved by a DELIVER whose meta replies to the id.
    ReplySend {
        env: Envelope,
        correlation_id: String,
        timeout: Duration,
        tx: oneshot::Sender<Result<Envelope, FailureCause>>,
    },
    Close,
}

struct Waiter<T> {
    tx: oneshot::Sender<Result<T, FailureCause>>,
    deadline: Instant,
}

/// Handle to the client task. Cloning is cheap; all clones drive one session.
#[derive(Clone)]
pub struct RelayClient {
    cmd_tx: mpsc::Sender<Command>,
    agent: String,
}

impl RelayClient {
    /// Spawn the connection task. Events arrive on the returned receiver.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let agent = config.agent.clone();

        tokio::spawn(async move {
            ConnectionTask::new(config, cmd_rx, event_tx).run().await;
        });

        (Self { cmd_tx, agent }, event_rx)
    }

    pub fn agent_name(&self) -> &str {
        &self.agent
    }

    async fn submit(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Fire-and-forget SEND to a name, `*`, `#channel`, or reserved target.
    pub async fn send(&self, to: &str, body: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Send(Message::text(body))).with_to(to);
        self.submit(Command::Send(env)).await
    }

    /// SEND with explicit meta (importance, thread, reply-to).
    pub async fn send_with_meta(
        &self,
        to: &str,
        body: impl Into<String>,
        meta: PayloadMeta,
    ) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Send(Message::text(body)))
            .with_to(to)
            .with_meta(meta);
        self.submit(Command::Send(env)).await
    }

    /// SEND routed by topic to every subscriber.
    pub async fn send_topic(&self, topic: &str, body: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Send(Message::text(body))).with_topic(topic);
        self.submit(Command::Send(env)).await
    }

    /// Raw envelope passthrough for callers that build their own.
    pub async fn send_envelope(&self, env: Envelope) -> Result<(), ClientError> {
        self.submit(Command::Send(env)).await
    }

    /// Blocking sync SEND: resolves when the recipient ACKs the correlation
    /// id, or fails with a timeout cause.
    pub async fn send_and_wait(
        &self,
        to: &str,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<SyncReply, ClientError> {
        let correlation_id = envelope::new_id();
        let meta = PayloadMeta {
            sync: Some(SyncMeta {
                correlation_id: correlation_id.clone(),
                blocking: true,
                timeout_ms: timeout.as_millis() as u64,
            }),
            ..Default::default()
        };
        let env = Envelope::new(Body::Send(Message::text(body)))
            .with_to(to)
            .with_meta(meta);

        let (tx, rx) = oneshot::channel();
        self.submit(Command::SyncSend {
            env,
            correlation_id,
            timeout,
            tx,
        })
        .await?;
        rx.await
            .map_err(|_| ClientError::Closed)?
            .map_err(ClientError::Failed)
    }

    /// Request/response over reply-to chains: the recipient is expected to
    /// answer with a SEND whose `payload_meta.reply_to` matches.
    pub async fn send_request(
        &self,
        to: &str,
        body: impl Into<String>,
        timeout: Duration,
    ) -> Result<Envelope, ClientError> {
        let correlation_id = envelope::new_id();
        let env = Envelope::new(Body::Send(Message {
            kind: "request".to_string(),
            body: body.into(),
            data: Some(serde_json::json!({ "_correlationId": correlation_id })),
        }))
        .with_to(to);

        let (tx, rx) = oneshot::channel();
        self.submit(Command::ReplySend {
            env,
            correlation_id,
            timeout,
            tx,
        })
        .await?;
        rx.await
            .map_err(|_| ClientError::Closed)?
            .map_err(ClientError::Failed)
    }

    /// Control RPC; the response envelope's id equals the request's id.
    pub async fn request(&self, body: Body, timeout: Duration) -> Result<Envelope, ClientError> {
        let env = Envelope::new(body);
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Request { env, timeout, tx }).await?;
        rx.await
            .map_err(|_| ClientError::Closed)?
            .map_err(ClientError::Failed)
    }

    /// Cumulative acknowledgement up to `seq`.
    pub async fn ack(&self, seq: u64) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Ack(Ack {
            seq: Some(seq),
            ..Default::default()
        }));
        self.submit(Command::Send(env)).await
    }

    /// Answer a blocking sync SEND this client received.
    pub async fn ack_sync(
        &self,
        correlation_id: impl Into<String>,
        response: Option<Value>,
    ) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Ack(Ack {
            correlation_id: Some(correlation_id.into()),
            response,
            ..Default::default()
        }));
        self.submit(Command::Send(env)).await
    }

    pub async fn join_channel(&self, channel: &str) -> Result<(), ClientError> {
        let env = Envelope::new(Body::ChannelJoin(ChannelOp {
            channel: channel.to_string(),
            member: None,
            visibility: None,
        }));
        self.submit(Command::Send(env)).await
    }

    pub async fn leave_channel(&self, channel: &str) -> Result<(), ClientError> {
        let env = Envelope::new(Body::ChannelLeave(ChannelOp {
            channel: channel.to_string(),
            member: None,
            visibility: None,
        }));
        self.submit(Command::Send(env)).await
    }

    /// First-class channel fan-out.
    pub async fn send_channel(
        &self,
        channel: &str,
        body: impl Into<String>,
    ) -> Result<(), ClientError> {
        let env = Envelope::new(Body::ChannelMessage(ChannelMessage {
            channel: channel.to_string(),
            body: body.into(),
            data: None,
        }));
        self.submit(Command::Send(env)).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Subscribe(TopicRef {
            topic: topic.to_string(),
        }));
        self.submit(Command::Send(env)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Unsubscribe(TopicRef {
            topic: topic.to_string(),
        }));
        self.submit(Command::Send(env)).await
    }

    pub async fn shadow_bind(&self, binding: ShadowBinding) -> Result<(), ClientError> {
        self.submit(Command::Send(Envelope::new(Body::ShadowBind(binding))))
            .await
    }

    pub async fn shadow_unbind(&self, binding: ShadowBinding) -> Result<(), ClientError> {
        self.submit(Command::Send(Envelope::new(Body::ShadowUnbind(binding))))
            .await
    }

    /// Ship one log line to the dashboard.
    pub async fn log(&self, line: impl Into<String>) -> Result<(), ClientError> {
        let env = Envelope::new(Body::Log(LogLine {
            level: "info".to_string(),
            line: line.into(),
        }));
        self.submit(Command::Send(env)).await
    }

    /// Announce this session finished its bootstrap.
    pub async fn ready(&self) -> Result<(), ClientError> {
        let env = Envelope::new(Body::AgentReady(crate::envelope::AgentReady {
            agent: self.agent.clone(),
        }));
        self.submit(Command::Send(env)).await
    }

    /// SPAWN RPC via the daemon's launcher.
    pub async fn spawn_agent(
        &self,
        req: SpawnRequest,
        timeout: Duration,
    ) -> Result<Envelope, ClientError> {
        self.request(Body::Spawn(req), timeout).await
    }

    /// RELEASE RPC via the daemon's launcher.
    pub async fn release_agent(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Envelope, ClientError> {
        self.request(
            Body::Release(crate::envelope::ReleaseRequest {
                name: name.to_string(),
            }),
            timeout,
        )
        .await
    }

    /// Clean shutdown: send BYE and stop the connection task.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.submit(Command::Close).await
    }
}

/// The connection task: one per client, owns socket + correlation tables.
struct ConnectionTask {
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
    resume: Option<SessionRef>,
    dedup: DedupRing,
    pending_rpc: HashMap<String, Waiter<Envelope>>,
    pending_sync: HashMap<String, Waiter<SyncReply>>,
    pending_reply: HashMap<String, Waiter<Envelope>>,
    halted: bool,
}

impl ConnectionTask {
    fn new(
        config: ClientConfig,
        cmd_rx: mpsc::Receiver<Command>,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            event_tx,
            resume: None,
            dedup: DedupRing::default(),
            pending_rpc: HashMap::new(),
            pending_sync: HashMap::new(),
            pending_reply: HashMap::new(),
            halted: false,
        }
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if self.halted {
                break;
            }
            self.emit_state(ConnectionState::Connecting).await;

            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => match self.drive(stream).await {
                    Ok(clean) => {
                        if clean {
                            break;
                        }
                        attempt = 0;
                    }
                    Err(e) => {
                        debug!(agent = %self.config.agent, "connection ended: {}", e);
                    }
                },
                Err(e) => {
                    debug!(agent = %self.config.agent, "connect failed: {}", e);
                }
            }

            self.fail_pending(FailureCause::Disconnected);

            if self.halted || !self.config.reconnect {
                break;
            }

            self.emit_state(ConnectionState::Backoff).await;
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        self.emit_state(ConnectionState::Disconnected).await;
        let _ = self.event_tx.send(ClientEvent::Closed).await;
    }

    /// Drive one connection to completion. Ok(true) means clean shutdown.
    async fn drive(&mut self, stream: UnixStream) -> Result<bool, ClientError> {
        let (mut read_half, mut write_half) = stream.into_split();
        let mut decoder = FrameDecoder::with_framing(self.config.framing);

        self.emit_state(ConnectionState::Handshaking).await;
        let welcome = self
            .handshake(&mut read_half, &mut write_half, &mut decoder)
            .await?;
        decoder.set_max_frame_bytes(welcome.server.max_frame_bytes);
        self.resume = Some(SessionRef {
            resume_token: welcome.resume_token.clone(),
            session_id: Some(welcome.session_id.clone()),
        });

        info!(
            agent = %self.config.agent,
            session = %welcome.session_id,
            resumed = welcome.resumed,
            "session established"
        );
        self.emit_state(ConnectionState::Ready).await;
        let _ = self
            .event_tx
            .send(ClientEvent::Connected(welcome.clone()))
            .await;

        let mut read_buf = [0u8; 8192];
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                n = read_half.read(&mut read_buf) => {
                    let n = n?;
                    if n == 0 {
                        return Err(ClientError::Closed);
                    }
                    for env in decoder.push(&read_buf[..n])? {
                        if self.handle_inbound(env, &mut write_half).await? {
                            return Ok(true);
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd, &mut write_half).await? {
                                return Ok(true);
                            }
                        }
                        None => {
                            // All handles dropped: shut down cleanly.
                            self.halted = true;
                            let _ = self.write(&mut write_half, &Envelope::new(Body::Bye)).await;
                            return Ok(true);
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_expired();
                }
            }
        }
    }

    async fn handshake(
        &mut self,
        read_half: &mut tokio::net::unix::OwnedReadHalf,
        write_half: &mut tokio::net::unix::OwnedWriteHalf,
        decoder: &mut FrameDecoder,
    ) -> Result<Welcome, ClientError> {
        let mut session = self.resume.clone();
        loop {
            let hello = Envelope::new(Body::Hello(Hello {
                agent: self.config.agent.clone(),
                entity: self.config.entity,
                cli: self.config.cli.clone(),
                task: self.config.task.clone(),
                working_directory: self.config.working_directory.clone(),
                capabilities: self.config.capabilities.clone(),
                session: session.clone(),
            }));
            self.write(write_half, &hello).await?;

            let mut read_buf = [0u8; 8192];
            let mut retry_fresh = false;
            loop {
                let n = read_half.read(&mut read_buf).await?;
                if n == 0 {
                    return Err(ClientError::Closed);
                }
                let envs = decoder.push(&read_buf[..n])?;
                let mut welcome = None;
                for env in envs {
                    match env.body {
                        Body::Welcome(w) => {
                            welcome = Some(w);
                        }
                        Body::Error(err) if err.code == ErrorCode::ResumeTooOld => {
                            // Token expired: drop it and retry fresh on the
                            // same connection.
                            warn!(agent = %self.config.agent, "resume token too old, rejoining fresh");
                            self.resume = None;
                            session = None;
                            retry_fresh = true;
                        }
                        Body::Error(err) => {
                            if err.fatal {
                                self.halted = true;
                            }
                            return Err(ClientError::Server {
                                code: err.code,
                                message: err.message,
                            });
                        }
                        other => {
                            debug!("ignoring pre-welcome envelope {}", other.type_tag());
                        }
                    }
                }
                if let Some(w) = welcome {
                    return Ok(w);
                }
                if retry_fresh {
                    // RESUME_TOO_OLD path: resend HELLO without a token.
                    break;
                }
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        env: Envelope,
        write_half: &mut tokio::net::unix::OwnedWriteHalf,
    ) -> Result<bool, ClientError> {
        match &env.body {
            Body::Ping(hb) => {
                let pong = Envelope::new(Body::Pong(*hb));
                self.write(write_half, &pong).await?;
            }
            Body::Deliver(_) | Body::ChannelMessage(_) => {
                eprintln!("DEBUG client {} got Deliver id={}", self.config.agent, env.id);
                if self.dedup.check(&env.id) {
                    eprintln!("DEBUG client {} dedup suppressed id={}", self.config.agent, env.id);
                    debug!(id = %env.id, "duplicate delivery suppressed");
                    return Ok(false);
                }
                let seq = env.delivery.as_ref().map(|d| d.seq);

                // A delivery answering an outstanding reply-to request is
                // consumed by the waiter instead of the event stream.
                let reply_to = env
                    .payload_meta
                    .as_ref()
                    .and_then(|m| m.reply_to.clone());
                let consumed = if let Some(rid) = reply_to {
                    if let Some(waiter) = self.pending_reply.remove(&rid) {
                        let _ = waiter.tx.send(Ok(env.clone()));
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };

                if !consumed {
                    let _ = self.event_tx.send(ClientEvent::Delivery(env)).await;
                }
                if self.config.auto_ack && self.config.capabilities.ack {
                    if let Some(seq) = seq {
                        let ack = Envelope::new(Body::Ack(Ack {
                            seq: Some(seq),
                            ..Default::default()
                        }));
                        self.write(write_half, &ack).await?;
                    }
                }
            }
            Body::Ack(ack) => {
                if let Some(cid) = &ack.correlation_id {
                    if let Some(waiter) = self.pending_sync.remove(cid) {
                        let _ = waiter.tx.send(Ok(SyncReply {
                            correlation_id: cid.clone(),
                            response: ack.response.clone(),
                        }));
                    }
                }
            }
            Body::Busy(busy) => {
                let _ = self.event_tx.send(ClientEvent::Busy(busy.clone())).await;
            }
            Body::Error(err) => {
                if let Some(waiter) = self.pending_rpc.remove(&env.id) {
                    let _ = waiter
                        .tx
                        .send(Err(FailureCause::Rejected(err.code, err.message.clone())));
                } else {
                    let fatal = err.fatal;
                    let _ = self
                        .event_tx
                        .send(ClientEvent::ServerError(err.clone()))
                        .await;
                    if fatal {
                        self.halted = true;
                        return Err(ClientError::Server {
                            code: err.code,
                            message: err.message.clone(),
                        });
                    }
                }
            }
            // Control responses resolve by request id.
            Body::StatusResponse(_)
            | Body::ListAgentsResponse(_)
            | Body::ListConnectedAgentsResponse(_)
            | Body::InboxResponse(_)
            | Body::HealthResponse(_)
            | Body::MetricsResponse(_)
            | Body::RemoveAgentResponse(_)
            | Body::SpawnResult(_)
            | Body::ReleaseResult(_) => {
                if let Some(waiter) = self.pending_rpc.remove(&env.id) {
                    let _ = waiter.tx.send(Ok(env));
                } else {
                    debug!(id = %env.id, "unmatched response {}", env.type_tag());
                }
            }
            other => {
                debug!("unhandled inbound {}", other.type_tag());
            }
        }
        Ok(false)
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        write_half: &mut tokio::net::unix::OwnedWriteHalf,
    ) -> Result<bool, ClientError> {
        match cmd {
            Command::Send(env) => {
                self.write(write_half, &env).await?;
            }
            Command::Request { env, timeout, tx } => {
                self.pending_rpc.insert(
                    env.id.clone(),
                    Waiter {
                        tx,
                        deadline: Instant::now() + timeout,
                    },
                );
                self.write(write_half, &env).await?;
            }
            Command::SyncSend {
                env,
                correlation_id,
                timeout,
                tx,
            } => {
                self.pending_sync.insert(
                    correlation_id,
                    Waiter {
                        tx,
                        deadline: Instant::now() + timeout,
                    },
                );
                self.write(write_half, &env).await?;
            }
            Command::ReplySend {
                env,
                correlation_id,
                timeout,
                tx,
            } => {
                self.pending_reply.insert(
                    correlation_id,
                    Waiter {
                        tx,
                        deadline: Instant::now() + timeout,
                    },
                );
                self.write(write_half, &env).await?;
            }
            Command::Close => {
                self.halted = true;
                let _ = self.write(write_half, &Envelope::new(Body::Bye)).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn write(
        &self,
        write_half: &mut tokio::net::unix::OwnedWriteHalf,
        env: &Envelope,
    ) -> Result<(), ClientError> {
        let bytes = encode(env, self.config.framing)?;
        write_half.write_all(&bytes).await?;
        Ok(())
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        for table in [&mut self.pending_rpc, &mut self.pending_reply] {
            let expired: Vec<String> = table
                .iter()
                .filter(|(_, w)| w.deadline <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(w) = table.remove(&key) {
                    let _ = w.tx.send(Err(FailureCause::Timeout));
                }
            }
        }
        let expired: Vec<String> = self
            .pending_sync
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(w) = self.pending_sync.remove(&key) {
                let _ = w.tx.send(Err(FailureCause::Timeout));
            }
        }
    }

    fn fail_pending(&mut self, cause: FailureCause) {
        for (_, w) in self.pending_rpc.drain() {
            let _ = w.tx.send(Err(cause.clone()));
        }
        for (_, w) in self.pending_sync.drain() {
            let _ = w.tx.send(Err(cause.clone()));
        }
        for (_, w) in self.pending_reply.drain() {
            let _ = w.tx.send(Err(cause.clone()));
        }
    }

    async fn emit_state(&self, state: ConnectionState) {
        let _ = self.event_tx.send(ClientEvent::StateChanged(state)).await;
    }
}

/// Exponential backoff with full jitter: base 1 s doubling to a 30 s cap.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(5));
    let cap = exp.min(BACKOFF_CAP_MS);
    let jittered = rand::rng().random_range(cap / 2..=cap);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        for attempt in 1..12 {
            let d = backoff_delay(attempt);
            assert!(d >= Duration::from_millis(BACKOFF_BASE_MS / 2));
            assert!(d <= Duration::from_millis(BACKOFF_CAP_MS));
        }
    }

    #[test]
    fn test_client_config_defaults() {
        let cfg = ClientConfig::new("/tmp/relay.sock", "Alice");
        assert!(cfg.reconnect);
        assert!(cfg.auto_ack);
        assert_eq!(cfg.framing, Framing::LengthPrefixed);
        assert!(cfg.capabilities.ack);
    }
}
