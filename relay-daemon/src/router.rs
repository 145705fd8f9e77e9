//! The routing task.
//!
//! One task owns the registry, every delivery queue, and the correlation
//! table; connection tasks post commands through a single mpsc channel, so
//! the hot path has no locks and per-recipient ordering falls out of the
//! command order. No inbound envelope is allowed to crash this task: each
//! handler demotes failures to an ERROR on the offending session.

use crate::broker::{Broker, Waiter, WaiterKind};
use crate::config::DaemonConfig;
use crate::delivery::{DeliveryQueue, Enqueue};
use crate::launcher::Launcher;
use crate::registry::Registry;
use crate::session::Session;
use crate::store::ChannelStore;
use relay_proto::envelope::{
    self, is_channel_name, is_reserved_name, Ack, Body, Busy, Delivery, Envelope, ErrorBody,
    Heartbeat, Hello, Message, MetricsReport, ServerInfo, Welcome,
};
use relay_proto::error::ErrorCode;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Topic that receives server-originated presence events.
pub const PRESENCE_TOPIC: &str = "presence";
/// Topic that receives forwarded LOG lines.
pub const LOGS_TOPIC: &str = "logs";

/// Commands posted to the routing task by connection tasks.
#[derive(Debug)]
pub enum RouterCmd {
    Connected {
        conn_id: u64,
        writer: mpsc::Sender<Envelope>,
    },
    Inbound {
        conn_id: u64,
        envelope: Envelope,
    },
    ProtocolError {
        conn_id: u64,
        code: ErrorCode,
        message: String,
    },
    Disconnected {
        conn_id: u64,
    },
    Shutdown,
}

/// A connection known to the router; pre-handshake it has no session.
#[derive(Debug)]
struct ConnHandle {
    writer: mpsc::Sender<Envelope>,
}

pub struct Router {
    pub(crate) config: DaemonConfig,
    pub(crate) registry: Registry,
    pub(crate) broker: Broker,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) store: Option<ChannelStore>,
    conns: std::collections::HashMap<u64, ConnHandle>,
    pub(crate) metrics: MetricsReport,
    pub(crate) started_at: Instant,
}

impl Router {
    pub fn new(
        config: DaemonConfig,
        launcher: Arc<dyn Launcher>,
        store: Option<ChannelStore>,
    ) -> Self {
        let mut registry = Registry::new();
        if let Some(store) = &store {
            match store.load() {
                Ok(channels) => registry.restore_channels(channels),
                Err(e) => warn!("channel store load failed: {:#}", e),
            }
        }
        Self {
            config,
            registry,
            broker: Broker::new(),
            launcher,
            store,
            conns: std::collections::HashMap::new(),
            metrics: MetricsReport::default(),
            started_at: Instant::now(),
        }
    }

    /// Drive the routing task until Shutdown or channel close.
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<RouterCmd>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(Duration::from_millis(1000));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("routing task started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RouterCmd::Shutdown) | None => break,
                        Some(cmd) => self.handle_cmd(cmd),
                    }
                }
                _ = heartbeat.tick() => self.tick_heartbeats(),
                _ = sweep.tick() => self.tick_sweep(),
            }
        }
        info!("routing task stopped");
    }

    pub(crate) fn handle_cmd(&mut self, cmd: RouterCmd) {
        match cmd {
            RouterCmd::Connected { conn_id, writer } => {
                self.conns.insert(conn_id, ConnHandle { writer });
                debug!(conn_id, "connection registered");
            }
            RouterCmd::Inbound { conn_id, envelope } => {
                self.handle_inbound(conn_id, envelope);
            }
            RouterCmd::ProtocolError {
                conn_id,
                code,
                message,
            } => {
                self.metrics.protocol_errors += 1;
                self.send_error(conn_id, None, code, &message, true);
                self.teardown_conn(conn_id, false);
            }
            RouterCmd::Disconnected { conn_id } => {
                self.teardown_conn(conn_id, true);
            }
            RouterCmd::Shutdown => {}
        }
    }

    // ---- inbound dispatch ----------------------------------------------

    fn handle_inbound(&mut self, conn_id: u64, env: Envelope) {
        let has_session = self.registry.session_id_by_conn(conn_id).is_some();
        match (&env.body, has_session) {
            (Body::Hello(_), _) => {
                if let Body::Hello(hello) = env.body.clone() {
                    self.handle_hello(conn_id, &env.id, hello);
                }
            }
            (Body::Bye, _) => self.handle_bye(conn_id),
            (_, false) => {
                self.send_error(
                    conn_id,
                    Some(&env.id),
                    ErrorCode::Malformed,
                    "handshake required before any other envelope",
                    true,
                );
                self.teardown_conn(conn_id, false);
            }
            (Body::Pong(hb), true) => self.handle_pong(conn_id, *hb),
            (Body::Send(_), true) => self.handle_send(conn_id, env),
            (Body::ChannelMessage(_), true) => self.handle_channel_message(conn_id, env),
            (Body::Ack(_), true) => {
                if let Body::Ack(ack) = env.body.clone() {
                    self.handle_ack(conn_id, ack);
                }
            }
            (Body::Subscribe(t), true) => {
                if let Some(sid) = self.registry.session_id_by_conn(conn_id) {
                    self.registry.subscribe(&t.topic, &sid);
                }
            }
            (Body::Unsubscribe(t), true) => {
                if let Some(sid) = self.registry.session_id_by_conn(conn_id) {
                    self.registry.unsubscribe(&t.topic, &sid);
                }
            }
            (Body::ChannelJoin(_), true) | (Body::ChannelLeave(_), true) => {
                self.handle_channel_membership(conn_id, env);
            }
            (Body::ShadowBind(b), true) => {
                self.registry.shadow_bind(b.clone());
            }
            (Body::ShadowUnbind(b), true) => {
                self.registry.shadow_unbind(&b.primary, &b.shadow);
            }
            (Body::Log(_), true) => self.handle_log(conn_id, env),
            (Body::AgentReady(_), true) => self.handle_agent_ready(conn_id, env),
            (
                Body::Status
                | Body::ListAgents
                | Body::ListConnectedAgents
                | Body::Inbox(_)
                | Body::Health
                | Body::Metrics
                | Body::RemoveAgent(_)
                | Body::Spawn(_)
                | Body::Release(_),
                true,
            ) => self.handle_control(conn_id, env),
            (other, true) => {
                debug!(conn_id, "unexpected inbound {}", other.type_tag());
                self.send_error(
                    conn_id,
                    Some(&env.id),
                    ErrorCode::UnknownType,
                    &format!("unexpected envelope {}", other.type_tag()),
                    false,
                );
            }
        }
    }

    // ---- handshake & lifecycle -----------------------------------------

    fn handle_hello(&mut self, conn_id: u64, request_id: &str, hello: Hello) {
        // Resume path first.
        if let Some(session_ref) = &hello.session {
            let sid = self
                .registry
                .session_id_by_token(&session_ref.resume_token);
            let resumable = sid.as_deref().and_then(|sid| self.registry.session(sid)).map(
                |s| !s.is_live() && s.resumable(self.config.resume_ttl(), Instant::now()),
            );
            match (sid, resumable) {
                (Some(sid), Some(true)) => {
                    self.resume_session(conn_id, &sid);
                    return;
                }
                (Some(sid), Some(false)) => {
                    let live = self
                        .registry
                        .session(&sid)
                        .map(|s| s.is_live())
                        .unwrap_or(false);
                    if live {
                        self.send_error(
                            conn_id,
                            Some(request_id),
                            ErrorCode::DuplicateConnection,
                            "session is still attached elsewhere",
                            true,
                        );
                        self.teardown_conn(conn_id, false);
                    } else {
                        self.send_error(
                            conn_id,
                            Some(request_id),
                            ErrorCode::ResumeTooOld,
                            "resume window expired; reconnect fresh",
                            false,
                        );
                    }
                    return;
                }
                _ => {
                    self.send_error(
                        conn_id,
                        Some(request_id),
                        ErrorCode::ResumeTooOld,
                        "unknown resume token; reconnect fresh",
                        false,
                    );
                    return;
                }
            }
        }

        // Fresh attach: at most one live session per name.
        let mut carried: Vec<Envelope> = Vec::new();
        if let Some(old_sid) = self.registry.session_id_by_name(&hello.agent) {
            let live = self
                .registry
                .session(&old_sid)
                .map(|s| s.is_live())
                .unwrap_or(false);
            if live {
                self.send_error(
                    conn_id,
                    Some(request_id),
                    ErrorCode::DuplicateConnection,
                    &format!("agent {} already has a live session", hello.agent),
                    true,
                );
                self.teardown_conn(conn_id, false);
                return;
            }
            // A detached session superseded by a fresh HELLO: carry its
            // unacked records into the new stream.
            if let Some(mut old) = self.registry.remove_session(&old_sid) {
                carried = old.queue.drain().into_iter().map(|r| r.envelope).collect();
            }
        }

        let Some(writer) = self.conns.get(&conn_id).map(|c| c.writer.clone()) else {
            return;
        };

        let queue = DeliveryQueue::new(
            hello.capabilities.max_inflight,
            self.config.replay_max,
            self.config.replay_max_age(),
        );
        let session = Session::new(
            hello.agent.clone(),
            hello.entity,
            hello.cli.clone(),
            hello.capabilities.clone(),
            conn_id,
            writer,
            queue,
            self.config.dedup_capacity,
        );
        let session_id = session.session_id.clone();
        let resume_token = session.resume_token.clone();
        self.registry.insert_session(session);
        self.metrics.sessions_opened += 1;

        // Enrich the durable record from HELLO.
        if let Some(record) = self.registry.agent_mut(&hello.agent) {
            record.task = hello.task.clone();
            record.working_directory = hello.working_directory.clone();
        }

        let welcome = Envelope {
            v: envelope::PROTOCOL_VERSION,
            id: request_id.to_string(),
            ts: envelope::now_ms(),
            to: Some(hello.agent.clone()),
            from: None,
            topic: None,
            body: Body::Welcome(Welcome {
                session_id: session_id.clone(),
                resume_token,
                server: ServerInfo {
                    max_frame_bytes: self.config.max_frame_bytes,
                    heartbeat_ms: self.config.heartbeat_ms,
                },
                resumed: false,
            }),
            payload_meta: None,
            delivery: None,
        };
        self.write_conn(conn_id, welcome);
        info!(agent = %hello.agent, session = %session_id, "session established");

        // Offline inbox and carried records drain in arrival order.
        let mut backlog = self.registry.drain_inbox(&hello.agent);
        backlog.extend(carried);
        eprintln!("DEBUG hello backlog for {} = {}", hello.agent, backlog.len());
        for env in backlog {
            let r = self.enqueue_deliver(&session_id, env);
            eprintln!("DEBUG enqueue_deliver result = {:?}", r);
        }

        self.emit_presence("join", &hello.agent);
    }

    fn resume_session(&mut self, conn_id: u64, session_id: &str) {
        let Some(writer) = self.conns.get(&conn_id).map(|c| c.writer.clone()) else {
            return;
        };
        let (agent, resume_token, replay) = {
            let Some(session) = self.registry.session_mut(session_id) else {
                return;
            };
            session.attach(conn_id, writer);
            let replay: Vec<Envelope> =
                session.queue.replay().map(|r| r.envelope.clone()).collect();
            (
                session.agent.clone(),
                session.resume_token.clone(),
                replay,
            )
        };
        self.registry.reattach_conn(session_id, conn_id);
        self.metrics.sessions_resumed += 1;

        let welcome = Envelope::new(Body::Welcome(Welcome {
            session_id: session_id.to_string(),
            resume_token,
            server: ServerInfo {
                max_frame_bytes: self.config.max_frame_bytes,
                heartbeat_ms: self.config.heartbeat_ms,
            },
            resumed: true,
        }))
        .with_to(agent.clone());
        self.write_conn(conn_id, welcome);

        info!(agent = %agent, session = %session_id, replayed = replay.len(), "session resumed");
        // Replay precedes any new traffic: records go straight to the
        // connection in seq order; the client ring drops what it has seen.
        for env in replay {
            self.write_conn(conn_id, env);
        }
        self.emit_presence("join", &agent);
    }

    fn handle_bye(&mut self, conn_id: u64) {
        if let Some(sid) = self.registry.session_id_by_conn(conn_id) {
            let agent = self
                .registry
                .session(&sid)
                .map(|s| s.agent.clone())
                .unwrap_or_default();
            for waiter in self.broker.fail_session(&sid) {
                debug!(cid = %waiter.correlation_id, "waiter dropped on BYE");
            }
            self.registry.remove_session(&sid);
            self.emit_presence("leave", &agent);
        }
        self.conns.remove(&conn_id);
    }

    fn handle_pong(&mut self, conn_id: u64, hb: Heartbeat) {
        if let Some(session) = self.registry.session_mut_by_conn(conn_id) {
            if session.heartbeat.nonce == hb.nonce {
                session.heartbeat.missed = 0;
            }
        }
    }

    /// Close a connection; `detach` keeps the session resumable.
    fn teardown_conn(&mut self, conn_id: u64, detach: bool) {
        if detach {
            if let Some(sid) = self.registry.detach_conn(conn_id) {
                let agent = self
                    .registry
                    .session(&sid)
                    .map(|s| s.agent.clone())
                    .unwrap_or_default();
                for waiter in self.broker.fail_session(&sid) {
                    debug!(cid = %waiter.correlation_id, "waiter failed on disconnect");
                }
                self.emit_presence("leave", &agent);
            }
        } else if let Some(sid) = self.registry.session_id_by_conn(conn_id) {
            self.broker.fail_session(&sid);
            if let Some(session) = self.registry.remove_session(&sid) {
                self.emit_presence("leave", &session.agent);
            }
        }
        self.conns.remove(&conn_id);
    }

    // ---- SEND / CHANNEL_MESSAGE routing --------------------------------

    fn handle_send(&mut self, conn_id: u64, mut env: Envelope) {
        let Some(sender_sid) = self.registry.session_id_by_conn(conn_id) else {
            return;
        };
        let sender = {
            let Some(session) = self.registry.session_mut(&sender_sid) else {
                return;
            };
            if session.inbound_dedup.check(&env.id) {
                debug!(id = %env.id, "duplicate SEND suppressed");
                return;
            }
            session.agent.clone()
        };
        env.from = Some(sender.clone());
        self.metrics.routed += 1;

        // Register sync and reply-to waits before fan-out so a fast ACK
        // cannot race the table.
        self.register_correlations(&sender_sid, &env);

        let target = env.to.clone();
        let topic = env.topic.clone();

        if let Some(topic) = topic {
            let subs: Vec<String> = self
                .registry
                .topic_subscribers(&topic)
                .into_iter()
                .filter(|sid| sid != &sender_sid)
                .collect();
            self.fan_out(&sender, &sender_sid, env, subs, Vec::new(), None);
            return;
        }

        let Some(target) = target else {
            self.send_error(
                conn_id,
                Some(&env.id),
                ErrorCode::UnknownRecipient,
                "SEND requires a target or topic",
                false,
            );
            return;
        };

        if target == "*" {
            let dests: Vec<String> = self
                .registry
                .live_session_ids()
                .into_iter()
                .filter(|sid| sid != &sender_sid)
                .collect();
            self.fan_out(
                &sender,
                &sender_sid,
                env,
                dests,
                Vec::new(),
                Some("*".to_string()),
            );
            return;
        }

        if is_channel_name(&target) {
            if !self.registry.is_member(&target, &sender) {
                self.send_error(
                    conn_id,
                    Some(&env.id),
                    ErrorCode::NotMember,
                    &format!("{} is not a member of {}", sender, target),
                    false,
                );
                return;
            }
            let (sessions, inbox) = self.split_members(&target, &sender);
            self.fan_out(&sender, &sender_sid, env, sessions, inbox, Some(target));
            return;
        }

        if is_reserved_name(&target) {
            // Reserved names belong to server plugins; none are installed.
            self.send_error(
                conn_id,
                Some(&env.id),
                ErrorCode::UnknownRecipient,
                &format!("no plugin handles reserved target {}", target),
                false,
            );
            return;
        }

        // Directed unicast.
        match self.registry.session_id_by_name(&target) {
            Some(dest_sid) => {
                self.fan_out(&sender, &sender_sid, env, vec![dest_sid], Vec::new(), None);
            }
            None if self.registry.agent(&target).is_some() => {
                self.fan_out(&sender, &sender_sid, env, Vec::new(), vec![target], None);
            }
            None => {
                self.send_error(
                    conn_id,
                    Some(&env.id),
                    ErrorCode::UnknownRecipient,
                    &format!("unknown recipient {}", target),
                    false,
                );
            }
        }
    }

    fn handle_channel_message(&mut self, conn_id: u64, mut env: Envelope) {
        let Some(sender_sid) = self.registry.session_id_by_conn(conn_id) else {
            return;
        };
        let sender = {
            let Some(session) = self.registry.session_mut(&sender_sid) else {
                return;
            };
            if session.inbound_dedup.check(&env.id) {
                return;
            }
            session.agent.clone()
        };
        env.from = Some(sender.clone());
        self.metrics.routed += 1;

        let channel = match &env.body {
            Body::ChannelMessage(m) => m.channel.clone(),
            _ => return,
        };
        if !self.registry.is_member(&channel, &sender) {
            self.send_error(
                conn_id,
                Some(&env.id),
                ErrorCode::NotMember,
                &format!("{} is not a member of {}", sender, channel),
                false,
            );
            return;
        }
        let (sessions, inbox) = self.split_members(&channel, &sender);
        self.fan_out(&sender, &sender_sid, env, sessions, inbox, Some(channel));
    }

    /// Map channel members (minus sender) onto sessions and inbox names.
    fn split_members(&self, channel: &str, sender: &str) -> (Vec<String>, Vec<String>) {
        let mut sessions = Vec::new();
        let mut inbox = Vec::new();
        for member in self.registry.channel_members_except(channel, sender) {
            match self.registry.session_id_by_name(&member) {
                Some(sid) => sessions.push(sid),
                None => inbox.push(member),
            }
        }
        (sessions, inbox)
    }

    /// Apply shadow copies, dedup the destination set, enqueue everywhere.
    fn fan_out(
        &mut self,
        sender: &str,
        sender_sid: &str,
        env: Envelope,
        mut dest_sids: Vec<String>,
        inbox_names: Vec<String>,
        original_to: Option<String>,
    ) {
        // Shadow rule, applied after primary fan-out: shadows of each
        // primary recipient, plus shadows watching the sender's outbound.
        let mut shadow_sids = Vec::new();
        for sid in &dest_sids {
            if let Some(primary) = self.registry.session(sid).map(|s| s.agent.clone()) {
                for shadow in self.registry.shadows_of(&primary, true) {
                    if let Some(shadow_sid) = self.registry.session_id_by_name(&shadow) {
                        shadow_sids.push(shadow_sid);
                    }
                }
            }
        }
        for shadow in self.registry.shadows_of(sender, false) {
            if let Some(shadow_sid) = self.registry.session_id_by_name(&shadow) {
                shadow_sids.push(shadow_sid);
            }
        }
        dest_sids.extend(shadow_sids);

        // One envelope per recipient session, sender never included.
        let mut seen = HashSet::new();
        dest_sids.retain(|sid| sid != sender_sid && seen.insert(sid.clone()));

        let deliver = make_deliver(&env, original_to.clone());
        let mut busy_recipients = Vec::new();
        for sid in dest_sids {
            match self.enqueue_deliver(&sid, deliver.clone()) {
                Enqueue::Accepted(_) => {}
                Enqueue::Busy => {
                    if let Some(session) = self.registry.session(&sid) {
                        busy_recipients.push((session.agent.clone(), session.queue.len()));
                    }
                }
            }
        }
        for name in inbox_names {
            let stored = self
                .registry
                .store_inbox(&name, deliver.clone(), self.config.inbox_max);
            self.metrics.inbox_stored += 1;
            if !stored {
                self.metrics.dropped += 1;
            }
        }

        for (recipient, depth) in busy_recipients {
            self.metrics.busy += 1;
            self.write_session(
                sender_sid,
                Envelope::new(Body::Busy(Busy {
                    to: recipient,
                    queue_depth: depth,
                    retry_after_ms: self.config.busy_retry_ms,
                })),
            );
        }
    }

    /// Stamp per-recipient seq, retain for replay, write when live.
    fn enqueue_deliver(&mut self, session_id: &str, env: Envelope) -> Enqueue {
        let Some(session) = self.registry.session_mut(session_id) else {
            return Enqueue::Busy;
        };
        let sid = session.session_id.clone();
        match session.queue.enqueue(env, &sid) {
            Enqueue::Accepted(seq) => {
                if let Some(record) = session.queue.last_record() {
                    let stamped = record.envelope.clone();
                    let ok = session.try_write(stamped);
                    eprintln!("DEBUG try_write ok={}", ok);
                }
                self.metrics.delivered += 1;
                Enqueue::Accepted(seq)
            }
            Enqueue::Busy => Enqueue::Busy,
        }
    }

    fn register_correlations(&mut self, sender_sid: &str, env: &Envelope) {
        if let Some(meta) = &env.payload_meta {
            // An inbound reply closes the daemon-side reply-to entry; the
            // reply itself routes to the original sender normally.
            if let Some(reply_to) = &meta.reply_to {
                self.broker.resolve(WaiterKind::ReplyTo, reply_to);
            }
            if let Some(sync) = &meta.sync {
                if sync.blocking {
                    self.broker.register(Waiter {
                        kind: WaiterKind::SyncAck,
                        correlation_id: sync.correlation_id.clone(),
                        owner_session: sender_sid.to_string(),
                        deadline: Instant::now() + Duration::from_millis(sync.timeout_ms),
                        data: None,
                    });
                }
            }
        }
        if let Body::Send(message) = &env.body {
            if let Some(cid) = message
                .data
                .as_ref()
                .and_then(|d| d.get("_correlationId"))
                .and_then(|v| v.as_str())
            {
                let timeout_ms = env
                    .payload_meta
                    .as_ref()
                    .and_then(|m| m.sync.as_ref())
                    .map(|s| s.timeout_ms)
                    .unwrap_or(30_000);
                self.broker.register(Waiter {
                    kind: WaiterKind::ReplyTo,
                    correlation_id: cid.to_string(),
                    owner_session: sender_sid.to_string(),
                    deadline: Instant::now() + Duration::from_millis(timeout_ms),
                    data: None,
                });
            }
        }
    }

    // ---- ACK ------------------------------------------------------------

    fn handle_ack(&mut self, conn_id: u64, ack: Ack) {
        let Some(sid) = self.registry.session_id_by_conn(conn_id) else {
            return;
        };
        if let Some(session) = self.registry.session_mut(&sid) {
            if let Some(seq) = ack.seq {
                let n = session.queue.ack_up_to(seq);
                self.metrics.acked += n as u64;
            }
            if let Some(ack_id) = &ack.ack_id {
                if session.queue.ack_id(ack_id) {
                    self.metrics.acked += 1;
                }
            }
        }
        // A correlated ACK resolves the blocking sender's waiter: forward
        // the ACK to the owning session.
        if let Some(cid) = &ack.correlation_id {
            if let Some(waiter) = self.broker.resolve(WaiterKind::SyncAck, cid) {
                let forwarded = Envelope::new(Body::Ack(Ack {
                    seq: None,
                    ack_id: None,
                    correlation_id: Some(cid.clone()),
                    response: ack.response.clone(),
                }));
                self.write_session(&waiter.owner_session, forwarded);
            }
        }
    }

    // ---- LOG / AGENT_READY ----------------------------------------------

    fn handle_log(&mut self, conn_id: u64, env: Envelope) {
        let Some(sender_sid) = self.registry.session_id_by_conn(conn_id) else {
            return;
        };
        let sender = self
            .registry
            .session(&sender_sid)
            .map(|s| s.agent.clone())
            .unwrap_or_default();
        let Body::Log(log) = &env.body else { return };
        let subs: Vec<String> = self
            .registry
            .topic_subscribers(LOGS_TOPIC)
            .into_iter()
            .filter(|sid| sid != &sender_sid)
            .collect();
        if subs.is_empty() {
            return;
        }
        let mut forward = Envelope::new(Body::Deliver(Message {
            kind: "log".to_string(),
            body: log.line.clone(),
            data: Some(serde_json::json!({ "level": log.level })),
        }))
        .with_from(sender)
        .with_topic(LOGS_TOPIC);
        forward.id = env.id.clone();
        for sid in subs {
            self.enqueue_deliver(&sid, forward.clone());
        }
    }

    fn handle_agent_ready(&mut self, conn_id: u64, env: Envelope) {
        let Body::AgentReady(ready) = &env.body else {
            return;
        };
        let _ = conn_id;
        if let Some(waiter) = self.broker.resolve(WaiterKind::SpawnReady, &ready.agent) {
            let (request_id, pid) = waiter
                .data
                .as_ref()
                .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
                .map(|v| {
                    (
                        v.get("request_id")
                            .and_then(|r| r.as_str())
                            .map(|s| s.to_string()),
                        v.get("pid").and_then(|p| p.as_u64()).map(|p| p as u32),
                    )
                })
                .unwrap_or((None, None));
            let mut result = Envelope::new(Body::SpawnResult(envelope::SpawnResult {
                ok: true,
                name: ready.agent.clone(),
                pid,
                ready: Some(true),
                error: None,
            }));
            if let Some(rid) = request_id {
                result.id = rid;
            }
            self.write_session(&waiter.owner_session, result);
        }
        self.emit_presence("ready", &ready.agent);
    }

    // ---- timers ---------------------------------------------------------

    fn tick_heartbeats(&mut self) {
        let mut dead = Vec::new();
        let mut pings = Vec::new();
        for sid in self.registry.session_ids() {
            let Some(session) = self.registry.session_mut(&sid) else {
                continue;
            };
            if !session.is_live() {
                continue;
            }
            if session.heartbeat.missed >= 2 {
                dead.push((session.conn_id, sid.clone(), session.agent.clone()));
                continue;
            }
            let nonce = rand_nonce();
            session.heartbeat.nonce = nonce;
            session.heartbeat.missed += 1;
            pings.push((sid.clone(), nonce));
        }
        for (sid, nonce) in pings {
            self.write_session(&sid, Envelope::new(Body::Ping(Heartbeat { nonce })));
        }
        for (conn_id, sid, agent) in dead {
            warn!(agent = %agent, session = %sid, "two missed PONGs, tearing down");
            if let Some(conn_id) = conn_id {
                self.teardown_conn(conn_id, true);
            }
        }
    }

    fn tick_sweep(&mut self) {
        let now = Instant::now();

        for waiter in self.broker.sweep(now) {
            match waiter.kind {
                WaiterKind::SyncAck | WaiterKind::ReplyTo => {
                    self.write_session(
                        &waiter.owner_session,
                        Envelope::new(Body::Error(ErrorBody {
                            code: ErrorCode::Timeout,
                            message: format!("wait {} expired", waiter.correlation_id),
                            fatal: false,
                        })),
                    );
                }
                WaiterKind::SpawnReady => {
                    let request_id = waiter
                        .data
                        .as_ref()
                        .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
                        .and_then(|v| {
                            v.get("request_id")
                                .and_then(|r| r.as_str())
                                .map(|s| s.to_string())
                        });
                    let mut result = Envelope::new(Body::SpawnResult(envelope::SpawnResult {
                        ok: true,
                        name: waiter.correlation_id.clone(),
                        pid: None,
                        ready: Some(false),
                        error: None,
                    }));
                    if let Some(rid) = request_id {
                        result.id = rid;
                    }
                    self.write_session(&waiter.owner_session, result);
                }
            }
        }

        // Replay buffers shed aged records.
        for sid in self.registry.session_ids() {
            if let Some(session) = self.registry.session_mut(&sid) {
                session.queue.drop_expired(now);
            }
        }

        // Detached sessions past the resume TTL fall back to the inbox.
        let ttl = self.config.resume_ttl();
        for sid in self.registry.expired_sessions(ttl) {
            if let Some(mut session) = self.registry.remove_session(&sid) {
                debug!(agent = %session.agent, session = %sid, "resume window expired");
                let name = session.agent.clone();
                for record in session.queue.drain() {
                    self.registry
                        .store_inbox(&name, record.envelope, self.config.inbox_max);
                }
            }
        }
    }

    // ---- helpers --------------------------------------------------------

    /// Server-originated presence events for interested subscribers.
    fn emit_presence(&mut self, event: &str, agent: &str) {
        let subs = self.registry.topic_subscribers(PRESENCE_TOPIC);
        for sid in subs {
            if self.registry.session(&sid).map(|s| s.agent.as_str()) == Some(agent) {
                continue;
            }
            let env = Envelope::new(Body::Deliver(Message {
                kind: "presence".to_string(),
                body: event.to_string(),
                data: Some(serde_json::json!({ "agent": agent })),
            }))
            .with_topic(PRESENCE_TOPIC);
            self.enqueue_deliver(&sid, env);
        }
    }

    /// Persist channels after membership mutations.
    pub(crate) fn persist_channels(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(self.registry.channels()) {
                warn!("channel store save failed: {:#}", e);
            }
        }
    }

    fn handle_channel_membership(&mut self, conn_id: u64, env: Envelope) {
        let Some(sid) = self.registry.session_id_by_conn(conn_id) else {
            return;
        };
        let sender = self
            .registry
            .session(&sid)
            .map(|s| s.agent.clone())
            .unwrap_or_default();
        match &env.body {
            Body::ChannelJoin(op) => {
                let member = op.member.clone().unwrap_or_else(|| sender.clone());
                self.registry
                    .join_channel(&op.channel, &member, op.visibility, &sender);
                self.persist_channels();
            }
            Body::ChannelLeave(op) => {
                let member = op.member.clone().unwrap_or_else(|| sender.clone());
                self.registry.leave_channel(&op.channel, &member);
                self.persist_channels();
            }
            _ => {}
        }
    }

    /// Direct write on a connection, bypassing delivery queues.
    pub(crate) fn write_conn(&self, conn_id: u64, env: Envelope) {
        if let Some(conn) = self.conns.get(&conn_id) {
            if conn.writer.try_send(env).is_err() {
                debug!(conn_id, "write to connection failed");
            }
        }
    }

    /// Direct write to a session's connection, bypassing delivery queues.
    pub(crate) fn write_session(&self, session_id: &str, env: Envelope) {
        if let Some(session) = self.registry.session(session_id) {
            session.try_write(env);
        }
    }

    pub(crate) fn send_error(
        &mut self,
        conn_id: u64,
        request_id: Option<&str>,
        code: ErrorCode,
        message: &str,
        fatal: bool,
    ) {
        let mut env = Envelope::new(Body::Error(ErrorBody {
            code,
            message: message.to_string(),
            fatal,
        }));
        if let Some(rid) = request_id {
            env.id = rid.to_string();
        }
        self.write_conn(conn_id, env);
    }
}

/// Build the DELIVER counterpart of an accepted SEND or CHANNEL_MESSAGE,
/// preserving the sender's envelope id so recipient dedup holds across
/// replays. The delivery block is stamped at enqueue time.
fn make_deliver(env: &Envelope, original_to: Option<String>) -> Envelope {
    let body = match &env.body {
        Body::Send(message) => Body::Deliver(message.clone()),
        Body::ChannelMessage(message) => Body::ChannelMessage(message.clone()),
        other => other.clone(),
    };
    Envelope {
        v: env.v,
        id: env.id.clone(),
        ts: env.ts,
        to: None,
        from: env.from.clone(),
        topic: env.topic.clone(),
        body,
        payload_meta: env.payload_meta.clone(),
        delivery: Some(Delivery {
            seq: 0,
            session_id: String::new(),
            original_to,
        }),
    }
}

fn rand_nonce() -> u64 {
    use rand::Rng;
    rand::rng().random()
}
