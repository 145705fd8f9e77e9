//! Envelope types for the relay wire protocol.
//!
//! One envelope per frame. The `type` tag and `payload` decode together into
//! the [`Body`] enum so every payload shape is validated once, at the frame
//! boundary.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, carried as `v` on every envelope.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default inflight window when a client declares no `max_inflight`.
pub const DEFAULT_MAX_INFLIGHT: usize = 256;

/// One framed protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub v: u16,
    /// Unique, client-generated, opaque id.
    pub id: String,
    /// Milliseconds since epoch. Not monotonic per sender; never used for ordering.
    pub ts: u64,
    /// Routing target: agent name, `*`, `#channel`, or a reserved `_` name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Originating agent name. Server-stamped on DELIVER.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Topic routing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Type tag plus typed payload.
    #[serde(flatten)]
    pub body: Body,
    /// Sync/importance/reply-to hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<PayloadMeta>,
    /// Server-assigned delivery block on DELIVER envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Delivery>,
}

impl Envelope {
    /// Build an envelope with a fresh id and timestamp.
    pub fn new(body: Body) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: new_id(),
            ts: now_ms(),
            to: None,
            from: None,
            topic: None,
            body,
            payload_meta: None,
            delivery: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_meta(mut self, meta: PayloadMeta) -> Self {
        self.payload_meta = Some(meta);
        self
    }

    /// Wire tag of this envelope's body, e.g. `"CHANNEL_MESSAGE"`.
    pub fn type_tag(&self) -> &'static str {
        self.body.type_tag()
    }
}

/// Type tag + payload, adjacently tagged on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    Hello(Hello),
    Welcome(Welcome),
    Bye,
    Ping(Heartbeat),
    Pong(Heartbeat),
    Send(Message),
    Deliver(Message),
    Ack(Ack),
    Subscribe(TopicRef),
    Unsubscribe(TopicRef),
    ChannelJoin(ChannelOp),
    ChannelLeave(ChannelOp),
    ChannelMessage(ChannelMessage),
    ShadowBind(ShadowBinding),
    ShadowUnbind(ShadowBinding),
    Log(LogLine),
    Spawn(SpawnRequest),
    SpawnResult(SpawnResult),
    Release(ReleaseRequest),
    ReleaseResult(ReleaseResult),
    AgentReady(AgentReady),
    Status,
    StatusResponse(StatusReport),
    ListAgents,
    ListAgentsResponse(AgentList),
    ListConnectedAgents,
    ListConnectedAgentsResponse(AgentList),
    Inbox(InboxQuery),
    InboxResponse(InboxSnapshot),
    Health,
    HealthResponse(HealthReport),
    Metrics,
    MetricsResponse(MetricsReport),
    RemoveAgent(RemoveAgent),
    RemoveAgentResponse(OpResult),
    Error(ErrorBody),
    Busy(Busy),
}

impl Body {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Welcome(_) => "WELCOME",
            Self::Bye => "BYE",
            Self::Ping(_) => "PING",
            Self::Pong(_) => "PONG",
            Self::Send(_) => "SEND",
            Self::Deliver(_) => "DELIVER",
            Self::Ack(_) => "ACK",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::ChannelJoin(_) => "CHANNEL_JOIN",
            Self::ChannelLeave(_) => "CHANNEL_LEAVE",
            Self::ChannelMessage(_) => "CHANNEL_MESSAGE",
            Self::ShadowBind(_) => "SHADOW_BIND",
            Self::ShadowUnbind(_) => "SHADOW_UNBIND",
            Self::Log(_) => "LOG",
            Self::Spawn(_) => "SPAWN",
            Self::SpawnResult(_) => "SPAWN_RESULT",
            Self::Release(_) => "RELEASE",
            Self::ReleaseResult(_) => "RELEASE_RESULT",
            Self::AgentReady(_) => "AGENT_READY",
            Self::Status => "STATUS",
            Self::StatusResponse(_) => "STATUS_RESPONSE",
            Self::ListAgents => "LIST_AGENTS",
            Self::ListAgentsResponse(_) => "LIST_AGENTS_RESPONSE",
            Self::ListConnectedAgents => "LIST_CONNECTED_AGENTS",
            Self::ListConnectedAgentsResponse(_) => "LIST_CONNECTED_AGENTS_RESPONSE",
            Self::Inbox(_) => "INBOX",
            Self::InboxResponse(_) => "INBOX_RESPONSE",
            Self::Health => "HEALTH",
            Self::HealthResponse(_) => "HEALTH_RESPONSE",
            Self::Metrics => "METRICS",
            Self::MetricsResponse(_) => "METRICS_RESPONSE",
            Self::RemoveAgent(_) => "REMOVE_AGENT",
            Self::RemoveAgentResponse(_) => "REMOVE_AGENT_RESPONSE",
            Self::Error(_) => "ERROR",
            Self::Busy(_) => "BUSY",
        }
    }
}

/// Connected entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    #[default]
    Agent,
    User,
}

/// Capabilities a client declares at HELLO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Client acknowledges deliveries.
    #[serde(default)]
    pub ack: bool,
    /// Client stores a resume token and replays on reconnect.
    #[serde(default)]
    pub resume: bool,
    /// Delivered-but-unacked window the server may push.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Client understands topic-routed DELIVERs.
    #[serde(default)]
    pub supports_topics: bool,
}

fn default_max_inflight() -> usize {
    DEFAULT_MAX_INFLIGHT
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            ack: true,
            resume: true,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            supports_topics: false,
        }
    }
}

/// Prior-session handle presented at HELLO for resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRef {
    pub resume_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// HELLO payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub agent: String,
    #[serde(default)]
    pub entity: EntityType,
    /// Declared CLI kind ("claude", "codex", "gemini", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,
}

/// Limits the server declares at WELCOME.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub max_frame_bytes: usize,
    pub heartbeat_ms: u64,
}

/// WELCOME payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: String,
    pub resume_token: String,
    pub server: ServerInfo,
    /// True when the session continued a prior delivery stream.
    #[serde(default)]
    pub resumed: bool,
}

/// PING/PONG payload; the client mirrors the nonce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Heartbeat {
    pub nonce: u64,
}

/// SEND/DELIVER payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Payload kind; "message" unless a richer shape is carried in `data`.
    #[serde(default = "default_message_kind")]
    pub kind: String,
    pub body: String,
    /// Structured side-channel data (correlation ids, attachments, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn default_message_kind() -> String {
    "message".to_string()
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: default_message_kind(),
            body: body.into(),
            data: None,
        }
    }
}

/// ACK payload. `seq` acknowledges cumulatively; `ack_id` one record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
    /// Resolves a blocking sync SEND waiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Response blob handed to the sync waiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

/// SUBSCRIBE/UNSUBSCRIBE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicRef {
    pub topic: String,
}

/// Channel visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// CHANNEL_JOIN/CHANNEL_LEAVE payload. `member` is set for admin ops on
/// another agent's membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOp {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
}

/// CHANNEL_MESSAGE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// SHADOW_BIND/SHADOW_UNBIND payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowBinding {
    pub primary: String,
    pub shadow: String,
    /// Copy DELIVERs addressed to the primary.
    #[serde(default = "default_true")]
    pub receive_incoming: bool,
    /// Copy SENDs originated by the primary.
    #[serde(default)]
    pub receive_outgoing: bool,
    /// Trigger phrases on which the shadow is expected to speak.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speak_on: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// LOG payload: one agent log line for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub line: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// SPAWN payload, delegated to the launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub name: String,
    pub cli: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_of: Option<String>,
    /// Hold SPAWN_RESULT until the new session emits AGENT_READY.
    #[serde(default)]
    pub await_ready: bool,
}

/// SPAWN_RESULT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResult {
    pub ok: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Set when SPAWN asked to await readiness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RELEASE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub name: String,
}

/// RELEASE_RESULT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub ok: bool,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// AGENT_READY payload, emitted when a session finishes bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReady {
    pub agent: String,
}

/// STATUS_RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_ms: u64,
    pub session_count: usize,
    pub agent_count: usize,
    pub channel_count: usize,
    pub queued_total: usize,
    pub version: String,
}

/// One agent row in LIST_AGENTS_RESPONSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub name: String,
    pub entity: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub online: bool,
    pub last_seen_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

/// LIST_AGENTS_RESPONSE / LIST_CONNECTED_AGENTS_RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentList {
    pub agents: Vec<AgentSnapshot>,
}

/// INBOX query payload. `agent` defaults to the requester.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InboxQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One retained offline record in INBOX_RESPONSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub body: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_to: Option<String>,
}

/// INBOX_RESPONSE payload: a snapshot; records are not consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxSnapshot {
    pub agent: String,
    pub total: usize,
    pub messages: Vec<InboxEntry>,
}

/// HEALTH_RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub ok: bool,
    pub uptime_ms: u64,
}

/// METRICS_RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsReport {
    pub routed: u64,
    pub delivered: u64,
    pub acked: u64,
    pub busy: u64,
    pub dropped: u64,
    pub inbox_stored: u64,
    pub sessions_opened: u64,
    pub sessions_resumed: u64,
    pub protocol_errors: u64,
}

/// REMOVE_AGENT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAgent {
    pub name: String,
}

/// Generic ok/error result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// ERROR payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub fatal: bool,
}

/// BUSY payload: soft backpressure, retry after a delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Busy {
    /// Recipient whose inflight window is full.
    pub to: String,
    pub queue_depth: usize,
    pub retry_after_ms: u64,
}

/// Sync/importance/reply-to hints on SEND.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PayloadMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
}

/// Blocking request/response hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMeta {
    pub correlation_id: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

/// Server-assigned delivery block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Strictly increasing per recipient session.
    pub seq: u64,
    pub session_id: String,
    /// `*`, `#channel`, or topic the SEND originally addressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_to: Option<String>,
}

/// Reserved target prefix; handled by server plugins, never routed to agents.
pub const RESERVED_PREFIX: char = '_';

/// Whether a routing target names a channel.
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with('#') || target.starts_with("dm:")
}

/// Whether a routing target is reserved for server plugins.
pub fn is_reserved_name(target: &str) -> bool {
    target.starts_with(RESERVED_PREFIX)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a fresh opaque envelope id (16 hex chars).
pub fn new_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let n: u64 = rng.random();
    format!("{:016x}", n)
}

/// Generate an opaque resume token (32 hex chars).
pub fn new_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let a: u64 = rng.random();
    let b: u64 = rng.random();
    format!("{:016x}{:016x}", a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_round_trip() {
        let env = Envelope::new(Body::Send(Message::text("hi")))
            .with_to("*")
            .with_from("Alice");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"SEND\""));
        assert!(json.contains("\"to\":\"*\""));
        assert!(json.contains("\"body\":\"hi\""));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        match back.body {
            Body::Send(msg) => assert_eq!(msg.body, "hi"),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_unit_variant_round_trip() {
        let env = Envelope::new(Body::Status);
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"STATUS\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.body, Body::Status));
    }

    #[test]
    fn test_hello_defaults() {
        let json = r#"{"v":1,"id":"a","ts":0,"type":"HELLO","payload":{"agent":"Alice"}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        match env.body {
            Body::Hello(hello) => {
                assert_eq!(hello.agent, "Alice");
                assert_eq!(hello.entity, EntityType::Agent);
                assert_eq!(hello.capabilities.max_inflight, DEFAULT_MAX_INFLIGHT);
                assert!(hello.session.is_none());
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_deliver_carries_delivery_block() {
        let mut env = Envelope::new(Body::Deliver(Message::text("yo"))).with_from("Bob");
        env.delivery = Some(Delivery {
            seq: 7,
            session_id: "s-1".to_string(),
            original_to: Some("#general".to_string()),
        });
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        let delivery = back.delivery.unwrap();
        assert_eq!(delivery.seq, 7);
        assert_eq!(delivery.original_to.as_deref(), Some("#general"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"v":1,"id":"a","ts":0,"type":"NOPE","payload":{}}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn test_sync_meta_round_trip() {
        let meta = PayloadMeta {
            sync: Some(SyncMeta {
                correlation_id: "k".to_string(),
                blocking: true,
                timeout_ms: 1000,
            }),
            ..Default::default()
        };
        let env = Envelope::new(Body::Send(Message::text("ping")))
            .with_to("Bob")
            .with_meta(meta);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        let sync = back.payload_meta.unwrap().sync.unwrap();
        assert_eq!(sync.correlation_id, "k");
        assert!(sync.blocking);
        assert_eq!(sync.timeout_ms, 1000);
    }

    #[test]
    fn test_name_classifiers() {
        assert!(is_channel_name("#general"));
        assert!(is_channel_name("dm:alice-bob"));
        assert!(!is_channel_name("Bob"));
        assert!(is_reserved_name("_consensus"));
        assert!(!is_reserved_name("carol"));
    }

    #[test]
    fn test_new_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_id(), id);
    }
}
