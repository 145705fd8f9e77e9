//! Wrapper-side types: queued terminal messages, CLI quirks, configuration.

use relay_proto::envelope::{Body, Envelope, SyncMeta};
use serde_json::Value;
use std::time::Instant;

/// Injection priority, derived from message importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// importance >= 90 -> URGENT, >= 70 -> HIGH, >= 30 -> NORMAL, else LOW.
    pub fn from_importance(importance: Option<u8>) -> Self {
        match importance {
            Some(i) if i >= 90 => Self::Urgent,
            Some(i) if i >= 70 => Self::High,
            Some(i) if i >= 30 => Self::Normal,
            Some(_) => Self::Low,
            None => Self::Normal,
        }
    }
}

/// One relay message waiting to be typed into the terminal.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub from: String,
    pub body: String,
    pub thread: Option<String>,
    pub importance: Option<u8>,
    /// Channel or broadcast the message originally addressed.
    pub original_to: Option<String>,
    pub data: Option<Value>,
    /// Present on blocking sync sends; answered after injection settles.
    pub sync: Option<SyncMeta>,
    /// Delivery seq on the daemon session, for explicit ACKs.
    pub seq: Option<u64>,
    pub priority: Priority,
    pub retries: u32,
    pub queued_at: Instant,
}

impl QueuedMessage {
    pub fn new(id: String, from: String, body: String, importance: Option<u8>) -> Self {
        Self {
            id,
            from,
            body,
            thread: None,
            importance,
            original_to: None,
            data: None,
            sync: None,
            seq: None,
            priority: Priority::from_importance(importance),
            retries: 0,
            queued_at: Instant::now(),
        }
    }

    /// Build from a DELIVER envelope; None for non-message deliveries.
    pub fn from_delivery(env: &Envelope) -> Option<Self> {
        let (body_text, channel, data) = match &env.body {
            Body::Deliver(m) => (
                m.body.clone(),
                env.delivery.as_ref().and_then(|d| d.original_to.clone()),
                m.data.clone(),
            ),
            Body::ChannelMessage(m) => (m.body.clone(), Some(m.channel.clone()), m.data.clone()),
            _ => return None,
        };
        let meta = env.payload_meta.as_ref();
        let importance = meta.and_then(|m| m.importance);
        let sync = meta.and_then(|m| m.sync.clone());
        // Sync requests always jump the queue: their ACKs block a remote
        // waiter.
        let priority = if sync.as_ref().map(|s| s.blocking).unwrap_or(false) {
            Priority::Urgent
        } else {
            Priority::from_importance(importance)
        };
        Some(Self {
            id: env.id.clone(),
            from: env.from.clone().unwrap_or_else(|| "relay".to_string()),
            body: body_text,
            thread: meta.and_then(|m| m.thread.clone()),
            importance,
            original_to: channel,
            data,
            sync,
            seq: env.delivery.as_ref().map(|d| d.seq),
            priority,
            retries: 0,
            queued_at: Instant::now(),
        })
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    /// Format for injection. Idempotent: an already-formatted body comes
    /// back unchanged so re-delivery can never double-wrap. Retries add an
    /// escalating prefix.
    pub fn format_for_injection(&self) -> String {
        if is_formatted(&self.body) {
            return self.body.clone();
        }
        let mut tags = format!("[{}]", self.short_id());
        if let Some(thread) = &self.thread {
            tags.push_str(&format!("[thread:{}]", thread));
        }
        if let Some(importance) = self.importance {
            tags.push_str(&format!("[importance:{}]", importance));
        }
        if let Some(channel) = &self.original_to {
            if channel != "*" {
                tags.push_str(&format!("[{}]", channel));
            }
        }
        let base = format!("Relay message from {} {}: {}", self.from, tags, self.body);
        match self.retries {
            0 => base,
            1 => format!("[RETRY] {}", base),
            _ => format!("[URGENT - PLEASE ACKNOWLEDGE] {}", base),
        }
    }

    /// The substring verification looks for in the terminal echo.
    pub fn verification_marker(&self) -> String {
        format!("Relay message from {} [{}]", self.from, self.short_id())
    }
}

/// Whether a body already carries the injection wrapper.
pub fn is_formatted(body: &str) -> bool {
    let body = body
        .trim_start_matches("[RETRY] ")
        .trim_start_matches("[URGENT - PLEASE ACKNOWLEDGE] ");
    body.starts_with("Relay message from ")
}

/// Known CLI families and their terminal quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliKind {
    Claude,
    Codex,
    Gemini,
    Cursor,
    Shell,
    Other,
}

impl CliKind {
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("claude") {
            Self::Claude
        } else if name.contains("codex") {
            Self::Codex
        } else if name.contains("gemini") {
            Self::Gemini
        } else if name.contains("cursor") {
            Self::Cursor
        } else if matches!(name.as_str(), "sh" | "bash" | "zsh" | "fish") {
            Self::Shell
        } else {
            Self::Other
        }
    }

    /// Default prompt regex for idle detection.
    pub fn prompt_pattern(&self) -> &'static str {
        match self {
            Self::Claude => r"^[>›] $",
            Self::Codex => r"^(codex)?> $",
            Self::Gemini => r"^>{1,3} $",
            Self::Cursor => r"^> $",
            Self::Shell | Self::Other => r"^[>$%#] $",
        }
    }

    /// Whether injected text should be wrapped in bracketed-paste markers.
    pub fn bracketed_paste(&self) -> bool {
        matches!(self, Self::Claude | Self::Codex | Self::Cursor)
    }

    /// Gemini misreads bare words as shell keywords; backtick the body.
    pub fn backtick_body(&self) -> bool {
        matches!(self, Self::Gemini)
    }
}

/// Wrapper configuration, assembled from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent name announced to the daemon.
    pub name: String,
    /// CLI family being wrapped.
    pub cli: CliKind,
    /// Prompt regex for idle detection.
    pub prompt_pattern: String,
    /// Silence needed before the terminal counts as idle.
    pub min_silence_ms: u64,
    /// Idle confidence needed before a non-urgent injection.
    pub confidence_threshold: f64,
    /// Queue bound before backpressure.
    pub queue_max: usize,
    /// Injection retry ceiling.
    pub max_retries: u32,
    /// Base delay between retries (linear backoff).
    pub retry_delay_ms: u64,
    /// Delay between writing the message and pressing ENTER.
    pub enter_delay_ms: u64,
    /// How long to poll for the injected echo.
    pub verification_timeout_ms: u64,
    /// Trust the write instead of verifying the echo.
    pub skip_verification: bool,
    /// Emit parsed commands as JSON on stderr.
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            cli: CliKind::Other,
            prompt_pattern: r"^[>$%#] $".to_string(),
            min_silence_ms: 1500,
            confidence_threshold: 0.7,
            queue_max: 50,
            max_retries: 3,
            retry_delay_ms: 300,
            enter_delay_ms: 50,
            verification_timeout_ms: 2000,
            skip_verification: false,
            json_output: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_from_importance() {
        assert_eq!(Priority::from_importance(Some(95)), Priority::Urgent);
        assert_eq!(Priority::from_importance(Some(90)), Priority::Urgent);
        assert_eq!(Priority::from_importance(Some(70)), Priority::High);
        assert_eq!(Priority::from_importance(Some(50)), Priority::Normal);
        assert_eq!(Priority::from_importance(Some(10)), Priority::Low);
        assert_eq!(Priority::from_importance(None), Priority::Normal);
    }

    #[test]
    fn test_format_basic() {
        let msg = QueuedMessage::new(
            "abcdef1234567890".to_string(),
            "Dashboard".to_string(),
            "check status".to_string(),
            None,
        );
        assert_eq!(
            msg.format_for_injection(),
            "Relay message from Dashboard [abcdef12]: check status"
        );
        assert_eq!(
            msg.verification_marker(),
            "Relay message from Dashboard [abcdef12]"
        );
    }

    #[test]
    fn test_format_with_tags() {
        let mut msg = QueuedMessage::new(
            "abcdef1234567890".to_string(),
            "Alice".to_string(),
            "deploy now".to_string(),
            Some(95),
        );
        msg.thread = Some("hotfix".to_string());
        msg.original_to = Some("#ops".to_string());
        assert_eq!(
            msg.format_for_injection(),
            "Relay message from Alice [abcdef12][thread:hotfix][importance:95][#ops]: deploy now"
        );
    }

    #[test]
    fn test_format_idempotent() {
        let first = QueuedMessage::new(
            "abcdef1234567890".to_string(),
            "Bob".to_string(),
            "hello".to_string(),
            None,
        );
        let once = first.format_for_injection();
        let rewrapped = QueuedMessage::new(
            "ffffffff00000000".to_string(),
            "Bob".to_string(),
            once.clone(),
            None,
        );
        assert_eq!(rewrapped.format_for_injection(), once);
    }

    #[test]
    fn test_retry_escalation() {
        let mut msg = QueuedMessage::new(
            "abcdef1234567890".to_string(),
            "Alice".to_string(),
            "important".to_string(),
            None,
        );
        let base = msg.format_for_injection();
        msg.retries = 1;
        assert_eq!(msg.format_for_injection(), format!("[RETRY] {}", base));
        msg.retries = 2;
        assert_eq!(
            msg.format_for_injection(),
            format!("[URGENT - PLEASE ACKNOWLEDGE] {}", base)
        );
        msg.retries = 5;
        assert_eq!(
            msg.format_for_injection(),
            format!("[URGENT - PLEASE ACKNOWLEDGE] {}", base)
        );
    }

    #[test]
    fn test_from_delivery() {
        use relay_proto::envelope::{Delivery, Message, PayloadMeta};
        let mut env = Envelope::new(Body::Deliver(Message::text("do the thing")))
            .with_from("Alice")
            .with_meta(PayloadMeta {
                importance: Some(80),
                thread: Some("t1".to_string()),
                ..Default::default()
            });
        env.delivery = Some(Delivery {
            seq: 9,
            session_id: "s-1".to_string(),
            original_to: Some("#general".to_string()),
        });

        let msg = QueuedMessage::from_delivery(&env).unwrap();
        assert_eq!(msg.from, "Alice");
        assert_eq!(msg.seq, Some(9));
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.original_to.as_deref(), Some("#general"));
        assert_eq!(msg.thread.as_deref(), Some("t1"));
    }

    #[test]
    fn test_sync_delivery_is_urgent() {
        use relay_proto::envelope::{Message, PayloadMeta, SyncMeta};
        let env = Envelope::new(Body::Deliver(Message::text("ping")))
            .with_from("Alice")
            .with_meta(PayloadMeta {
                sync: Some(SyncMeta {
                    correlation_id: "k".to_string(),
                    blocking: true,
                    timeout_ms: 1000,
                }),
                ..Default::default()
            });
        let msg = QueuedMessage::from_delivery(&env).unwrap();
        assert_eq!(msg.priority, Priority::Urgent);
    }

    #[test]
    fn test_cli_kind_quirks() {
        assert_eq!(CliKind::from_name("claude"), CliKind::Claude);
        assert_eq!(CliKind::from_name("/usr/bin/codex"), CliKind::Codex);
        assert_eq!(CliKind::from_name("bash"), CliKind::Shell);
        assert!(CliKind::Claude.bracketed_paste());
        assert!(!CliKind::Gemini.bracketed_paste());
        assert!(CliKind::Gemini.backtick_body());
    }
}
