//! Registry: sessions, agent records, channels, topics, shadow bindings.
//!
//! Owned exclusively by the routing task. Indexed lookups by name, by
//! connection, by resume token, by channel membership, and by topic
//! subscription. Invariant: at most one live session per agent name.

use crate::session::Session;
use relay_proto::envelope::{
    AgentSnapshot, Envelope, EntityType, InboxEntry, ShadowBinding, Visibility,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Durable agent metadata; survives session churn.
#[derive(Debug)]
pub struct AgentRecord {
    pub name: String,
    pub entity: EntityType,
    pub cli: Option<String>,
    pub task: Option<String>,
    pub working_directory: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub last_seen_ms: u64,
    /// Bounded offline inbox, oldest first.
    pub inbox: VecDeque<Envelope>,
}

impl AgentRecord {
    fn new(name: String, entity: EntityType) -> Self {
        Self {
            name,
            entity,
            cli: None,
            task: None,
            working_directory: None,
            display_name: None,
            avatar_url: None,
            last_seen_ms: relay_proto::envelope::now_ms(),
            inbox: VecDeque::new(),
        }
    }
}

/// A channel definition. Persisted via the channel store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub visibility: Visibility,
    pub members: HashSet<String>,
    pub archived: bool,
    pub created_by: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct Registry {
    /// session_id -> session
    sessions: HashMap<String, Session>,
    /// conn_id -> session_id
    by_conn: HashMap<u64, String>,
    /// agent name -> session_id (live or detached-resumable)
    by_name: HashMap<String, String>,
    /// resume token -> session_id
    by_token: HashMap<String, String>,
    /// agent name -> durable record
    agents: HashMap<String, AgentRecord>,
    /// channel name -> definition
    channels: HashMap<String, Channel>,
    /// topic -> subscribed session ids
    topics: HashMap<String, HashSet<String>>,
    /// primary agent name -> shadow bindings
    shadows: HashMap<String, Vec<ShadowBinding>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- sessions ----------------------------------------------------

    pub fn insert_session(&mut self, session: Session) {
        if let Some(conn_id) = session.conn_id {
            self.by_conn.insert(conn_id, session.session_id.clone());
        }
        self.by_name
            .insert(session.agent.clone(), session.session_id.clone());
        self.by_token
            .insert(session.resume_token.clone(), session.session_id.clone());

        let record = self
            .agents
            .entry(session.agent.clone())
            .or_insert_with(|| AgentRecord::new(session.agent.clone(), session.entity));
        record.entity = session.entity;
        record.cli = session.cli.clone();
        record.last_seen_ms = relay_proto::envelope::now_ms();

        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    pub fn session_by_conn(&self, conn_id: u64) -> Option<&Session> {
        self.by_conn
            .get(&conn_id)
            .and_then(|sid| self.sessions.get(sid))
    }

    pub fn session_id_by_conn(&self, conn_id: u64) -> Option<String> {
        self.by_conn.get(&conn_id).cloned()
    }

    pub fn session_mut_by_conn(&mut self, conn_id: u64) -> Option<&mut Session> {
        let sid = self.by_conn.get(&conn_id)?.clone();
        self.sessions.get_mut(&sid)
    }

    pub fn session_id_by_name(&self, agent: &str) -> Option<String> {
        self.by_name.get(agent).cloned()
    }

    pub fn session_id_by_token(&self, token: &str) -> Option<String> {
        self.by_token.get(token).cloned()
    }

    pub fn live_session_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.is_live())
            .map(|s| s.session_id.clone())
            .collect()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_live()).count()
    }

    /// Attach bookkeeping for a resumed connection.
    pub fn reattach_conn(&mut self, session_id: &str, conn_id: u64) {
        self.by_conn.insert(conn_id, session_id.to_string());
    }

    /// Detach a session from its closed connection, keeping it resumable.
    pub fn detach_conn(&mut self, conn_id: u64) -> Option<String> {
        let sid = self.by_conn.remove(&conn_id)?;
        if let Some(session) = self.sessions.get_mut(&sid) {
            session.detach();
            if let Some(record) = self.agents.get_mut(&session.agent) {
                record.last_seen_ms = relay_proto::envelope::now_ms();
            }
        }
        Some(sid)
    }

    /// Remove a session entirely (BYE, fatal error, or resume GC).
    pub fn remove_session(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if let Some(conn_id) = session.conn_id {
            self.by_conn.remove(&conn_id);
        }
        if self.by_name.get(&session.agent).map(String::as_str) == Some(session_id) {
            self.by_name.remove(&session.agent);
        }
        self.by_token.remove(&session.resume_token);
        for subs in self.topics.values_mut() {
            subs.remove(session_id);
        }
        if let Some(record) = self.agents.get_mut(&session.agent) {
            record.last_seen_ms = relay_proto::envelope::now_ms();
        }
        debug!(agent = %session.agent, session = %session_id, "session removed");
        Some(session)
    }

    /// Detached sessions past the resume TTL.
    pub fn expired_sessions(&self, ttl: std::time::Duration) -> Vec<String> {
        let now = std::time::Instant::now();
        self.sessions
            .values()
            .filter(|s| {
                s.detached_at
                    .map(|at| now.duration_since(at) > ttl)
                    .unwrap_or(false)
            })
            .map(|s| s.session_id.clone())
            .collect()
    }

    // ---- agent records ------------------------------------------------

    pub fn agent(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.get(name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut AgentRecord> {
        self.agents.get_mut(name)
    }

    pub fn upsert_agent(&mut self, name: &str, entity: EntityType) -> &mut AgentRecord {
        self.agents
            .entry(name.to_string())
            .or_insert_with(|| AgentRecord::new(name.to_string(), entity))
    }

    pub fn remove_agent(&mut self, name: &str) -> Option<AgentRecord> {
        for channel in self.channels.values_mut() {
            channel.members.remove(name);
        }
        self.shadows.remove(name);
        for bindings in self.shadows.values_mut() {
            bindings.retain(|b| b.shadow != name);
        }
        self.agents.remove(name)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Store an envelope in an offline inbox, dropping the oldest past
    /// `inbox_max`. Returns false when the oldest was dropped.
    pub fn store_inbox(&mut self, name: &str, env: Envelope, inbox_max: usize) -> bool {
        let record = self
            .agents
            .entry(name.to_string())
            .or_insert_with(|| AgentRecord::new(name.to_string(), EntityType::Agent));
        record.inbox.push_back(env);
        if record.inbox.len() > inbox_max {
            record.inbox.pop_front();
            return false;
        }
        true
    }

    /// Drain an agent's inbox for delivery on connect.
    pub fn drain_inbox(&mut self, name: &str) -> Vec<Envelope> {
        match self.agents.get_mut(name) {
            Some(record) => {
                eprintln!("DEBUG drain_inbox({}) len={}", name, record.inbox.len());
                record.inbox.drain(..).collect()
            }
            None => {
                eprintln!("DEBUG drain_inbox({}) no record", name);
                Vec::new()
            }
        }
    }

    /// Snapshot an inbox without consuming records.
    pub fn inbox_snapshot(&self, name: &str, limit: usize) -> Vec<InboxEntry> {
        let Some(record) = self.agents.get(name) else {
            return Vec::new();
        };
        record
            .inbox
            .iter()
            .rev()
            .take(limit)
            .map(|env| {
                let (body, original_to) = match &env.body {
                    relay_proto::envelope::Body::Deliver(m) => (
                        m.body.clone(),
                        env.delivery.as_ref().and_then(|d| d.original_to.clone()),
                    ),
                    relay_proto::envelope::Body::ChannelMessage(m) => {
                        (m.body.clone(), Some(m.channel.clone()))
                    }
                    _ => (String::new(), None),
                };
                InboxEntry {
                    id: env.id.clone(),
                    from: env.from.clone(),
                    body,
                    ts: env.ts,
                    original_to,
                }
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn agent_snapshots(&self, connected_only: bool) -> Vec<AgentSnapshot> {
        let mut out: Vec<AgentSnapshot> = self
            .agents
            .values()
            .filter_map(|record| {
                let online = self
                    .by_name
                    .get(&record.name)
                    .and_then(|sid| self.sessions.get(sid))
                    .map(|s| s.is_live())
                    .unwrap_or(false);
                if connected_only && !online {
                    return None;
                }
                let channels = self
                    .channels
                    .values()
                    .filter(|c| c.members.contains(&record.name))
                    .map(|c| c.name.clone())
                    .collect();
                Some(AgentSnapshot {
                    name: record.name.clone(),
                    entity: record.entity,
                    cli: record.cli.clone(),
                    task: record.task.clone(),
                    working_directory: record.working_directory.clone(),
                    display_name: record.display_name.clone(),
                    avatar_url: record.avatar_url.clone(),
                    online,
                    last_seen_ms: record.last_seen_ms,
                    channels,
                })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // ---- channels ------------------------------------------------------

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn restore_channels(&mut self, channels: Vec<Channel>) {
        for channel in channels {
            self.channels.insert(channel.name.clone(), channel);
        }
    }

    /// Join (creating on first join). Returns true when membership changed.
    pub fn join_channel(
        &mut self,
        channel: &str,
        member: &str,
        visibility: Option<Visibility>,
        created_by: &str,
    ) -> bool {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| Channel {
                name: channel.to_string(),
                visibility: visibility.unwrap_or_else(|| {
                    if channel.starts_with("dm:") {
                        Visibility::Private
                    } else {
                        Visibility::Public
                    }
                }),
                members: HashSet::new(),
                archived: false,
                created_by: created_by.to_string(),
                created_at_ms: relay_proto::envelope::now_ms(),
            });
        entry.members.insert(member.to_string())
    }

    /// Leave. Returns true when the member was present.
    pub fn leave_channel(&mut self, channel: &str, member: &str) -> bool {
        match self.channels.get_mut(channel) {
            Some(c) => c.members.remove(member),
            None => false,
        }
    }

    pub fn is_member(&self, channel: &str, agent: &str) -> bool {
        self.channels
            .get(channel)
            .map(|c| !c.archived && c.members.contains(agent))
            .unwrap_or(false)
    }

    /// Current members of a channel, excluding one agent.
    pub fn channel_members_except(&self, channel: &str, except: &str) -> Vec<String> {
        match self.channels.get(channel) {
            Some(c) => c
                .members
                .iter()
                .filter(|m| m.as_str() != except)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    // ---- topics --------------------------------------------------------

    pub fn subscribe(&mut self, topic: &str, session_id: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn unsubscribe(&mut self, topic: &str, session_id: &str) {
        if let Some(subs) = self.topics.get_mut(topic) {
            subs.remove(session_id);
            if subs.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Session ids subscribed to a topic.
    pub fn topic_subscribers(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ---- shadows -------------------------------------------------------

    pub fn shadow_bind(&mut self, binding: ShadowBinding) {
        let bindings = self.shadows.entry(binding.primary.clone()).or_default();
        bindings.retain(|b| b.shadow != binding.shadow);
        bindings.push(binding);
    }

    pub fn shadow_unbind(&mut self, primary: &str, shadow: &str) -> bool {
        match self.shadows.get_mut(primary) {
            Some(bindings) => {
                let before = bindings.len();
                bindings.retain(|b| b.shadow != shadow);
                let removed = bindings.len() != before;
                if bindings.is_empty() {
                    self.shadows.remove(primary);
                }
                removed
            }
            None => false,
        }
    }

    /// Shadows bound to a primary, filtered by direction.
    pub fn shadows_of(&self, primary: &str, incoming: bool) -> Vec<String> {
        self.shadows
            .get(primary)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| if incoming { b.receive_incoming } else { b.receive_outgoing })
                    .map(|b| b.shadow.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryQueue;
    use relay_proto::envelope::{Body, Capabilities, Message};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn make_session(name: &str, conn_id: u64) -> Session {
        let (tx, rx) = mpsc::channel(8);
        std::mem::forget(rx);
        Session::new(
            name.to_string(),
            EntityType::Agent,
            None,
            Capabilities::default(),
            conn_id,
            tx,
            DeliveryQueue::new(4, 100, Duration::from_secs(600)),
            64,
        )
    }

    #[test]
    fn test_one_live_session_per_name() {
        let mut reg = Registry::new();
        let s = make_session("Alice", 1);
        let sid = s.session_id.clone();
        reg.insert_session(s);

        assert_eq!(reg.session_id_by_name("Alice"), Some(sid.clone()));
        assert!(reg.session_by_conn(1).is_some());
        assert_eq!(reg.session_count(), 1);

        reg.remove_session(&sid);
        assert!(reg.session_id_by_name("Alice").is_none());
        assert_eq!(reg.session_count(), 0);
        // The durable record survives.
        assert!(reg.agent("Alice").is_some());
    }

    #[test]
    fn test_inbox_bounded_drop_oldest() {
        let mut reg = Registry::new();
        for i in 0..5 {
            let env = Envelope::new(Body::Deliver(Message::text(format!("m{}", i))));
            reg.store_inbox("Bob", env, 3);
        }
        let drained = reg.drain_inbox("Bob");
        assert_eq!(drained.len(), 3);
        // Oldest two dropped.
        match &drained[0].body {
            Body::Deliver(m) => assert_eq!(m.body, "m2"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inbox_snapshot_not_consuming() {
        let mut reg = Registry::new();
        let env = Envelope::new(Body::Deliver(Message::text("kept"))).with_from("Alice");
        reg.store_inbox("Bob", env, 10);
        let snap = reg.inbox_snapshot("Bob", 10);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].body, "kept");
        assert_eq!(reg.inbox_snapshot("Bob", 10).len(), 1);
        assert_eq!(reg.drain_inbox("Bob").len(), 1);
    }

    #[test]
    fn test_channel_membership() {
        let mut reg = Registry::new();
        assert!(reg.join_channel("#general", "Alice", None, "Alice"));
        assert!(reg.join_channel("#general", "Bob", None, "Alice"));
        assert!(!reg.join_channel("#general", "Bob", None, "Alice"));

        assert!(reg.is_member("#general", "Alice"));
        assert!(!reg.is_member("#general", "Carol"));

        let mut members = reg.channel_members_except("#general", "Alice");
        members.sort();
        assert_eq!(members, vec!["Bob"]);

        assert!(reg.leave_channel("#general", "Bob"));
        assert!(!reg.is_member("#general", "Bob"));
    }

    #[test]
    fn test_dm_channels_default_private() {
        let mut reg = Registry::new();
        reg.join_channel("dm:alice-bob", "Alice", None, "Alice");
        assert_eq!(
            reg.channel("dm:alice-bob").unwrap().visibility,
            Visibility::Private
        );
    }

    #[test]
    fn test_topics() {
        let mut reg = Registry::new();
        reg.subscribe("deploys", "s-1");
        reg.subscribe("deploys", "s-2");
        reg.unsubscribe("deploys", "s-1");
        assert_eq!(reg.topic_subscribers("deploys"), vec!["s-2"]);
        reg.unsubscribe("deploys", "s-2");
        assert!(reg.topic_subscribers("deploys").is_empty());
    }

    #[test]
    fn test_shadow_bindings() {
        let mut reg = Registry::new();
        reg.shadow_bind(ShadowBinding {
            primary: "Alice".to_string(),
            shadow: "Watcher".to_string(),
            receive_incoming: true,
            receive_outgoing: false,
            speak_on: Vec::new(),
        });
        assert_eq!(reg.shadows_of("Alice", true), vec!["Watcher"]);
        assert!(reg.shadows_of("Alice", false).is_empty());

        assert!(reg.shadow_unbind("Alice", "Watcher"));
        assert!(reg.shadows_of("Alice", true).is_empty());
        assert!(!reg.shadow_unbind("Alice", "Watcher"));
    }

    #[test]
    fn test_remove_agent_scrubs_memberships() {
        let mut reg = Registry::new();
        reg.join_channel("#general", "Alice", None, "Alice");
        reg.shadow_bind(ShadowBinding {
            primary: "Bob".to_string(),
            shadow: "Alice".to_string(),
            receive_incoming: true,
            receive_outgoing: false,
            speak_on: Vec::new(),
        });
        reg.upsert_agent("Alice", EntityType::Agent);
        reg.remove_agent("Alice");
        assert!(!reg.is_member("#general", "Alice"));
        assert!(reg.shadows_of("Bob", true).is_empty());
        assert!(reg.agent("Alice").is_none());
    }
}
