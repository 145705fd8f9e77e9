//! Server-side session state.
//!
//! One `Session` per authenticated connection (live) or per resumable
//! delivery stream (detached). The routing task owns every session; the
//! connection tasks only hold the writer ends.

use crate::delivery::DeliveryQueue;
use relay_proto::dedup::DedupRing;
use relay_proto::envelope::{self, Capabilities, EntityType, Envelope};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Heartbeat bookkeeping: two missed PONGs tear the session down.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    pub nonce: u64,
    pub missed: u32,
}

#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub resume_token: String,
    pub agent: String,
    pub entity: EntityType,
    pub cli: Option<String>,
    pub capabilities: Capabilities,
    /// Connection currently attached, if any.
    pub conn_id: Option<u64>,
    /// Outbound writer for the attached connection.
    pub writer: Option<mpsc::Sender<Envelope>>,
    pub queue: DeliveryQueue,
    /// Suppresses duplicate inbound SEND ids from this sender.
    pub inbound_dedup: DedupRing,
    pub heartbeat: HeartbeatState,
    pub created_at: Instant,
    /// Set while detached; governs resume eligibility.
    pub detached_at: Option<Instant>,
}

impl Session {
    pub fn new(
        agent: String,
        entity: EntityType,
        cli: Option<String>,
        capabilities: Capabilities,
        conn_id: u64,
        writer: mpsc::Sender<Envelope>,
        queue: DeliveryQueue,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            session_id: format!("s-{}", envelope::new_id()),
            resume_token: envelope::new_token(),
            agent,
            entity,
            cli,
            capabilities,
            conn_id: Some(conn_id),
            writer: Some(writer),
            queue,
            inbound_dedup: DedupRing::new(dedup_capacity),
            heartbeat: HeartbeatState::default(),
            created_at: Instant::now(),
            detached_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.conn_id.is_some()
    }

    /// Detach from a closed connection, keeping the delivery stream
    /// resumable.
    pub fn detach(&mut self) {
        self.conn_id = None;
        self.writer = None;
        self.detached_at = Some(Instant::now());
        self.heartbeat = HeartbeatState::default();
    }

    /// Re-attach a resumed connection.
    pub fn attach(&mut self, conn_id: u64, writer: mpsc::Sender<Envelope>) {
        self.conn_id = Some(conn_id);
        self.writer = Some(writer);
        self.detached_at = None;
        self.heartbeat = HeartbeatState::default();
    }

    /// Whether a detached session is still young enough to resume.
    pub fn resumable(&self, ttl: Duration, now: Instant) -> bool {
        match self.detached_at {
            Some(at) => now.duration_since(at) <= ttl,
            None => false,
        }
    }

    /// Best-effort write to the attached connection.
    pub fn try_write(&self, env: Envelope) -> bool {
        match &self.writer {
            Some(writer) => writer.try_send(env).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::envelope::{Body, Message};

    fn session() -> (Session, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        let queue = DeliveryQueue::new(4, 100, Duration::from_secs(600));
        let s = Session::new(
            "Alice".to_string(),
            EntityType::Agent,
            Some("claude".to_string()),
            Capabilities::default(),
            1,
            tx,
            queue,
            64,
        );
        (s, rx)
    }

    #[test]
    fn test_ids_are_unique() {
        let (a, _rx_a) = session();
        let (b, _rx_b) = session();
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.resume_token, b.resume_token);
        assert!(a.session_id.starts_with("s-"));
    }

    #[test]
    fn test_detach_attach_cycle() {
        let (mut s, _rx) = session();
        assert!(s.is_live());
        s.detach();
        assert!(!s.is_live());
        assert!(s.resumable(Duration::from_secs(60), Instant::now()));
        assert!(!s.resumable(Duration::from_millis(0), Instant::now() + Duration::from_millis(5)));

        let (tx2, _rx2) = mpsc::channel(8);
        s.attach(7, tx2);
        assert!(s.is_live());
        assert_eq!(s.conn_id, Some(7));
    }

    #[tokio::test]
    async fn test_try_write() {
        let (s, mut rx) = session();
        assert!(s.try_write(Envelope::new(Body::Send(Message::text("hi")))));
        assert!(rx.recv().await.is_some());

        let (mut s, _rx) = session();
        s.detach();
        assert!(!s.try_write(Envelope::new(Body::Send(Message::text("hi")))));
    }
}
