//! Request broker: one correlation table for every waiter kind.
//!
//! Sync-ack waits, reply-to chains, and spawn-readiness all collapse into a
//! single map keyed by (kind, correlation id), swept by one expiry tick.
//! On session disconnect every entry owned by that session fails with a
//! disconnect cause.

use std::collections::HashMap;
use std::time::Instant;

/// What a correlation id is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaiterKind {
    /// A blocking SEND waiting for an ACK carrying the correlation id.
    SyncAck,
    /// A request SEND waiting for a reply-to SEND.
    ReplyTo,
    /// A SPAWN waiting for the new agent's AGENT_READY.
    SpawnReady,
}

/// A registered waiter. The router interprets `data` per kind (e.g. the
/// original SPAWN request id).
#[derive(Debug, Clone)]
pub struct Waiter {
    pub kind: WaiterKind,
    pub correlation_id: String,
    /// Session that owns the wait and receives the failure on timeout.
    pub owner_session: String,
    pub deadline: Instant,
    /// Kind-specific context (request envelope id for SpawnReady).
    pub data: Option<String>,
}

#[derive(Debug, Default)]
pub struct Broker {
    waiters: HashMap<(WaiterKind, String), Waiter>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn register(&mut self, waiter: Waiter) {
        self.waiters
            .insert((waiter.kind, waiter.correlation_id.clone()), waiter);
    }

    /// Complete and remove a waiter, returning it for the router to act on.
    pub fn resolve(&mut self, kind: WaiterKind, correlation_id: &str) -> Option<Waiter> {
        self.waiters.remove(&(kind, correlation_id.to_string()))
    }

    /// Remove expired entries; returns them so timeouts surface to owners.
    pub fn sweep(&mut self, now: Instant) -> Vec<Waiter> {
        let expired: Vec<(WaiterKind, String)> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.waiters.remove(&k))
            .collect()
    }

    /// Remove every waiter owned by a disconnecting session.
    pub fn fail_session(&mut self, session_id: &str) -> Vec<Waiter> {
        let owned: Vec<(WaiterKind, String)> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.owner_session == session_id)
            .map(|(k, _)| k.clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|k| self.waiters.remove(&k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn waiter(kind: WaiterKind, cid: &str, owner: &str, ttl: Duration) -> Waiter {
        Waiter {
            kind,
            correlation_id: cid.to_string(),
            owner_session: owner.to_string(),
            deadline: Instant::now() + ttl,
            data: None,
        }
    }

    #[test]
    fn test_resolve_removes() {
        let mut broker = Broker::new();
        broker.register(waiter(WaiterKind::SyncAck, "k", "s-1", Duration::from_secs(1)));
        assert!(broker.resolve(WaiterKind::SyncAck, "k").is_some());
        assert!(broker.resolve(WaiterKind::SyncAck, "k").is_none());
        assert!(broker.is_empty());
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let mut broker = Broker::new();
        broker.register(waiter(WaiterKind::SyncAck, "k", "s-1", Duration::from_secs(1)));
        broker.register(waiter(WaiterKind::ReplyTo, "k", "s-1", Duration::from_secs(1)));
        assert_eq!(broker.len(), 2);
        assert!(broker.resolve(WaiterKind::ReplyTo, "k").is_some());
        assert!(broker.resolve(WaiterKind::SyncAck, "k").is_some());
    }

    #[test]
    fn test_sweep_expires_only_past_deadline() {
        let mut broker = Broker::new();
        broker.register(waiter(WaiterKind::SyncAck, "old", "s-1", Duration::from_millis(0)));
        broker.register(waiter(WaiterKind::SyncAck, "new", "s-1", Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(2));
        let expired = broker.sweep(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id, "old");
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn test_fail_session_removes_owned_only() {
        let mut broker = Broker::new();
        broker.register(waiter(WaiterKind::SyncAck, "a", "s-1", Duration::from_secs(60)));
        broker.register(waiter(WaiterKind::ReplyTo, "b", "s-2", Duration::from_secs(60)));
        let failed = broker.fail_session("s-1");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].correlation_id, "a");
        assert_eq!(broker.len(), 1);
    }
}
