//! Per-recipient delivery queue.
//!
//! Assigns the strictly-increasing per-session `delivery.seq`, tracks
//! sent-but-unacked records as the resume replay buffer, and enforces the
//! client-declared inflight window. Cumulative ACK by seq, optional
//! per-record ACK by id.

use relay_proto::envelope::Envelope;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One delivered-or-deliverable record.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub envelope: Envelope,
    pub seq: u64,
    pub enqueued_at: Instant,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue {
    /// Accepted with this sequence number.
    Accepted(u64),
    /// Inflight window full; producer must back off.
    Busy,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    /// Sent-but-unacked records, oldest first. Doubles as the replay buffer.
    unacked: VecDeque<DeliveryRecord>,
    next_seq: u64,
    last_acked: u64,
    max_inflight: usize,
    replay_max: usize,
    replay_max_age: Duration,
    /// Records aged out of the replay buffer while unacked.
    pub expired_count: u64,
}

impl DeliveryQueue {
    pub fn new(max_inflight: usize, replay_max: usize, replay_max_age: Duration) -> Self {
        Self {
            unacked: VecDeque::new(),
            next_seq: 0,
            last_acked: 0,
            max_inflight: max_inflight.max(1),
            replay_max: replay_max.max(1),
            replay_max_age,
            expired_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    pub fn has_capacity(&self) -> bool {
        self.unacked.len() < self.max_inflight
    }

    /// Stamp the envelope's delivery block and retain it for replay.
    /// The caller writes the returned record's envelope to the session.
    pub fn enqueue(&mut self, mut envelope: Envelope, session_id: &str) -> Enqueue {
        if !self.has_capacity() {
            return Enqueue::Busy;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(delivery) = envelope.delivery.as_mut() {
            delivery.seq = seq;
            delivery.session_id = session_id.to_string();
        } else {
            envelope.delivery = Some(relay_proto::envelope::Delivery {
                seq,
                session_id: session_id.to_string(),
                original_to: None,
            });
        }
        self.unacked.push_back(DeliveryRecord {
            envelope,
            seq,
            enqueued_at: Instant::now(),
        });

        // Count-bound the replay buffer; an overflowing record is delivered
        // but no longer replayable.
        while self.unacked.len() > self.replay_max {
            self.unacked.pop_front();
            self.expired_count += 1;
        }
        Enqueue::Accepted(seq)
    }

    /// Cumulative ACK: drop every record with seq <= `seq`. Returns how many.
    pub fn ack_up_to(&mut self, seq: u64) -> usize {
        let before = self.unacked.len();
        while matches!(self.unacked.front(), Some(rec) if rec.seq <= seq) {
            self.unacked.pop_front();
        }
        if seq > self.last_acked {
            self.last_acked = seq;
        }
        before - self.unacked.len()
    }

    /// Per-record ACK by envelope id.
    pub fn ack_id(&mut self, id: &str) -> bool {
        if let Some(pos) = self.unacked.iter().position(|r| r.envelope.id == id) {
            let rec = self.unacked.remove(pos);
            if let Some(rec) = rec {
                if pos == 0 && rec.seq > self.last_acked {
                    self.last_acked = rec.seq;
                }
            }
            true
        } else {
            false
        }
    }

    /// Records eligible for re-send on resume: everything unacked.
    pub fn replay(&self) -> impl Iterator<Item = &DeliveryRecord> {
        self.unacked.iter()
    }

    /// Most recently enqueued record (stamped and ready to write).
    pub fn last_record(&self) -> Option<&DeliveryRecord> {
        self.unacked.back()
    }

    /// Drain every retained record, e.g. when a session expires and its
    /// unacked traffic falls back to the offline inbox.
    pub fn drain(&mut self) -> Vec<DeliveryRecord> {
        self.unacked.drain(..).collect()
    }

    /// Drop records older than the replay age cap.
    pub fn drop_expired(&mut self, now: Instant) -> usize {
        let max_age = self.replay_max_age;
        let before = self.unacked.len();
        while matches!(
            self.unacked.front(),
            Some(rec) if now.duration_since(rec.enqueued_at) > max_age
        ) {
            self.unacked.pop_front();
            self.expired_count += 1;
        }
        before - self.unacked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::envelope::{Body, Envelope, Message};

    fn deliver(body: &str) -> Envelope {
        Envelope::new(Body::Deliver(Message::text(body)))
    }

    fn queue() -> DeliveryQueue {
        DeliveryQueue::new(4, 100, Duration::from_secs(600))
    }

    #[test]
    fn test_seq_strictly_increasing() {
        let mut q = queue();
        let mut prev = 0;
        for i in 0..4 {
            match q.enqueue(deliver(&format!("m{}", i)), "s-1") {
                Enqueue::Accepted(seq) => {
                    assert!(seq > prev);
                    prev = seq;
                }
                Enqueue::Busy => panic!("unexpected busy"),
            }
        }
    }

    #[test]
    fn test_busy_at_inflight_cap() {
        let mut q = queue();
        for i in 0..4 {
            assert!(matches!(
                q.enqueue(deliver(&format!("m{}", i)), "s-1"),
                Enqueue::Accepted(_)
            ));
        }
        assert_eq!(q.enqueue(deliver("m5"), "s-1"), Enqueue::Busy);

        // Cumulative ACK up to 2 frees room for exactly two more.
        assert_eq!(q.ack_up_to(2), 2);
        assert!(matches!(q.enqueue(deliver("m5"), "s-1"), Enqueue::Accepted(5)));
        assert!(matches!(q.enqueue(deliver("m6"), "s-1"), Enqueue::Accepted(6)));
        assert_eq!(q.enqueue(deliver("m7"), "s-1"), Enqueue::Busy);
    }

    #[test]
    fn test_replay_is_unacked_only() {
        let mut q = queue();
        for i in 0..3 {
            q.enqueue(deliver(&format!("m{}", i)), "s-1");
        }
        q.ack_up_to(1);
        let seqs: Vec<u64> = q.replay().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(q.last_acked(), 1);
    }

    #[test]
    fn test_ack_by_id() {
        let mut q = queue();
        let env = deliver("target");
        let id = env.id.clone();
        q.enqueue(env, "s-1");
        q.enqueue(deliver("other"), "s-1");
        assert!(q.ack_id(&id));
        assert!(!q.ack_id(&id));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_age_expiry() {
        let mut q = DeliveryQueue::new(8, 100, Duration::from_millis(0));
        q.enqueue(deliver("old"), "s-1");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.drop_expired(Instant::now()), 1);
        assert_eq!(q.expired_count, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_delivery_block_stamped() {
        let mut q = queue();
        q.enqueue(deliver("x"), "s-9");
        let rec = q.replay().next().unwrap();
        let delivery = rec.envelope.delivery.as_ref().unwrap();
        assert_eq!(delivery.seq, 1);
        assert_eq!(delivery.session_id, "s-9");
    }
}
