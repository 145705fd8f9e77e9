//! Injection queue: priority-ordered with stable arrival order.
//!
//! URGENT(0) < HIGH(1) < NORMAL(2) < LOW(3); ties keep arrival order via a
//! monotonic counter. Duplicate message ids are suppressed by a bounded
//! dedup ring. Backpressure is a plain refusal at the size bound.

use crate::protocol::QueuedMessage;
use relay_proto::dedup::DedupRing;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Heap entry; reversed ordering turns BinaryHeap into a min-heap on
/// (priority, arrival).
#[derive(Debug)]
struct Entry {
    msg: QueuedMessage,
    arrival: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .msg
            .priority
            .cmp(&self.msg.priority)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    Duplicate,
    Full,
}

struct Inner {
    heap: BinaryHeap<Entry>,
    seen: DedupRing,
    next_arrival: u64,
}

pub struct MessageQueue {
    inner: Mutex<Inner>,
    max_size: usize,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                seen: DedupRing::default(),
                next_arrival: 0,
            }),
            max_size,
            notify: Notify::new(),
        }
    }

    /// Add a message; refuses duplicates and full queues.
    pub async fn enqueue(&self, msg: QueuedMessage) -> EnqueueResult {
        let mut inner = self.inner.lock().await;
        if inner.seen.check(&msg.id) {
            debug!(id = %msg.id, "duplicate message suppressed");
            return EnqueueResult::Duplicate;
        }
        if inner.heap.len() >= self.max_size {
            warn!(
                max = self.max_size,
                id = %msg.id,
                "queue at capacity, refusing message"
            );
            return EnqueueResult::Full;
        }
        let arrival = inner.next_arrival;
        inner.next_arrival += 1;
        inner.heap.push(Entry { msg, arrival });
        drop(inner);
        self.notify.notify_one();
        EnqueueResult::Queued
    }

    /// Take the highest-priority message, or None when empty.
    pub async fn dequeue(&self) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock().await;
        inner.heap.pop().map(|e| e.msg)
    }

    /// Block until a message is available.
    pub async fn wait_and_dequeue(&self) -> QueuedMessage {
        loop {
            // Arm the notification before checking: a message enqueued
            // between the check and the wait must still wake us.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.heap.pop() {
                    return entry.msg;
                }
            }
            notified.await;
        }
    }

    /// Re-queue a message for another attempt. Retries keep their original
    /// priority but take a fresh arrival slot.
    pub async fn retry(&self, mut msg: QueuedMessage) {
        msg.retries += 1;
        let mut inner = self.inner.lock().await;
        let arrival = inner.next_arrival;
        inner.next_arrival += 1;
        inner.heap.push(Entry { msg, arrival });
        drop(inner);
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.heap.is_empty()
    }

    /// Forget every seen id, e.g. on a fresh daemon session.
    pub async fn reset_dedup(&self) {
        self.inner.lock().await.seen.clear();
    }
}
