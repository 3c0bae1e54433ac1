//! In-memory queue for single-node deployments and tests

use crate::queue::message::{Message, MessageIdentity};
use crate::queue::{Delivery, QueueTransport};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

struct Envelope {
    ready_at: Instant,
    seq: u64,
    attempts: u32,
    message: Message,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Envelope {}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Envelope {
    // min-heap on readiness, FIFO within the same instant
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then(other.seq.cmp(&self.seq))
    }
}

struct InFlight {
    message: Message,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Envelope>,
    /// Count of queued (not in-flight) envelopes per identity, for dedup
    pending: HashMap<MessageIdentity, usize>,
    in_flight: HashMap<u64, InFlight>,
    next_seq: u64,
    next_handle: u64,
}

/// Delay-ordered in-memory queue.
///
/// Pending messages are deduplicated by identity; redelivery via `nack`
/// bypasses dedup and preserves the attempt counter.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(state: &mut QueueState, message: Message, delay: Duration, attempts: u32) {
        let seq = state.next_seq;
        state.next_seq += 1;
        *state.pending.entry(message.identity()).or_insert(0) += 1;
        state.heap.push(Envelope {
            ready_at: Instant::now() + delay,
            seq,
            attempts,
            message,
        });
    }

    /// Queued plus in-flight message count; used by tests to detect drain.
    pub fn depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.heap.len() + state.in_flight.len()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn push_delayed(&self, message: Message, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        let identity = message.identity();
        if state.pending.get(&identity).copied().unwrap_or(0) > 0 {
            trace!(kind = message.kind_name(), "dropping duplicate message");
            return;
        }
        Self::enqueue(&mut state, message, delay, 0);
    }

    async fn poll(&self) -> Option<Delivery> {
        let mut state = self.state.lock().unwrap();
        let ready = state
            .heap
            .peek()
            .map(|e| e.ready_at <= Instant::now())
            .unwrap_or(false);
        if !ready {
            return None;
        }
        let envelope = state.heap.pop().unwrap();
        let identity = envelope.message.identity();
        if let Some(count) = state.pending.get_mut(&identity) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pending.remove(&identity);
            }
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        let attempts = envelope.attempts + 1;
        state.in_flight.insert(
            handle,
            InFlight {
                message: envelope.message.clone(),
                attempts,
            },
        );
        Some(Delivery {
            message: envelope.message,
            handle,
        })
    }

    async fn ack(&self, delivery: &Delivery) {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&delivery.handle);
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(in_flight) = state.in_flight.remove(&delivery.handle) {
            let attempts = in_flight.attempts;
            Self::enqueue(&mut state, in_flight.message, delay, attempts);
        }
    }

    async fn attempts(&self, delivery: &Delivery) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .in_flight
            .get(&delivery.handle)
            .map(|f| f.attempts)
            .unwrap_or(1)
    }
}
