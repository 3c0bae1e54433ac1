//! Queue transport contract and in-memory implementation

pub mod memory;
pub mod message;

pub use memory::MemoryQueue;
pub use message::{Message, MessageIdentity, MessageKind};

use async_trait::async_trait;
use std::time::Duration;

/// An in-flight delivery, acknowledged or redelivered exactly once.
/// `handle` is the transport's opaque receipt for this delivery.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    pub handle: u64,
}

/// A durable, at-least-once message queue with delayed delivery.
///
/// Implementations must redeliver unacknowledged messages and maintain a
/// per-delivery attempt counter. Duplicate deliveries are expected; the
/// handlers absorb them.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a message for immediate delivery.
    async fn push(&self, message: Message) {
        self.push_delayed(message, Duration::ZERO).await;
    }

    /// Enqueue a message to become deliverable after `delay`.
    async fn push_delayed(&self, message: Message, delay: Duration);

    /// Take the next ready message, if any.
    async fn poll(&self) -> Option<Delivery>;

    /// Acknowledge successful handling.
    async fn ack(&self, delivery: &Delivery);

    /// Return the message to the queue, deliverable again after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration);

    /// Times this delivery's message has been delivered, this one included.
    async fn attempts(&self, delivery: &Delivery) -> u32;
}
