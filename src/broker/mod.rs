//! Message broker seams.
//!
//! `MessageProducer` publishes envelopes to a topic. `DeliverySource` hands
//! out deliveries of one topic to one consumer of a shared channel; a delivery
//! stays unacknowledged until it is acked, released for redelivery, or
//! dead-lettered.

pub mod memory;
pub mod streams;

use crate::error::BrokerError;
use crate::model::MessageEnvelope;
use async_trait::async_trait;

pub use self::memory::{DeadLetter, MemoryBroker};
pub use self::streams::{RedisProducer, RedisStreamSource};

/// A message handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id.
    pub id: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempts: u32,
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Fetch at most `max` deliveries. May wait for a bounded time and return
    /// an empty batch.
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Give up on this attempt; the broker redelivers later.
    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Move the message to the dead-letter topic and acknowledge it.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;
}
