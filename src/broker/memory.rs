//! In-process broker with the same delivery semantics as the Redis one:
//! at-least-once, shared channel, explicit ack. Released deliveries are
//! requeued immediately with their attempt counter bumped.

use super::{Delivery, DeliverySource, MessageProducer};
use crate::error::BrokerError;
use crate::model::MessageEnvelope;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct Topic {
    ready: VecDeque<Delivery>,
    unacked: HashMap<String, Delivery>,
    /// Every body ever published, in order.
    log: Vec<Vec<u8>>,
    redeliveries: u64,
    max_unacked: usize,
    dead_lettered: Vec<DeadLetter>,
}

/// A dead-lettered message as recorded on the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub origin_id: String,
    pub body: Vec<u8>,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    next_id: u64,
    failing_publishes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail.
    pub async fn fail_next_publishes(&self, n: u32) {
        self.inner.lock().await.failing_publishes = n;
    }

    /// Append a raw body, bypassing envelope serialisation.
    pub async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> String {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("{}-0", inner.next_id);
        let t = inner.topics.entry(topic.to_string()).or_default();
        t.log.push(body.clone());
        t.ready.push_back(Delivery {
            id: id.clone(),
            body,
            attempts: 1,
        });
        drop(inner);
        self.notify.notify_waiters();
        id
    }

    /// Consumer view of `topic` for one channel.
    pub fn source(&self, topic: &str, dead_letter_topic: &str, block: Duration) -> MemorySource {
        MemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            dead_letter_topic: dead_letter_topic.to_string(),
            block,
        }
    }

    pub async fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner.topics.get(topic).map(|t| t.log.clone()).unwrap_or_default()
    }

    pub async fn ready_len(&self, topic: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.topics.get(topic).map(|t| t.ready.len()).unwrap_or(0)
    }

    pub async fn unacked_len(&self, topic: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.topics.get(topic).map(|t| t.unacked.len()).unwrap_or(0)
    }

    /// Highest number of simultaneously unacknowledged deliveries seen.
    pub async fn max_unacked(&self, topic: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.topics.get(topic).map(|t| t.max_unacked).unwrap_or(0)
    }

    /// Dead-letter entries appended to `topic`, oldest first.
    pub async fn dead_letters(&self, topic: &str) -> Vec<DeadLetter> {
        let inner = self.inner.lock().await;
        inner
            .topics
            .get(topic)
            .map(|t| t.dead_lettered.clone())
            .unwrap_or_default()
    }

    pub async fn redeliveries(&self, topic: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner.topics.get(topic).map(|t| t.redeliveries).unwrap_or(0)
    }
}

#[async_trait]
impl MessageProducer for MemoryBroker {
    async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<(), BrokerError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.failing_publishes > 0 {
                inner.failing_publishes -= 1;
                return Err(BrokerError::Rejected("broker unavailable".into()));
            }
        }
        let body = envelope.to_json()?.into_bytes();
        self.publish_raw(topic, body).await;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    broker: MemoryBroker,
    topic: String,
    dead_letter_topic: String,
    block: Duration,
}

impl MemorySource {
    async fn take(&self, max: usize) -> Vec<Delivery> {
        let mut inner = self.broker.inner.lock().await;
        let t = inner.topics.entry(self.topic.clone()).or_default();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(d) = t.ready.pop_front() else { break };
            t.unacked.insert(d.id.clone(), d.clone());
            out.push(d);
        }
        t.max_unacked = t.max_unacked.max(t.unacked.len());
        out
    }
}

#[async_trait]
impl DeliverySource for MemorySource {
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let notified = self.broker.notify.notified();
        let batch = self.take(max).await;
        if !batch.is_empty() {
            return Ok(batch);
        }
        if tokio::time::timeout(self.block, notified).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.take(max).await)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut inner = self.broker.inner.lock().await;
        if let Some(t) = inner.topics.get_mut(&self.topic) {
            t.unacked.remove(&delivery.id);
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        {
            let mut inner = self.broker.inner.lock().await;
            let t = inner.topics.entry(self.topic.clone()).or_default();
            if let Some(mut d) = t.unacked.remove(&delivery.id) {
                d.attempts += 1;
                t.redeliveries += 1;
                t.ready.push_back(d);
            }
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        self.broker
            .publish_raw(&self.dead_letter_topic, delivery.body.clone())
            .await;
        {
            let mut inner = self.broker.inner.lock().await;
            let dlq = inner.topics.entry(self.dead_letter_topic.clone()).or_default();
            dlq.dead_lettered.push(DeadLetter {
                origin_id: delivery.id.clone(),
                body: delivery.body.clone(),
                reason: reason.to_string(),
                attempts: delivery.attempts,
            });
        }
        self.ack(delivery).await
    }
}
