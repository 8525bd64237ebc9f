//! Redis Streams broker.
//!
//! A topic is a stream key, a channel is a consumer group. Unacknowledged
//! entries stay in the group's pending list and are claimed again once they
//! have been idle for the redelivery timeout.

use super::{Delivery, DeliverySource, MessageProducer};
use crate::config;
use crate::error::BrokerError;
use crate::model::MessageEnvelope;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisResult};
use tracing::{debug, info, instrument, warn};

const PAYLOAD_FIELD: &str = "payload";

/// Publishes envelopes with `XADD`. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct RedisProducer {
    client: Client,
}

impl RedisProducer {
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            client: Client::open(url)?,
        })
    }
}

#[async_trait]
impl MessageProducer for RedisProducer {
    #[instrument(skip(self, envelope), fields(tracking_id = envelope.tracking_id))]
    async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<(), BrokerError> {
        let body = envelope.to_json()?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let id: String = conn.xadd(topic, "*", &[(PAYLOAD_FIELD, body)]).await?;
        debug!(topic, message_id = %id, "published envelope");
        Ok(())
    }
}

/// Settings for one consumer of a channel.
#[derive(Debug, Clone)]
pub struct StreamSourceConfig {
    pub url: String,
    pub topic: String,
    pub channel: String,
    pub consumer_name: String,
    pub dead_letter_topic: String,
    pub block_ms: u64,
    pub redelivery_timeout_ms: u64,
}

impl StreamSourceConfig {
    pub fn from_broker(broker: &config::Broker) -> Self {
        let consumer_name = broker
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("mailer-{}", uuid::Uuid::new_v4()));
        Self {
            url: broker.url.clone(),
            topic: broker.topic.clone(),
            channel: broker.channel.clone(),
            consumer_name,
            dead_letter_topic: broker.dead_letter_topic(),
            block_ms: broker.block_ms,
            redelivery_timeout_ms: broker.redelivery_timeout_ms,
        }
    }
}

/// Consumer-group reader over one stream.
pub struct RedisStreamSource {
    conn: MultiplexedConnection,
    config: StreamSourceConfig,
}

impl RedisStreamSource {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(config: StreamSourceConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let source = Self { conn, config };
        source.ensure_group().await?;
        Ok(source)
    }

    async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        // "0" so entries published before the group existed are still delivered
        let result: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.topic, &self.config.channel, "0")
            .await;
        match result {
            Ok(()) => {
                info!(topic = %self.config.topic, channel = %self.config.channel, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(topic = %self.config.topic, channel = %self.config.channel, "consumer group exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim entries that other deliveries left idle past the redelivery timeout.
    async fn reclaim(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.config.topic, &self.config.channel, "-", "+", max)
            .await?;
        let idle_ms = self.config.redelivery_timeout_ms as usize;
        let stale: Vec<_> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= idle_ms)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = stale.iter().map(|p| p.id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.topic,
                &self.config.channel,
                &self.config.consumer_name,
                idle_ms,
                &ids,
            )
            .await?;
        let deliveries = claimed
            .ids
            .iter()
            .map(|entry| {
                let previous = stale
                    .iter()
                    .find(|p| p.id == entry.id)
                    .map(|p| p.times_delivered)
                    .unwrap_or(1);
                to_delivery(entry, previous as u32 + 1)
            })
            .collect::<Vec<_>>();
        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "reclaimed idle deliveries");
        }
        Ok(deliveries)
    }

    async fn read_new(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.config.channel, &self.config.consumer_name)
            .count(max)
            .block(self.config.block_ms as usize);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.topic], &[">"], &opts)
            .await?;
        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|k| k.ids)
                    .map(|entry| to_delivery(&entry, 1))
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn to_delivery(entry: &StreamId, attempts: u32) -> Delivery {
    let body: Option<Vec<u8>> = entry.get(PAYLOAD_FIELD);
    Delivery {
        id: entry.id.clone(),
        body: body.unwrap_or_default(),
        attempts,
    }
}

#[async_trait]
impl DeliverySource for RedisStreamSource {
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let reclaimed = self.reclaim(max).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }
        self.read_new(max).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let acked: i64 = conn
            .xack(&self.config.topic, &self.config.channel, &[&delivery.id])
            .await?;
        if acked != 1 {
            warn!(message_id = %delivery.id, acked, "XACK did not remove a pending entry");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        // left pending; reclaimed after redelivery_timeout_ms
        debug!(message_id = %delivery.id, attempts = delivery.attempts, "released for redelivery");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let attempts = delivery.attempts.to_string();
        let _: String = conn
            .xadd(
                &self.config.dead_letter_topic,
                "*",
                &[
                    (PAYLOAD_FIELD, delivery.body.as_slice()),
                    ("reason", reason.as_bytes()),
                    ("attempts", attempts.as_bytes()),
                    ("origin_id", delivery.id.as_bytes()),
                ],
            )
            .await?;
        self.ack(delivery).await
    }
}
