//! Republishes outbox rows stuck at `processing`, i.e. rows whose account was
//! committed but whose publish failed or never happened.

use crate::broker::MessageProducer;
use crate::config;
use crate::db::{OutboxStore, Transition};
use crate::model::{MessageEnvelope, OutboxStatus};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

pub struct OutboxRelay {
    store: OutboxStore,
    producer: Arc<dyn MessageProducer>,
    topic: String,
    stale_after: chrono::Duration,
    batch_size: u32,
}

impl OutboxRelay {
    pub fn new(
        store: OutboxStore,
        producer: Arc<dyn MessageProducer>,
        topic: impl Into<String>,
        relay: &config::Relay,
    ) -> Self {
        Self {
            store,
            producer,
            topic: topic.into(),
            stale_after: chrono::Duration::seconds(relay.stale_after_secs as i64),
            batch_size: relay.batch_size,
        }
    }

    /// One pass over stale rows. Returns how many were republished.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.stale_after;
        let rows = self.store.stale_processing(cutoff, self.batch_size).await?;
        let mut republished = 0;
        for row in rows {
            let envelope = match MessageEnvelope::from_json(row.payload.as_bytes()) {
                Ok(env) if env.tracking_id == row.id => env,
                Ok(env) => {
                    warn!(id = row.id, tracking_id = env.tracking_id, "payload tracking id mismatch; skipping");
                    continue;
                }
                Err(err) => {
                    warn!(id = row.id, ?err, "undecodable outbox payload; skipping");
                    continue;
                }
            };
            if let Err(err) = self.producer.publish(&self.topic, &envelope).await {
                warn!(id = row.id, ?err, "republish failed; will retry next sweep");
                continue;
            }
            match self
                .store
                .transition(row.id, &[OutboxStatus::Processing], OutboxStatus::Queued, None)
                .await
            {
                Ok(Transition::Applied(_)) => {
                    info!(id = row.id, "stale outbox row republished");
                    republished += 1;
                }
                Ok(Transition::Rejected { current }) => {
                    info!(id = row.id, %current, "row advanced during sweep");
                }
                Err(err) => {
                    // published but still processing; the next sweep publishes it again
                    warn!(id = row.id, ?err, "could not mark republished row queued");
                }
            }
        }
        Ok(republished)
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        loop {
            match self.sweep().await {
                Ok(0) => {}
                Ok(n) => info!(republished = n, "relay sweep done"),
                Err(err) => error!(?err, "relay sweep error"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("relay stopped");
    }
}
