//! Delivery consumer: drains the confirmation topic, sends mail through the
//! provider and marks the tracking row `sent`.
//!
//! Each delivery goes `Received -> Processing -> {Acknowledged | Redelivered |
//! DeadLettered}`. Delivery is at-least-once; a crash or failed handler
//! causes redelivery, so a mail can be sent more than once.

use crate::broker::{Delivery, DeliverySource};
use crate::config;
use crate::db::{OutboxStore, Transition};
use crate::mailer::{MailMessage, MailProvider};
use crate::model::{MessageEnvelope, MessageKind, OutboxStatus};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const CONFIRMATION_TEMPLATE: &str = "account-confirmation-email";

/// What to tell the broker about a handled delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Retry(String),
    DeadLetter(String),
}

/// Per-message logic for the confirmation topic.
pub struct ConfirmationHandler {
    store: OutboxStore,
    provider: Arc<dyn MailProvider>,
    sender: String,
    confirmation_url: String,
    /// Aborts in-flight provider calls; not fired on graceful shutdown.
    abort: CancellationToken,
}

impl ConfirmationHandler {
    pub fn new(
        store: OutboxStore,
        provider: Arc<dyn MailProvider>,
        mail: &config::Mail,
        abort: CancellationToken,
    ) -> Self {
        Self {
            store,
            provider,
            sender: mail.sender.clone(),
            confirmation_url: mail.confirmation_url.clone(),
            abort,
        }
    }

    pub async fn handle(&self, body: &[u8]) -> Outcome {
        let envelope = match MessageEnvelope::from_json(body) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "undecodable envelope");
                return Outcome::DeadLetter(format!("malformed envelope: {e}"));
            }
        };
        match &envelope.kind {
            MessageKind::ConfirmationMail => self.send_confirmation(&envelope).await,
            MessageKind::Unknown(kind) => {
                warn!(kind = %kind, tracking_id = envelope.tracking_id, "no handler for message kind");
                Outcome::DeadLetter(format!("unknown message kind `{kind}`"))
            }
        }
    }

    pub fn render(&self, envelope: &MessageEnvelope) -> MailMessage {
        let mut msg = MailMessage::new(
            self.sender.clone(),
            envelope.subject.clone(),
            "",
            envelope.email_address.clone(),
        );
        msg.set_template(CONFIRMATION_TEMPLATE);
        msg.add_variable("name", envelope.name.clone());
        msg.add_variable(
            "confirmation_link",
            format!(
                "{}?id={}&token={}",
                self.confirmation_url, envelope.tracking_id, envelope.token
            ),
        );
        msg
    }

    #[instrument(skip_all, fields(tracking_id = envelope.tracking_id))]
    async fn send_confirmation(&self, envelope: &MessageEnvelope) -> Outcome {
        match self.store.find(envelope.tracking_id).await {
            Ok(Some(row)) if row.status == OutboxStatus::Sent => {
                info!("already sent; skipping duplicate delivery");
                return Outcome::Ack;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("no tracking row for envelope");
                return Outcome::DeadLetter(format!(
                    "tracking row {} not found",
                    envelope.tracking_id
                ));
            }
            Err(e) => {
                warn!(error = %e, "tracking lookup failed before send");
                return Outcome::Retry(e.to_string());
            }
        }

        let message = self.render(envelope);
        match self.provider.send(&message, &self.abort).await {
            Ok(provider_id) => debug!(%provider_id, "mail accepted by provider"),
            Err(e) => {
                warn!(error = %e, "mail send failed");
                return Outcome::Retry(e.to_string());
            }
        }

        match self
            .store
            .transition(
                envelope.tracking_id,
                &[OutboxStatus::Processing, OutboxStatus::Queued],
                OutboxStatus::Sent,
                None,
            )
            .await
        {
            Ok(Transition::Applied(_)) | Ok(Transition::Rejected { current: OutboxStatus::Sent }) => {
                info!("confirmation mail sent");
                Outcome::Ack
            }
            Ok(Transition::Rejected { current }) => {
                error!(%current, "tracking row in unexpected state after send");
                Outcome::Ack
            }
            Err(e) => {
                // redelivery will send the mail again
                error!(error = %e, "mail sent but tracking row not updated");
                Outcome::Retry(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub max_in_flight: usize,
    pub max_deliveries: u32,
}

impl ConsumerSettings {
    pub fn from_broker(broker: &config::Broker) -> Self {
        Self {
            workers: broker.workers,
            max_in_flight: broker.max_in_flight,
            max_deliveries: broker.max_deliveries,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers: 20,
            max_in_flight: 200,
            max_deliveries: 5,
        }
    }
}

struct InFlight {
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
}

/// Worker pool over a delivery source.
pub struct DeliveryConsumer {
    source: Arc<dyn DeliverySource>,
    handler: Arc<ConfirmationHandler>,
    settings: ConsumerSettings,
}

impl DeliveryConsumer {
    pub fn new(
        source: Arc<dyn DeliverySource>,
        handler: ConfirmationHandler,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            source,
            handler: Arc::new(handler),
            settings,
        }
    }

    /// Handle one delivery and settle it with the broker.
    pub async fn process(&self, delivery: &Delivery) -> Outcome {
        process_delivery(
            self.source.as_ref(),
            &self.handler,
            self.settings.max_deliveries,
            delivery,
        )
        .await
    }

    /// Run until `shutdown` fires, then let in-flight deliveries finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let workers = self.settings.workers.max(1);
        let max_in_flight = self.settings.max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let (tx, rx) = mpsc::channel::<InFlight>(max_in_flight);
        let rx = Arc::new(Mutex::new(rx));

        info!(workers, max_in_flight, "delivery consumer starting");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = Arc::clone(&rx);
            let source = Arc::clone(&self.source);
            let handler = Arc::clone(&self.handler);
            let max_deliveries = self.settings.max_deliveries;
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(item) = next else { break };
                    process_delivery(source.as_ref(), &handler, max_deliveries, &item.delivery).await;
                }
                debug!(worker, "worker stopped");
            }));
        }

        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => permit?,
            };
            let mut held = vec![first];
            while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
                held.push(permit);
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = self.source.fetch(held.len()) => res,
            };
            let deliveries = match fetched {
                Ok(d) => d,
                Err(e) => {
                    error!(error = %e, "fetch failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };
            for delivery in deliveries {
                let Some(permit) = held.pop() else {
                    warn!(message_id = %delivery.id, "source returned more than requested; releasing");
                    if let Err(e) = self.source.release(&delivery).await {
                        warn!(error = %e, "release failed");
                    }
                    continue;
                };
                if tx.send(InFlight { delivery, _permit: permit }).await.is_err() {
                    break;
                }
            }
        }

        info!("shutdown requested; draining in-flight deliveries");
        drop(tx);
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker panicked");
            }
        }
        info!("delivery consumer stopped");
        Ok(())
    }
}

#[instrument(skip_all, fields(message_id = %delivery.id, attempts = delivery.attempts))]
async fn process_delivery(
    source: &dyn DeliverySource,
    handler: &ConfirmationHandler,
    max_deliveries: u32,
    delivery: &Delivery,
) -> Outcome {
    let outcome = if delivery.attempts > max_deliveries {
        Outcome::DeadLetter(format!("gave up after {} deliveries", max_deliveries))
    } else {
        handler.handle(&delivery.body).await
    };

    let settled = match &outcome {
        Outcome::Ack => source.ack(delivery).await,
        Outcome::Retry(reason) => {
            debug!(%reason, "releasing for redelivery");
            source.release(delivery).await
        }
        Outcome::DeadLetter(reason) => {
            warn!(%reason, "dead-lettering delivery");
            source.dead_letter(delivery, reason).await
        }
    };
    if let Err(e) = settled {
        // unsettled deliveries are redelivered by the broker
        error!(error = %e, "failed to settle delivery");
    }
    outcome
}
