//! Account registration: user creation plus the confirmation-mail outbox write
//! and publish.

use crate::broker::MessageProducer;
use crate::db::{OutboxStore, Transition, UserRepo};
use crate::error::RegistrationError;
use crate::model::{MessageEnvelope, MessageKind, NewAccount, OutboxMessage, OutboxStatus, User};
use crate::token;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

pub const CLIENT_ROLE_SLUG: &str = "client";
pub const CONFIRMATION_SUBJECT: &str = "Confirm your account!";

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    pub outbox: OutboxMessage,
}

pub struct RegistrationCoordinator {
    users: UserRepo,
    outbox: OutboxStore,
    producer: Arc<dyn MessageProducer>,
    topic: String,
}

impl RegistrationCoordinator {
    pub fn new(
        users: UserRepo,
        outbox: OutboxStore,
        producer: Arc<dyn MessageProducer>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            users,
            outbox,
            producer,
            topic: topic.into(),
        }
    }

    /// Create the account and queue its confirmation mail.
    ///
    /// The user, profile and the `processing` outbox row (payload already
    /// carrying its own tracking id) are committed together. Publishing happens
    /// after the commit; if it fails the row stays `processing` and the relay
    /// picks it up later.
    #[instrument(skip_all, fields(email = %account.email))]
    pub async fn register(&self, account: NewAccount) -> Result<Registration, RegistrationError> {
        let role = self
            .users
            .find_role_by_slug(CLIENT_ROLE_SLUG)
            .await
            .map_err(RegistrationError::AccountNotCreated)?
            .ok_or_else(|| RegistrationError::MissingRole(CLIENT_ROLE_SLUG.to_string()))?;

        let mut tx = self
            .outbox
            .pool()
            .begin()
            .await
            .map_err(|e| RegistrationError::AccountNotCreated(e.into()))?;

        let user = UserRepo::create_with_profile(&mut tx, &account, &role)
            .await
            .map_err(RegistrationError::AccountNotCreated)?;

        let token = token::confirmation_token(user.id).map_err(|e| {
            error!(error = %e, user_id = user.id, "random source unavailable");
            RegistrationError::Token(e)
        })?;

        let mut envelope = MessageEnvelope {
            name: user.display_name.clone(),
            email_address: user.email.clone(),
            token,
            subject: CONFIRMATION_SUBJECT.to_string(),
            tracking_id: 0,
            kind: MessageKind::ConfirmationMail,
        };
        let draft = envelope.to_json().map_err(not_created)?;
        let mut row =
            OutboxStore::insert_tx(&mut tx, &MessageKind::ConfirmationMail, &draft, OutboxStatus::Processing)
                .await
                .map_err(not_created)?;

        envelope.tracking_id = row.id;
        row.payload = envelope.to_json().map_err(not_created)?;
        let row = OutboxStore::update_tx(&mut tx, &row)
            .await
            .map_err(not_created)?;

        tx.commit().await.map_err(not_created)?;
        debug!(user_id = user.id, outbox_id = row.id, "account and outbox row committed");

        if let Err(e) = self.producer.publish(&self.topic, &envelope).await {
            error!(error = %e, user_id = user.id, outbox_id = row.id, "publish failed; row left processing");
            return Err(RegistrationError::MailNotQueued {
                user_id: user.id,
                outbox_id: row.id,
                source: e.into(),
            });
        }

        let outbox = match self
            .outbox
            .transition(row.id, &[OutboxStatus::Processing], OutboxStatus::Queued, None)
            .await
        {
            Ok(Transition::Applied(updated)) => updated,
            Ok(Transition::Rejected { current }) => {
                // the consumer already got to it
                debug!(outbox_id = row.id, %current, "row moved past processing before queued mark");
                OutboxMessage { status: current, ..row }
            }
            Err(e) => {
                error!(error = %e, outbox_id = row.id, "published but could not mark queued");
                return Err(RegistrationError::TrackingNotUpdated {
                    user_id: user.id,
                    outbox_id: row.id,
                    source: e,
                });
            }
        };

        info!(user_id = user.id, outbox_id = outbox.id, "confirmation mail queued");
        Ok(Registration { user, outbox })
    }
}

fn not_created(e: impl Into<anyhow::Error>) -> RegistrationError {
    RegistrationError::AccountNotCreated(e.into())
}
