//! Error types shared across the pipeline.

use thiserror::Error;

/// Outbox store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("outbox message {0} not found")]
    NotFound(i64),
    #[error("corrupt outbox row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Message broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Mail provider errors.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("send cancelled")]
    Cancelled,
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

/// Failure of a registration attempt.
///
/// `AccountNotCreated` means nothing was committed. `MailNotQueued` means the
/// account and its outbox row were committed but the confirmation mail was not
/// handed to the broker; the row stays at `processing` for the relay.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("role `{0}` does not exist")]
    MissingRole(String),
    #[error("could not generate confirmation token: {0}")]
    Token(#[from] rand::Error),
    #[error("account not created: {0}")]
    AccountNotCreated(#[source] anyhow::Error),
    #[error("account {user_id} created but confirmation mail {outbox_id} not queued: {source}")]
    MailNotQueued {
        user_id: i64,
        outbox_id: i64,
        #[source]
        source: anyhow::Error,
    },
    #[error("confirmation mail {outbox_id} for account {user_id} published but not marked queued: {source}")]
    TrackingNotUpdated {
        user_id: i64,
        outbox_id: i64,
        #[source]
        source: StoreError,
    },
}

impl RegistrationError {
    /// Whether the user row exists despite the failure.
    pub fn account_committed(&self) -> bool {
        matches!(
            self,
            RegistrationError::MailNotQueued { .. } | RegistrationError::TrackingNotUpdated { .. }
        )
    }
}
