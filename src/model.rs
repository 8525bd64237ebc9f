use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery status of an outbox row. Ordered: a row only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Processing,
    Queued,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Processing => "processing",
            OutboxStatus::Queued => "queued",
            OutboxStatus::Sent => "sent",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(OutboxStatus::Processing),
            "queued" => Some(OutboxStatus::Queued),
            "sent" => Some(OutboxStatus::Sent),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of transactional message. Unrecognised wire values are kept verbatim
/// in `Unknown` so the consumer can log and dead-letter them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    ConfirmationMail,
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::ConfirmationMail => "confirmation_mail",
            MessageKind::Unknown(raw) => raw.as_str(),
        }
    }
}

impl From<String> for MessageKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "confirmation_mail" => MessageKind::ConfirmationMail,
            _ => MessageKind::Unknown(raw),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::ConfirmationMail => "confirmation_mail".to_string(),
            MessageKind::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable delivery-tracking row (`mailer_logs`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: i64,
    pub kind: MessageKind,
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue payload. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub name: String,
    pub email_address: String,
    pub token: String,
    pub subject: String,
    pub tracking_id: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl MessageEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

/// Signup fields as handed over by the (external) validation layer.
/// `password_hash` is already hashed.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub date_of_birth: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: i64,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub profile_id: i64,
    pub role_id: i64,
    pub email: String,
    pub display_name: String,
}
