//! Configuration loader and validator for the signup mailer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const CONFIRMATION_TOPIC: &str = "account-confirmation-emails";
pub const CONFIRMATION_CHANNEL: &str = "account-confirmation-channel";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub database: Database,
    pub broker: Broker,
    pub mail: Mail,
    #[serde(default)]
    pub relay: Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    pub url: String,
}

/// Message broker (Redis Streams) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Consumer name inside the channel; generated per process when absent.
    #[serde(default)]
    pub consumer_name: Option<String>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_redelivery_timeout_ms")]
    pub redelivery_timeout_ms: u64,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
}

/// Mail provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub domain: String,
    pub api_key: String,
    pub sender: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub confirmation_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Stale PROCESSING sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relay {
    pub interval_ms: u64,
    pub stale_after_secs: u64,
    pub batch_size: u32,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stale_after_secs: 60,
            batch_size: 100,
        }
    }
}

fn default_topic() -> String {
    CONFIRMATION_TOPIC.to_string()
}

fn default_channel() -> String {
    CONFIRMATION_CHANNEL.to_string()
}

fn default_max_in_flight() -> usize {
    200
}

fn default_workers() -> usize {
    20
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_redelivery_timeout_ms() -> u64 {
    60_000
}

fn default_block_ms() -> u64 {
    5_000
}

fn default_api_base() -> String {
    "https://api.mailgun.net".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Broker {
    pub fn dead_letter_topic(&self) -> String {
        format!("{}.dead-letter", self.topic)
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `DATABASE_URL` and `REDIS_URL` override `database.url` and `broker.url`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_env(&mut cfg, |key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_env(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
        cfg.database.url = url;
    }
    if let Some(url) = lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
        cfg.broker.url = url;
    }
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }

    let b = &cfg.broker;
    if b.url.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.url must be non-empty"));
    }
    if b.topic.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.topic must be non-empty"));
    }
    if b.channel.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.channel must be non-empty"));
    }
    if b.max_in_flight == 0 {
        return Err(ConfigError::Invalid("broker.max_in_flight must be > 0"));
    }
    if b.workers == 0 {
        return Err(ConfigError::Invalid("broker.workers must be > 0"));
    }
    if b.max_deliveries == 0 {
        return Err(ConfigError::Invalid("broker.max_deliveries must be > 0"));
    }
    if b.redelivery_timeout_ms == 0 {
        return Err(ConfigError::Invalid("broker.redelivery_timeout_ms must be > 0"));
    }

    let m = &cfg.mail;
    if m.domain.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.domain must be non-empty"));
    }
    if m.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.api_key must be non-empty"));
    }
    if m.sender.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.sender must be non-empty"));
    }
    if m.confirmation_url.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.confirmation_url must be non-empty"));
    }

    if cfg.relay.interval_ms == 0 {
        return Err(ConfigError::Invalid("relay.interval_ms must be > 0"));
    }
    if cfg.relay.batch_size == 0 {
        return Err(ConfigError::Invalid("relay.batch_size must be > 0"));
    }

    Ok(())
}

/// Example configuration documenting every key.
pub fn example() -> &'static str {
    r#"database:
  url: "sqlite://./data/signup.db"

broker:
  url: "redis://127.0.0.1:6379"
  topic: "account-confirmation-emails"
  channel: "account-confirmation-channel"
  max_in_flight: 200
  workers: 20
  max_deliveries: 5
  redelivery_timeout_ms: 60000
  block_ms: 5000

mail:
  domain: "mg.example.com"
  api_key: "YOUR_MAILGUN_API_KEY"
  sender: "Example <no-reply@example.com>"
  confirmation_url: "https://example.com/confirm"

relay:
  interval_ms: 30000
  stale_after_secs: 60
  batch_size: 100
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.broker.topic, CONFIRMATION_TOPIC);
        assert_eq!(cfg.broker.channel, CONFIRMATION_CHANNEL);
        assert_eq!(cfg.broker.dead_letter_topic(), "account-confirmation-emails.dead-letter");
    }

    #[test]
    fn broker_defaults_apply() {
        let yaml = r#"database:
  url: "sqlite::memory:"
broker:
  url: "redis://localhost"
mail:
  domain: "d"
  api_key: "k"
  sender: "s@x.com"
  confirmation_url: "https://x.com/c"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.broker.max_in_flight, 200);
        assert_eq!(cfg.broker.workers, 20);
        assert_eq!(cfg.broker.max_deliveries, 5);
        assert_eq!(cfg.relay, Relay::default());
        assert_eq!(cfg.mail.api_base, "https://api.mailgun.net");
    }

    #[test]
    fn invalid_mail_credentials() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.api_key = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("mail.api_key")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.mail.sender = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_broker_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.broker.max_in_flight = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("max_in_flight")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.broker.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.broker.max_deliveries = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn env_overrides_urls() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        apply_env(&mut cfg, |key| match key {
            "DATABASE_URL" => Some("sqlite::memory:".into()),
            "REDIS_URL" => Some("redis://broker:6380".into()),
            _ => None,
        });
        assert_eq!(cfg.database.url, "sqlite::memory:");
        assert_eq!(cfg.broker.url, "redis://broker:6380");
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.mail.domain, "mg.example.com");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let err = load(Some(&td.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
