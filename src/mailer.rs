use crate::config;
use crate::error::MailError;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An outgoing mail: sender, subject, body, recipients plus an optional
/// provider-side template and its variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub template: Option<String>,
    pub variables: BTreeMap<String, String>,
}

impl MailMessage {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            recipients: vec![recipient.into()],
            template: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn set_template(&mut self, name: impl Into<String>) {
        self.template = Some(name.into());
    }

    pub fn add_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }
}

/// Transport for outgoing mail. Sends are not idempotent: calling `send`
/// twice delivers two mails.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Returns the provider's message id.
    async fn send(&self, message: &MailMessage, cancel: &CancellationToken) -> Result<String, MailError>;
}

#[derive(Clone)]
pub struct MailgunClient {
    http: Client,
    base_url: Url,
    domain: String,
    api_key: String,
}

impl fmt::Debug for MailgunClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailgunClient")
            .field("base_url", &self.base_url)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

impl MailgunClient {
    pub fn from_config(cfg: &config::Mail) -> Result<Self, MailError> {
        let base_url =
            Url::parse(&cfg.api_base).map_err(|_| MailError::Invalid("mail.api_base is not a URL"))?;
        Self::with_base_url(
            cfg.domain.clone(),
            cfg.api_key.clone(),
            base_url,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn with_base_url(
        domain: String,
        api_key: String,
        base_url: Url,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let http = Client::builder()
            .user_agent("signup-mailer/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            domain,
            api_key,
        })
    }

    pub fn build_request(&self, message: &MailMessage) -> Result<reqwest::Request, MailError> {
        if message.recipients.is_empty() {
            return Err(MailError::Invalid("message has no recipient"));
        }
        let endpoint = self
            .base_url
            .join(&format!("v3/{}/messages", self.domain))
            .map_err(|_| MailError::Invalid("invalid mail domain"))?;

        let mut form: Vec<(&str, String)> = vec![
            ("from", message.sender.clone()),
            ("subject", message.subject.clone()),
        ];
        for to in &message.recipients {
            form.push(("to", to.clone()));
        }
        if !message.body.is_empty() {
            form.push(("text", message.body.clone()));
        }
        if let Some(template) = &message.template {
            form.push(("template", template.clone()));
        }
        if !message.variables.is_empty() {
            let vars = serde_json::to_string(&message.variables)
                .map_err(|_| MailError::Invalid("template variables"))?;
            form.push(("h:X-Mailgun-Variables", vars));
        }

        Ok(self
            .http
            .post(endpoint)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String, MailError> {
        debug!(url = %request.url(), "sending mail");
        let res = self.http.execute(request).await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(MailError::Provider { status, body });
        }
        let payload: SendResponse = res.json().await?;
        Ok(payload.id)
    }
}

#[async_trait]
impl MailProvider for MailgunClient {
    async fn send(&self, message: &MailMessage, cancel: &CancellationToken) -> Result<String, MailError> {
        let request = self.build_request(message)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MailError::Cancelled),
            res = self.execute(request) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MailgunClient {
        MailgunClient::with_base_url(
            "mg.example.com".into(),
            "key-123".into(),
            Url::parse("https://api.mailgun.test/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn confirmation() -> MailMessage {
        let mut msg = MailMessage::new("no-reply@example.com", "Confirm your account!", "", "a@x.com");
        msg.set_template("account-confirmation-email");
        msg.add_variable("confirmation_link", "https://example.com/confirm?id=1&token=t");
        msg
    }

    #[test]
    fn request_targets_domain_endpoint_with_basic_auth() {
        let req = client().build_request(&confirmation()).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(
            req.url().as_str(),
            "https://api.mailgun.test/v3/mg.example.com/messages"
        );
        let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Basic "));
    }

    #[test]
    fn request_body_carries_template_and_variables() {
        let req = client().build_request(&confirmation()).unwrap();
        let body = std::str::from_utf8(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert!(body.contains("template=account-confirmation-email"));
        assert!(body.contains("to=a%40x.com"));
        assert!(body.contains("h%3AX-Mailgun-Variables="));
        assert!(!body.contains("text="));
    }

    #[test]
    fn message_without_recipient_is_rejected() {
        let mut msg = confirmation();
        msg.recipients.clear();
        assert!(matches!(
            client().build_request(&msg),
            Err(MailError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_send_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client().send(&confirmation(), &cancel).await.unwrap_err();
        assert!(matches!(err, MailError::Cancelled));
    }
}
