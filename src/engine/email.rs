use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mail transport error: {0}")]
    Transport(String),

    #[error("Mail rejected with status {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    ClaimInvitation,
    VerificationCode,
}

impl EmailTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailTemplate::ClaimInvitation => "claim_invitation",
            EmailTemplate::VerificationCode => "verification_code",
        }
    }
}

/// `template_data` may hold secrets (claim URL, verification code) and must
/// never be logged.
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub recipient: String,
    pub template: EmailTemplate,
    pub template_data: Value,
}

/// Outbound email collaborator. Callers log failures and carry on.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

/// Records that a message would have been sent. Content is not logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        tracing::info!(
            "Email queued (log transport): template={} recipient={}",
            message.template.as_str(),
            message.recipient
        );
        Ok(())
    }
}

/// Hands messages to an HTTP relay as JSON
pub struct WebhookMailer {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl WebhookMailer {
    pub fn new(endpoint: url::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MailError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Captures messages so tests can read codes and links
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: RwLock<Vec<EmailMessage>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.read().await.clone()
    }

    /// Most recent verification code sent to `recipient`
    pub async fn last_code_for(&self, recipient: &str) -> Option<String> {
        self.sent
            .read()
            .await
            .iter()
            .rev()
            .find(|m| m.template == EmailTemplate::VerificationCode && m.recipient == recipient)
            .and_then(|m| m.template_data["code"].as_str().map(str::to_string))
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        self.sent.write().await.push(message.clone());
        Ok(())
    }
}
