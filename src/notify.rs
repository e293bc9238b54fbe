use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failures of one delivery channel. Isolated per channel: the dispatcher
/// records the outcome and moves on.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("channel rejected message: {0}")]
    Rejected(String),
}

/// Outbound notification transport. The core only supplies the plain-text
/// message and records the delivery outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &str;
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Slack `chat.postMessage` transport.
pub struct SlackNotifier {
    client: reqwest::Client,
    token: String,
    channel: String,
}

impl SlackNotifier {
    /// Enabled only when both `SLACK_TOKEN` and `SLACK_CHANNEL` are set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("SLACK_TOKEN").ok()?;
        let channel = std::env::var("SLACK_CHANNEL").ok()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self { client, token, channel })
    }
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let response: SlackResponse = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.token)
            .json(&json!({
                "channel": self.channel,
                "text": message,
                "username": "kpi-sentinel",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.ok {
            Ok(())
        } else {
            Err(NotifyError::Rejected(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

/// WhatsApp Cloud API transport (Graph `/messages` endpoint).
pub struct WhatsAppNotifier {
    client: reqwest::Client,
    token: String,
    phone_number_id: String,
    recipient: String,
}

impl WhatsAppNotifier {
    /// Enabled only when `WHATSAPP_TOKEN`, `WHATSAPP_PHONE_NUMBER_ID` and
    /// `WHATSAPP_RECIPIENT` are all set.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("WHATSAPP_TOKEN").ok()?;
        let phone_number_id = std::env::var("WHATSAPP_PHONE_NUMBER_ID").ok()?;
        let recipient = std::env::var("WHATSAPP_RECIPIENT").ok()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self { client, token, phone_number_id, recipient })
    }
}

#[async_trait]
impl Notifier for WhatsAppNotifier {
    fn channel(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        self.client
            .post(format!(
                "https://graph.facebook.com/v17.0/{}/messages",
                self.phone_number_id
            ))
            .bearer_auth(&self.token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": self.recipient,
                "type": "text",
                "text": { "body": message },
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
