use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::WebhookConfig;
use crate::media::MediaInfo;
use crate::session::MessageRecord;

/// Body POSTed to the webhook for each relayed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub from: String,
    pub name: String,
    pub message: String,
    pub is_group: bool,
    pub timestamp: i64,
    pub message_id: String,
    /// True whenever the message carried an attachment, even if capturing
    /// it failed.
    pub has_media: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_info: Option<MediaInfo>,
}

impl WebhookPayload {
    pub fn new(message: &MessageRecord, is_group: bool, media_info: Option<MediaInfo>) -> Self {
        Self {
            from: message.sender_number.clone(),
            name: message.sender_name.clone(),
            message: message.body.clone(),
            is_group,
            timestamp: message.timestamp,
            message_id: message.id.clone(),
            has_media: message.has_attachment,
            media_type: message
                .attachment_kind
                .clone()
                .filter(|_| message.has_attachment),
            media_info,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-shot webhook delivery. Nothing is retried.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for WebhookClient {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl WebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound for one delivery, from connect to the end of the response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn deliver(
        &self,
        config: &WebhookConfig,
        payload: &WebhookPayload,
    ) -> Result<StatusCode, DeliveryError> {
        debug!("Sending webhook for {} to {}", payload.message_id, config.url);

        let mut request = self
            .client
            .post(&config.url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(payload);
        if let Some(token) = &config.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status { status, body });
        }
        Ok(status)
    }
}
