pub mod bridge;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::media::MediaError;

/// A message as reported by the messaging session. Read-only to the relay.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageRecord {
    /// Serialized message id, used for media download
    pub id: String,
    /// Sent by this account
    pub from_self: bool,
    /// Chat id the message came from
    pub origin: String,
    pub sender_number: String,
    pub sender_name: String,
    pub body: String,
    /// Chat id the message was sent to
    pub destination: String,
    pub has_attachment: bool,
    pub attachment_kind: Option<String>,
    /// Unix seconds
    pub timestamp: i64,
}

/// Lifecycle and message events emitted by the session, one JSON object per
/// line on the bridge's stdout, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Qr {
        #[serde(default)]
        code: String,
    },
    Authenticated {
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
    },
    Ready {
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
    },
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    /// Message received from someone else
    Message { message: MessageRecord },
    /// Any message created in the session, including our own
    MessageCreate { message: MessageRecord },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Qr { .. } => "qr",
            SessionEvent::Authenticated { .. } => "authenticated",
            SessionEvent::Ready { .. } => "ready",
            SessionEvent::AuthFailure { .. } => "auth_failure",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Message { .. } => "message",
            SessionEvent::MessageCreate { .. } => "message_create",
        }
    }
}

/// Raw attachment bytes fetched from the session.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub data: Vec<u8>,
    pub mimetype: String,
    /// Name declared by the sender, if any
    pub filename: Option<String>,
}

/// Queries the relay makes against the live session.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Fetch the attachment of `message_id`. Fails with
    /// [`MediaError::Unavailable`] when the message or its media can't be
    /// resolved.
    async fn download_media(&self, message_id: &str) -> Result<MediaPayload, MediaError>;
}
