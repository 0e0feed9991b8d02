use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::filter::{skip_reason, Classification, SkipReason};
use crate::media::{MediaCapture, MediaInfo};
use crate::notifier::ConnectionNotifier;
use crate::session::{MessageRecord, SessionClient, SessionEvent};
use crate::webhook::{DeliveryError, WebhookClient, WebhookPayload};

/// Where the session is in its lifecycle, as far as relaying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    /// Authentication failed. Nothing is relayed for the rest of the session.
    Failed,
}

/// What happened to a single message event.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Delivered { status: u16 },
    DeliveryFailed,
    Skipped(SkipReason),
    /// Our own automated reply coming back around
    Echo,
    /// Sent by someone else; logged only
    Inbound,
    /// Session not active yet
    Inactive,
    /// No webhook configured for this environment
    NoWebhook,
}

impl std::fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayOutcome::Delivered { status } => write!(f, "delivered ({})", status),
            RelayOutcome::DeliveryFailed => write!(f, "delivery failed"),
            RelayOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            RelayOutcome::Echo => write!(f, "own reply"),
            RelayOutcome::Inbound => write!(f, "inbound"),
            RelayOutcome::Inactive => write!(f, "session inactive"),
            RelayOutcome::NoWebhook => write!(f, "no webhook"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Bodies starting with this are never relayed. Empty disables the check.
    pub reply_prefix: String,
    pub media_dir: PathBuf,
    pub webhook_timeout: Duration,
}

/// Consumes session events, notifies the control endpoint on connectivity
/// changes and forwards our own outgoing messages to the webhook.
pub struct RelayController {
    state: SessionState,
    own_user_id: Option<String>,
    session: Arc<dyn SessionClient>,
    /// Built once the session is authenticated.
    media: Option<Arc<MediaCapture>>,
    webhook: Option<WebhookConfig>,
    delivery: WebhookClient,
    notifier: ConnectionNotifier,
    /// Pending connect notice. Cancelled before any disconnect notice goes out.
    connect_notice: Option<JoinHandle<()>>,
    options: RelayOptions,
}

impl RelayController {
    pub fn new(
        session: Arc<dyn SessionClient>,
        webhook: Option<WebhookConfig>,
        notifier: ConnectionNotifier,
        options: RelayOptions,
    ) -> Self {
        Self {
            state: SessionState::Uninitialized,
            own_user_id: None,
            session,
            media: None,
            webhook,
            delivery: WebhookClient::new().with_timeout(options.webhook_timeout),
            notifier,
            connect_notice: None,
            options,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Process events in arrival order until the stream ends.
    ///
    /// Lifecycle events are handled inline. Message relays run on their own
    /// tasks with whatever state was current when the message arrived, so a
    /// slow webhook never holds up the next event.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_relay(joined);
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SessionEvent::MessageCreate { message } => match self.prepare(&message) {
                            Ok(job) => {
                                in_flight.spawn(job.execute());
                            }
                            Err(outcome) => debug!("message_create handled: {}", outcome),
                        },
                        event => {
                            let name = event.name();
                            if let Some(outcome) = self.handle_event(event).await {
                                debug!("{} handled: {}", name, outcome);
                            }
                        }
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_relay(joined);
        }
        info!("Session event stream ended ({:?})", self.state());
    }

    /// Returns the relay outcome for message events, `None` for lifecycle
    /// events.
    pub async fn handle_event(&mut self, event: SessionEvent) -> Option<RelayOutcome> {
        match event {
            SessionEvent::Qr { code } => {
                info!(
                    "QR code received ({} chars), scan it with the phone app to log in",
                    code.len()
                );
            }
            SessionEvent::Authenticated { user_id } => {
                info!("Authentication successful!");
                self.activate(user_id);
            }
            SessionEvent::Ready { user_id } => {
                info!("Client is ready!");
                if self.activate(user_id) {
                    self.cancel_connect_notice().await;
                    // Retries sleep, keep them off the event loop
                    let notifier = self.notifier.clone();
                    self.connect_notice =
                        Some(tokio::spawn(async move { notifier.notify(true).await }));
                }
            }
            SessionEvent::AuthFailure { reason } => {
                error!("Authentication failed: {}", reason);
                self.cancel_connect_notice().await;
                self.state = SessionState::Failed;
            }
            SessionEvent::Disconnected { reason } => {
                warn!("Client was disconnected: {}", reason);
                if self.state == SessionState::Active {
                    self.state = SessionState::Uninitialized;
                }
                self.cancel_connect_notice().await;
                self.notifier.notify(false).await;
            }
            SessionEvent::Error { message } => {
                error!("Session error: {}", message);
            }
            SessionEvent::Message { message } => {
                debug!(
                    "{} ({}): {}",
                    message.sender_name, message.sender_number, message.body
                );
                return Some(RelayOutcome::Inbound);
            }
            SessionEvent::MessageCreate { message } => {
                return Some(self.relay_message(&message).await);
            }
        }
        None
    }

    /// Move to `Active` and build the media adapter if it doesn't exist yet.
    /// Returns false when the session already failed authentication.
    fn activate(&mut self, user_id: Option<String>) -> bool {
        if self.state == SessionState::Failed {
            warn!("Ignoring session activation after authentication failure");
            return false;
        }
        if let Some(id) = user_id {
            self.own_user_id = Some(id);
        }
        if self.media.is_none() {
            self.media = Some(Arc::new(MediaCapture::new(self.session.clone())));
            debug!("Media capture ready");
        }
        self.state = SessionState::Active;
        true
    }

    /// Stop a connect notice that is still retrying and wait for it to go.
    async fn cancel_connect_notice(&mut self) {
        if let Some(notice) = self.connect_notice.take() {
            if !notice.is_finished() {
                debug!("Cancelling pending connect notice");
            }
            notice.abort();
            let _ = notice.await;
        }
    }

    /// Forward one of our own messages to the webhook, if the filters allow.
    /// Every failure is logged and contained to this message.
    pub async fn relay_message(&self, message: &MessageRecord) -> RelayOutcome {
        match self.prepare(message) {
            Ok(job) => job.execute().await,
            Err(outcome) => outcome,
        }
    }

    /// Run every check that needs controller state. `Err` carries the
    /// outcome for messages that go no further.
    fn prepare(&self, message: &MessageRecord) -> Result<RelayJob, RelayOutcome> {
        if !message.from_self {
            debug!(
                "{} ({}): {}",
                message.sender_name, message.sender_number, message.body
            );
            return Err(RelayOutcome::Inbound);
        }

        debug!(
            "Own message: {} ({}): {}",
            message.sender_name, message.sender_number, message.body
        );

        if self.state != SessionState::Active {
            debug!("Session not active, not relaying {}", message.id);
            return Err(RelayOutcome::Inactive);
        }

        let prefix = &self.options.reply_prefix;
        if !prefix.is_empty() && message.body.starts_with(prefix.as_str()) {
            debug!("Skipping own automated reply {}", message.id);
            return Err(RelayOutcome::Echo);
        }

        let Some(webhook) = &self.webhook else {
            debug!("No webhook configured, not relaying {}", message.id);
            return Err(RelayOutcome::NoWebhook);
        };

        let class = Classification::of(message, self.own_user_id.as_deref());
        if let Some(reason) = skip_reason(
            class.is_group,
            class.is_self_chat,
            &message.sender_number,
            webhook.filters.as_ref(),
        ) {
            debug!("Skipping message {}: {}", message.id, reason);
            return Err(RelayOutcome::Skipped(reason));
        }

        Ok(RelayJob {
            message: message.clone(),
            is_group: class.is_group,
            webhook: webhook.clone(),
            delivery: self.delivery.clone(),
            media: self.media.clone(),
            media_dir: self.options.media_dir.clone(),
        })
    }
}

fn log_relay(joined: Result<RelayOutcome, JoinError>) {
    match joined {
        Ok(outcome) => debug!("message_create handled: {}", outcome),
        Err(e) => error!("Relay task failed: {}", e),
    }
}

/// A message that passed every check, with what it needs to be delivered.
struct RelayJob {
    message: MessageRecord,
    is_group: bool,
    webhook: WebhookConfig,
    delivery: WebhookClient,
    media: Option<Arc<MediaCapture>>,
    media_dir: PathBuf,
}

impl RelayJob {
    async fn execute(self) -> RelayOutcome {
        let message = &self.message;
        let media_info = if message.has_attachment {
            self.capture_media().await
        } else {
            None
        };

        let payload = WebhookPayload::new(message, self.is_group, media_info);
        match self.delivery.deliver(&self.webhook, &payload).await {
            Ok(status) => {
                info!("Relayed message {} ({})", message.id, status);
                RelayOutcome::Delivered {
                    status: status.as_u16(),
                }
            }
            Err(DeliveryError::Status { status, body }) => {
                warn!("Webhook request failed with status {}: {}", status, body);
                RelayOutcome::DeliveryFailed
            }
            Err(e) => {
                error!("Error sending webhook: {}", e);
                RelayOutcome::DeliveryFailed
            }
        }
    }

    async fn capture_media(&self) -> Option<MediaInfo> {
        let message = &self.message;
        let Some(media) = &self.media else {
            warn!("Media capture not initialized, relaying {} without media", message.id);
            return None;
        };
        match media.capture(&message.id, &self.media_dir).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Relaying {} without media: {}", message.id, e);
                None
            }
        }
    }
}
