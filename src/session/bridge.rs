use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{MediaPayload, SessionClient, SessionEvent};
use crate::config::BridgeSettings;
use crate::media::MediaError;

const EVENT_BUFFER: usize = 256;
const DEFAULT_MIMETYPE: &str = "application/octet-stream";
const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(60);

/// Session client backed by a sidecar process that owns the messaging
/// session. Events arrive as JSON lines on its stdout; attachments are
/// fetched over HTTP.
pub struct BridgeSession {
    client: reqwest::Client,
    media_url: String,
    /// Bounds a whole download, body included.
    media_timeout: Duration,
    /// Killed when the session is dropped.
    _child: Option<Child>,
}

impl BridgeSession {
    /// Spawn the sidecar and start forwarding its events.
    pub async fn start(settings: &BridgeSettings) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        info!(
            "Starting session bridge: {} {:?}",
            settings.command, settings.args
        );

        let mut command = Command::new(&settings.command);
        command
            .args(&settings.args)
            .envs(&settings.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start session bridge: {}", settings.command))?;
        let stdout = child
            .stdout
            .take()
            .context("Session bridge stdout was not captured")?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(forward_events(stdout, tx));

        let session = Self {
            client: reqwest::Client::new(),
            media_url: settings.media_url.clone(),
            media_timeout: Duration::from_secs(settings.media_timeout_secs),
            _child: Some(child),
        };
        Ok((session, rx))
    }

    /// Media-only client for an already running bridge.
    #[cfg(test)]
    pub fn with_media_url(media_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            media_url: media_url.to_string(),
            media_timeout: DEFAULT_MEDIA_TIMEOUT,
            _child: None,
        }
    }

    #[cfg(test)]
    pub fn with_media_timeout(mut self, timeout: Duration) -> Self {
        self.media_timeout = timeout;
        self
    }
}

/// Read JSON lines from `reader` until EOF or until the receiver goes away.
async fn forward_events<R>(reader: R, tx: mpsc::Sender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(event) = parse_event_line(&line) else {
                    continue;
                };
                debug!("Session event: {}", event.name());
                if tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping bridge reader");
                    return;
                }
            }
            Ok(None) => {
                warn!("Session bridge closed its output");
                return;
            }
            Err(e) => {
                warn!("Failed to read from session bridge: {}", e);
                return;
            }
        }
    }
}

/// Blank lines are ignored; anything that isn't a known event is logged and
/// dropped.
fn parse_event_line(line: &str) -> Option<SessionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping unrecognized bridge output ({}): {}", e, line);
            None
        }
    }
}

/// Extract `filename` from a `Content-Disposition` header value.
fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let (key, name) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = name.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[async_trait]
impl SessionClient for BridgeSession {
    async fn download_media(&self, message_id: &str) -> Result<MediaPayload, MediaError> {
        let url = format!("{}/{}", self.media_url.trim_end_matches('/'), message_id);
        let unavailable = |reason: String| MediaError::Unavailable {
            message_id: message_id.to_string(),
            reason,
        };

        debug!("Downloading media: {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.media_timeout)
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(unavailable("message or attachment not found".to_string()));
        }
        if !status.is_success() {
            return Err(unavailable(format!("bridge returned {}", status)));
        }

        let headers = response.headers();
        let mimetype = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_MIMETYPE)
            .to_string();
        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename);

        let data = response
            .bytes()
            .await
            .map_err(|e| unavailable(format!("failed to read body: {}", e)))?
            .to_vec();

        Ok(MediaPayload {
            data,
            mimetype,
            filename,
        })
    }
}
