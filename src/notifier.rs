use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ControlSettings;

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ConnectedBody {
    connected: bool,
}

/// Tells the control endpoint whether the session is connected.
///
/// The endpoint may still be starting when the session comes up, so the
/// connect notice is retried a bounded number of times. The disconnect
/// notice is sent once.
#[derive(Clone)]
pub struct ConnectionNotifier {
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl ConnectionNotifier {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/set-connected", base_url.trim_end_matches('/')),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn from_settings(settings: &ControlSettings) -> Self {
        Self::new(&settings.base_url)
            .with_retry(
                settings.max_attempts,
                Duration::from_secs(settings.retry_delay_secs),
            )
            .with_request_timeout(Duration::from_secs(settings.request_timeout_secs))
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Bounds each POST; a timed out attempt counts as failed.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Best effort; failures are logged, never returned.
    pub async fn notify(&self, connected: bool) {
        if connected {
            self.notify_connected().await;
        } else {
            self.notify_disconnected().await;
        }
    }

    async fn notify_connected(&self) {
        for attempt in 1..=self.max_attempts {
            match self.post(true).await {
                Ok(()) => {
                    info!("Control endpoint notified: connected (attempt {})", attempt);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Connect notification attempt {}/{} failed: {:#}",
                        attempt, self.max_attempts, e
                    );
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        error!(
            "Giving up notifying {} after {} attempts",
            self.endpoint, self.max_attempts
        );
    }

    async fn notify_disconnected(&self) {
        match self.post(false).await {
            Ok(()) => info!("Control endpoint notified: disconnected"),
            Err(e) => error!("Failed to notify disconnection: {:#}", e),
        }
    }

    async fn post(&self, connected: bool) -> Result<()> {
        debug!("POST {} connected={}", self.endpoint, connected);

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(&ConnectedBody { connected })
            .send()
            .await
            .context("Failed to reach control endpoint")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Control endpoint returned {}", status);
        }
        Ok(())
    }
}
