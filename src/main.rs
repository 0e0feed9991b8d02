mod config;
mod filter;
mod media;
mod notifier;
mod relay;
mod session;
mod webhook;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{load_webhook_config, Settings};
use crate::notifier::ConnectionNotifier;
use crate::relay::{RelayController, RelayOptions};
use crate::session::bridge::BridgeSession;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wa_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let environment = settings.environment();
    let media_dir = settings.media_dir();
    let notifier = ConnectionNotifier::from_settings(&settings.control);

    info!("Configuration loaded successfully");
    info!("  Environment: {}", environment);
    info!("  Data dir: {}", settings.session.data_dir.display());
    info!("  Media dir: {}", media_dir.display());
    info!("  Control endpoint: {}", notifier.endpoint());

    if !media_dir.exists() {
        match std::fs::create_dir_all(&media_dir) {
            Ok(()) => info!("Created media storage directory: {}", media_dir.display()),
            Err(e) => error!("Failed to create media storage directory: {}", e),
        }
    }

    let webhook = load_webhook_config(&settings.session.data_dir, &settings.session.environment);

    let (session, events) = BridgeSession::start(&settings.bridge).await?;

    let controller = RelayController::new(
        Arc::new(session),
        webhook,
        notifier,
        RelayOptions {
            reply_prefix: settings.relay.reply_prefix.clone(),
            media_dir,
            webhook_timeout: Duration::from_secs(settings.relay.webhook_timeout_secs),
        },
    );

    info!("Relay is starting...");
    tokio::select! {
        _ = controller.run(events) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
