use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Deployment tier the relay runs in. Selects the webhook config file and
/// the built-in default when that file is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Local,
    Development,
    Staging,
    Production,
    /// A tier name we don't know a default for.
    Other(String),
}

impl From<&str> for Environment {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Environment::Local,
            "development" | "dev" => Environment::Development,
            "staging" | "test" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            other => Environment::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Local => write!(f, "local"),
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
            Environment::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Where and how qualifying messages are forwarded.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterRules>,
}

/// Forwarding rules. A missing field leaves that dimension unrestricted.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilterRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_numbers: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_groups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_self_chat: Option<bool>,
}

const LOCAL_DEFAULT_WEBHOOK_URL: &str = "http://host.docker.internal:8000/webhook";
const PRODUCTION_DEFAULT_WEBHOOK_URL: &str = "http://127.0.0.1:8000/webhook";

impl WebhookConfig {
    /// Built-in fallback used when no config file exists for the tier.
    /// Only self-chat messages are forwarded.
    pub fn default_for(environment: &Environment) -> Option<Self> {
        let url = match environment {
            Environment::Production => PRODUCTION_DEFAULT_WEBHOOK_URL,
            Environment::Local | Environment::Development | Environment::Staging => {
                LOCAL_DEFAULT_WEBHOOK_URL
            }
            Environment::Other(_) => return None,
        };
        Some(Self {
            url: url.to_string(),
            auth_token: None,
            filters: Some(FilterRules {
                allowed_numbers: None,
                allow_private: Some(false),
                allow_groups: Some(false),
                allow_self_chat: Some(true),
            }),
        })
    }
}

/// Path of the webhook config for `environment` under `data_dir`. The tier
/// name is used as configured, so `dev` reads `webhook.dev.json`.
pub fn webhook_config_path(data_dir: &Path, environment: &str) -> PathBuf {
    data_dir.join(format!("webhook.{}.json", environment.trim()))
}

/// Load the webhook config for the given tier.
///
/// A readable, well-formed `webhook.<environment>.json` is returned as-is.
/// A missing or malformed file falls back to the tier's built-in default;
/// nothing here is fatal.
pub fn load_webhook_config(data_dir: &Path, environment: &str) -> Option<WebhookConfig> {
    let path = webhook_config_path(data_dir, environment);
    let environment = Environment::from(environment);

    match read_webhook_file(&path) {
        Ok(Some(config)) => {
            info!("Loaded webhook config from {}", path.display());
            return Some(config);
        }
        Ok(None) => info!("No webhook config at {}", path.display()),
        Err(e) => warn!("Ignoring webhook config: {:#}", e),
    }

    let fallback = WebhookConfig::default_for(&environment);
    match &fallback {
        Some(config) => info!(
            "Using built-in {} webhook default: {}",
            environment, config.url
        ),
        None => warn!(
            "No built-in webhook default for environment '{}', relay disabled",
            environment
        ),
    }
    fallback
}

fn read_webhook_file(path: &Path) -> Result<Option<WebhookConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read webhook config: {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse webhook config: {}", path.display()))?;
    Ok(Some(config))
}

/// Process settings, read once at startup from `config.toml`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub control: ControlSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/media`.
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            media_dir: None,
            environment: default_environment(),
        }
    }
}

/// Sidecar process that speaks the messaging protocol.
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeSettings {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_media_url")]
    pub media_url: String,
    #[serde(default = "default_media_timeout_secs")]
    pub media_timeout_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
            env: HashMap::new(),
            media_url: default_media_url(),
            media_timeout_secs: default_media_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelaySettings {
    /// Prefix carried by the system's own automated replies. Empty disables
    /// the echo check.
    #[serde(default)]
    pub reply_prefix: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            reply_prefix: String::new(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlSettings {
    #[serde(default = "default_control_url")]
    pub base_url: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            base_url: default_control_url(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".wwebjs_auth")
}

fn default_environment() -> String {
    "local".to_string()
}

fn default_bridge_command() -> String {
    "node".to_string()
}

fn default_media_url() -> String {
    "http://127.0.0.1:3010/media".to_string()
}

fn default_control_url() -> String {
    "http://host.docker.internal:8000".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_delay_secs() -> u64 {
    3
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_media_timeout_secs() -> u64 {
    60
}

impl Settings {
    /// Load settings from `path`. A missing file yields all defaults; the
    /// `RELAY_*` environment variables override whatever the file says.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Settings = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            info!("Config file {} not found, using defaults", path.display());
            Settings::default()
        };

        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(environment) = lookup("RELAY_ENVIRONMENT") {
            self.session.environment = environment;
        }
        if let Some(prefix) = lookup("RELAY_REPLY_PREFIX") {
            self.relay.reply_prefix = prefix;
        }
        if let Some(url) = lookup("RELAY_CONTROL_URL") {
            self.control.base_url = url;
        }
    }

    pub fn environment(&self) -> Environment {
        Environment::from(self.session.environment.as_str())
    }

    pub fn media_dir(&self) -> PathBuf {
        self.session
            .media_dir
            .clone()
            .unwrap_or_else(|| self.session.data_dir.join("media"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn scratch_dir() -> PathBuf {
        testing::scratch_dir("config")
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::from("local"), Environment::Local);
        assert_eq!(Environment::from("PROD"), Environment::Production);
        assert_eq!(Environment::from("dev"), Environment::Development);
        assert_eq!(Environment::from("qa"), Environment::Other("qa".to_string()));
    }

    #[test]
    fn test_missing_file_local_default() {
        let dir = scratch_dir();
        let config = load_webhook_config(&dir, "local").unwrap();
        assert_eq!(config.url, LOCAL_DEFAULT_WEBHOOK_URL);
        let filters = config.filters.unwrap();
        assert_eq!(filters.allow_self_chat, Some(true));
        assert_eq!(filters.allow_private, Some(false));
        assert_eq!(filters.allow_groups, Some(false));
    }

    #[test]
    fn test_missing_file_production_default_is_loopback() {
        let dir = scratch_dir();
        let config = load_webhook_config(&dir, "production").unwrap();
        assert_eq!(config.url, PRODUCTION_DEFAULT_WEBHOOK_URL);
        assert_eq!(config.filters.unwrap().allow_self_chat, Some(true));
    }

    #[test]
    fn test_unknown_environment_without_file_is_absent() {
        let dir = scratch_dir();
        assert!(load_webhook_config(&dir, "qa").is_none());
    }

    #[test]
    fn test_well_formed_file_returned_verbatim() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("webhook.local.json"),
            r#"{
                "url": "https://hooks.example.com/in",
                "authToken": "secret",
                "filters": { "allowedNumbers": ["111"], "allowGroups": true }
            }"#,
        )
        .unwrap();

        let config = load_webhook_config(&dir, "local").unwrap();
        assert_eq!(config.url, "https://hooks.example.com/in");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        let filters = config.filters.unwrap();
        assert_eq!(filters.allow_groups, Some(true));
        assert_eq!(filters.allow_private, None);
        assert_eq!(filters.allow_self_chat, None);
        assert!(filters.allowed_numbers.unwrap().contains("111"));
    }

    #[test]
    fn test_malformed_file_same_as_missing() {
        let dir = scratch_dir();
        std::fs::write(dir.join("webhook.local.json"), "{ not json").unwrap();

        let malformed = load_webhook_config(&dir, "local");
        let missing = load_webhook_config(&scratch_dir(), "local");
        assert_eq!(malformed, missing);
    }

    #[test]
    fn test_file_for_other_environment_ignored() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("webhook.production.json"),
            r#"{ "url": "https://prod.example.com" }"#,
        )
        .unwrap();

        let config = load_webhook_config(&dir, "local").unwrap();
        assert_eq!(config.url, LOCAL_DEFAULT_WEBHOOK_URL);
    }

    #[test]
    fn test_alias_tier_reads_its_own_file() {
        let dir = scratch_dir();
        std::fs::write(
            dir.join("webhook.dev.json"),
            r#"{ "url": "https://dev.example.com/hook" }"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("webhook.development.json"),
            r#"{ "url": "https://development.example.com/hook" }"#,
        )
        .unwrap();

        let config = load_webhook_config(&dir, "dev").unwrap();
        assert_eq!(config.url, "https://dev.example.com/hook");
        assert_eq!(
            webhook_config_path(&dir, "dev"),
            dir.join("webhook.dev.json")
        );
    }

    #[test]
    fn test_alias_tier_without_file_uses_tier_default() {
        let dir = scratch_dir();
        let config = load_webhook_config(&dir, "dev").unwrap();
        assert_eq!(config.url, LOCAL_DEFAULT_WEBHOOK_URL);
        let prod = load_webhook_config(&dir, "prod").unwrap();
        assert_eq!(prod.url, PRODUCTION_DEFAULT_WEBHOOK_URL);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.session.data_dir, PathBuf::from(".wwebjs_auth"));
        assert_eq!(settings.media_dir(), PathBuf::from(".wwebjs_auth/media"));
        assert_eq!(settings.environment(), Environment::Local);
        assert_eq!(settings.control.max_attempts, 10);
        assert_eq!(settings.control.retry_delay_secs, 3);
        assert_eq!(settings.control.request_timeout_secs, 10);
        assert_eq!(settings.relay.webhook_timeout_secs, 30);
        assert_eq!(settings.bridge.media_timeout_secs, 60);
        assert!(settings.relay.reply_prefix.is_empty());
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: Settings = toml::from_str(
            r#"
            [session]
            data_dir = "/var/lib/relay"
            media_dir = "/srv/media"
            environment = "production"

            [bridge]
            command = "node"
            args = ["sidecar/index.js"]

            [relay]
            reply_prefix = "[bot] "
            "#,
        )
        .unwrap();
        assert_eq!(settings.media_dir(), PathBuf::from("/srv/media"));
        assert_eq!(settings.environment(), Environment::Production);
        assert_eq!(settings.bridge.args, vec!["sidecar/index.js".to_string()]);
        assert_eq!(settings.relay.reply_prefix, "[bot] ");
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(|key| match key {
            "RELAY_ENVIRONMENT" => Some("staging".to_string()),
            "RELAY_REPLY_PREFIX" => Some(">>".to_string()),
            _ => None,
        });
        assert_eq!(settings.environment(), Environment::Staging);
        assert_eq!(settings.relay.reply_prefix, ">>");
        assert_eq!(settings.control.base_url, "http://host.docker.internal:8000");
    }
}
