//! Configuration Module
//!
//! Provides TOML-based configuration for the bridge with support for:
//! - Logging level
//! - HTTP front door (bind address, access token)
//! - MQTT connection settings
//! - Subscriptions (`mqtt.topic.<id>` property keys)
//! - Webhook URL template
//! - Environment variable overrides (BRIDGE__* prefix)
//!
//! Besides the typed [`Config`], the fully merged configuration is kept as a
//! flat dotted [`PropertyMap`] so subscriptions can be discovered by key
//! shape rather than by a fixed schema.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use mqtt::{MqttConfig, MqttProtocol, MqttTlsConfig};
pub use properties::PropertyMap;

use crate::subscription::SubscriptionTable;

mod mqtt;
mod properties;


/// Property namespace holding the subscription keys
pub const SUBSCRIPTION_NAMESPACE: &str = "mqtt";

/// Access token shipped as the default, warned about at startup
pub const DEFAULT_WEB_TOKEN: &str = "HELLOBRIDGE";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// Config crate error (parsing, merging, deserializing)
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// HTTP front door configuration
    pub web: WebConfig,
    /// MQTT connection configuration
    pub mqtt: MqttConfig,
    /// Webhook configuration
    pub webhook: WebhookConfig,
    /// Every merged key flattened to `section.key = value`
    #[serde(skip)]
    pub properties: PropertyMap,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// HTTP front door configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    #[serde(default = "default_web_bind")]
    pub bind: SocketAddr,
    /// Access token expected in the Authorization header
    #[serde(default = "default_web_token")]
    pub token: String,
}

fn default_web_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_web_token() -> String {
    DEFAULT_WEB_TOKEN.to_string()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: default_web_bind(),
            token: default_web_token(),
        }
    }
}

impl WebConfig {
    pub fn uses_default_token(&self) -> bool {
        self.token == DEFAULT_WEB_TOKEN
    }
}

/// Webhook configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    /// URL template with `{{subscription}}` / `{{decodedsubscription}}` placeholders
    pub url: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `BRIDGE__` prefix with double underscores for nesting:
    ///    - `BRIDGE__WEB__TOKEN=secret` overrides `web.token`
    ///    - `BRIDGE__MQTT__HOST=broker.local` overrides `mqtt.host`
    ///    - `BRIDGE__WEBHOOK__URL=http://...` overrides `webhook.url`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Self::builder_with_defaults()?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_merged(cfg)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg = Self::builder_with_defaults()?
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;
        Self::from_merged(cfg)
    }

    fn builder_with_defaults(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("web.bind", "0.0.0.0:8080")?
            .set_default("web.token", DEFAULT_WEB_TOKEN)?
            .set_default("mqtt.host", "localhost")?
            .set_default("mqtt.protocol", "mqtt")?
            .set_default("mqtt.client_id", "MQTTBridge")?
            .set_default("mqtt.default_qos", 1)?
            .set_default("mqtt.clean_session", false)?)
    }

    fn from_merged(cfg: config::Config) -> Result<Self, ConfigError> {
        let tree: serde_json::Value = cfg.clone().try_deserialize()?;
        let mut config: Config = cfg.try_deserialize()?;
        config.properties = PropertyMap::from_tree(&tree);
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.default_qos > 2 {
            return Err(ConfigError::Validation(
                "mqtt.default_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.host must not be empty".to_string(),
            ));
        }

        if self.mqtt.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }

        if self.mqtt.keep_alive < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "mqtt.keep_alive must be at least 1s".to_string(),
            ));
        }

        if self.mqtt.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "mqtt.max_inflight must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.reconnect_interval > self.mqtt.max_reconnect_interval {
            return Err(ConfigError::Validation(
                "mqtt.reconnect_interval must not exceed mqtt.max_reconnect_interval".to_string(),
            ));
        }

        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "mqtt.channel_capacity must be greater than 0".to_string(),
            ));
        }

        let tls = &self.mqtt.tls;
        if tls.client_cert.is_some() != tls.client_key.is_some() {
            return Err(ConfigError::Validation(
                "mqtt.tls.client_cert and mqtt.tls.client_key must be set together".to_string(),
            ));
        }

        if tls.client_cert.is_some() && tls.ca_cert.is_none() {
            return Err(ConfigError::Validation(
                "mqtt.tls.client_cert requires mqtt.tls.ca_cert".to_string(),
            ));
        }

        if self.web.token.is_empty() {
            return Err(ConfigError::Validation(
                "web.token must not be empty".to_string(),
            ));
        }

        if let Some(ref url) = self.webhook.url {
            if url.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "webhook.url must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build the subscription table from the `mqtt.topic.<id>` properties
    pub fn subscriptions(&self) -> Result<SubscriptionTable, ConfigError> {
        SubscriptionTable::from_properties(&self.properties, SUBSCRIPTION_NAMESPACE)
    }
}
