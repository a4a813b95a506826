//! Configuration file model for the session client
//!
//! A TOML file with a required `[broker]` section and optional `[session]`
//! and `[session.retry]` sections. Credentials are never stored in the file;
//! `[broker]` names the environment variables that hold them.

use crate::retry::{ExponentialBackoff, PatternBackoff, RetryPolicy};
use crate::session::{OverflowStrategy, SessionClientOptions};
use crate::transport::ConnectOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub url: String,
    /// MQTT client identifier; generated when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long the broker keeps the session after a drop. Must be non-zero.
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u32,
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_session_expiry() -> u32 {
    3600
}

fn default_clean_start() -> bool {
    true
}

/// Pending-request and reconnection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_max_pending")]
    pub max_pending_requests: usize,
    #[serde(default)]
    pub overflow_strategy: OverflowStrategy,
    #[serde(default)]
    pub retry_on_first_connect: bool,
    #[serde(default = "default_attempt_timeout_ms")]
    pub connection_attempt_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_pending_requests: default_max_pending(),
            overflow_strategy: OverflowStrategy::default(),
            retry_on_first_connect: false,
            connection_attempt_timeout_ms: default_attempt_timeout_ms(),
            retry: RetrySection::default(),
        }
    }
}

fn default_max_pending() -> usize {
    1000
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Pattern,
}

/// Retry policy settings. Fields irrelevant to the chosen strategy are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Total attempts including the first; None retries forever
    pub max_attempts: Option<u32>,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_attempts: None,
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            jitter: default_jitter(),
            backoff_pattern_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

fn default_min_interval_ms() -> u64 {
    128
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay_ms() -> u64 {
    250
}

impl RetrySection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts.is_some_and(|max| max < 2) {
            return Err(ConfigError::InvalidConfig(
                "session.retry.max_attempts must allow at least one retry (>= 2)".to_string(),
            ));
        }
        match self.strategy {
            RetryStrategy::Exponential => {
                if self.min_interval_ms == 0 {
                    return Err(ConfigError::InvalidConfig(
                        "session.retry.min_interval_ms must be greater than 0".to_string(),
                    ));
                }
                if self.max_interval_ms < self.min_interval_ms {
                    return Err(ConfigError::InvalidConfig(format!(
                        "session.retry.max_interval_ms ({}) is below min_interval_ms ({})",
                        self.max_interval_ms, self.min_interval_ms
                    )));
                }
            }
            RetryStrategy::Pattern => {
                self.pattern_backoff()
                    .validate()
                    .map_err(|e| ConfigError::InvalidConfig(format!("session.retry: {e}")))?;
            }
        }
        Ok(())
    }

    fn pattern_backoff(&self) -> PatternBackoff {
        PatternBackoff {
            max_attempts: self.max_attempts,
            backoff_pattern: self.backoff_pattern_ms.clone(),
            sustained_delay: self.sustained_delay_ms,
        }
    }

    /// Build the configured retry policy
    pub fn build_policy(&self) -> Arc<dyn RetryPolicy> {
        match self.strategy {
            RetryStrategy::Exponential => Arc::new(ExponentialBackoff {
                min_interval: Duration::from_millis(self.min_interval_ms),
                max_interval: Duration::from_millis(self.max_interval_ms),
                max_attempts: self.max_attempts,
                jitter: self.jitter,
            }),
            RetryStrategy::Pattern => Arc::new(self.pattern_backoff()),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        config
            .broker
            .client_id
            .get_or_insert_with(generate_client_id);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        if self.session.max_pending_requests == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.max_pending_requests must be at least 1".to_string(),
            ));
        }
        if self.session.connection_attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.connection_attempt_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.session.retry.validate()
    }

    /// Session client options described by `[session]`
    pub fn session_options(&self) -> SessionClientOptions {
        SessionClientOptions {
            max_pending_requests: self.session.max_pending_requests,
            overflow_strategy: self.session.overflow_strategy,
            connection_retry_policy: self.session.retry.build_policy(),
            retry_on_first_connect: self.session.retry_on_first_connect,
            connection_attempt_timeout: Duration::from_millis(
                self.session.connection_attempt_timeout_ms,
            ),
        }
    }

    /// CONNECT options described by `[broker]`, with credentials resolved
    /// from the environment
    pub fn connect_options(&self) -> ConnectOptions {
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id);
        ConnectOptions {
            client_id,
            clean_start: self.broker.clean_start,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            session_expiry_interval: self.broker.session_expiry_secs,
            username: self.get_mqtt_username(),
            password: self.get_mqtt_password(),
            user_properties: Vec::new(),
        }
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Configuration pointing at a local broker
    pub fn local(url: &str) -> Self {
        Self {
            broker: BrokerSection {
                url: url.to_string(),
                client_id: None,
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive(),
                session_expiry_secs: default_session_expiry(),
                clean_start: default_clean_start(),
            },
            session: SessionSection::default(),
        }
    }
}

impl BrokerSection {
    /// Parsed broker URL with its port, defaulting to 1883 (8883 for mqtts)
    pub fn endpoint(&self) -> Result<(String, u16, bool), ConfigError> {
        let url =
            Url::parse(&self.url).map_err(|_| ConfigError::InvalidBrokerUrl(self.url.clone()))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(ConfigError::InvalidBrokerUrl(format!(
                    "{}: unsupported scheme '{other}'",
                    self.url
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.url.clone()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
        Ok((host.to_string(), port, tls))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;
        if let Some(client_id) = &self.client_id {
            validate_client_id(client_id)?;
        }
        if self.session_expiry_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.session_expiry_secs must be non-zero so the session survives reconnects"
                    .to_string(),
            ));
        }
        if self.username_env.is_none() && self.password_env.is_some() {
            return Err(ConfigError::InvalidConfig(
                "broker.password_env requires broker.username_env".to_string(),
            ));
        }
        Ok(())
    }
}

fn generate_client_id() -> String {
    format!("mqtt-session-{}", uuid::Uuid::new_v4().simple())
}

/// Client identifiers are restricted to `[a-zA-Z0-9._-]+`, at most 128 chars
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || client_id.len() > 128 || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
