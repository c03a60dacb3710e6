//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (MURMUR_URL, MURMUR_CODEC)
//! - TOML configuration file
//! - Code, via [`ClientConfig::new`] and field updates

use anyhow::{Context, Result};
use murmur_protocol::CodecKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket endpoint, without the auth token.
    #[serde(default = "default_url")]
    pub url: String,

    /// Wire codec.
    #[serde(default = "default_codec")]
    pub codec: CodecKind,

    /// Query parameter carrying the auth token.
    #[serde(default = "default_token_param")]
    pub token_param: String,

    /// Reconnect configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// RPC configuration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Typing indicator configuration.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Outbound queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Reconnect configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect after abnormal closes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Dials before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// RPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Default call timeout in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub timeout_ms: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// How long an "is typing" indicator lives without a refresh.
    #[serde(default = "default_typing_expiry")]
    pub expiry_ms: u64,
}

/// Outbound queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Frames buffered while not connected; the oldest is dropped beyond this.
    #[serde(default = "default_max_queued_frames")]
    pub max_queued_frames: usize,
}

// Default value functions
fn default_url() -> String {
    std::env::var("MURMUR_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string())
}

fn default_codec() -> CodecKind {
    std::env::var("MURMUR_CODEC")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or_default()
}

fn default_token_param() -> String {
    "token".to_string()
}

fn default_true() -> bool {
    true
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_rpc_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_typing_expiry() -> u64 {
    3_000
}

fn default_max_queued_frames() -> usize {
    1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            codec: default_codec(),
            token_param: default_token_param(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rpc: RpcConfig::default(),
            typing: TypingConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rpc_timeout(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            expiry_ms: default_typing_expiry(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued_frames: default_max_queued_frames(),
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = ["murmur.toml", "~/.config/murmur/murmur.toml"];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check the configuration for values the client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] or [`ClientError::Config`].
    pub fn validate(&self) -> std::result::Result<(), ClientError> {
        self.endpoint()?;

        if self.token_param.is_empty() {
            return Err(ClientError::Config("token_param must not be empty".into()));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ClientError::Config("heartbeat.interval_ms must be > 0".into()));
        }
        if self.rpc.timeout_ms == 0 {
            return Err(ClientError::Config("rpc.timeout_ms must be > 0".into()));
        }
        if self.typing.expiry_ms == 0 {
            return Err(ClientError::Config("typing.expiry_ms must be > 0".into()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ClientError::Config("reconnect.base_delay_ms must be > 0".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ClientError::Config(format!(
                "reconnect.base_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.queue.max_queued_frames == 0 {
            return Err(ClientError::Config("queue.max_queued_frames must be > 0".into()));
        }
        Ok(())
    }

    /// The parsed endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] for empty, unparsable or non-ws URLs.
    pub fn endpoint(&self) -> std::result::Result<Url, ClientError> {
        if self.url.is_empty() {
            return Err(ClientError::InvalidUrl("url is empty".into()));
        }
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ClientError::InvalidUrl(format!(
                "unsupported scheme `{other}`, expected ws or wss"
            ))),
        }
    }

    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.reconnect.enabled,
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }

    #[must_use]
    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing.expiry_ms)
    }
}
