use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trailing retention window applied at every sync.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("malformed configuration: {0}")]
    Malformed(String),
}

/// Tunables of the sync engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retention_days: u32,
    /// Upper bound on cached rows per tenant; the newest ids are kept.
    pub max_cached_messages: usize,
    /// Upper bound on remembered deletions per tenant. Only ids at or below the
    /// sync cursor can be forgotten, lowest first.
    pub max_tombstones: usize,
    pub max_sync_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub notification_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            max_cached_messages: 5_000,
            max_tombstones: 1_000,
            max_sync_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_ms: 250,
            notification_queue_capacity: 64,
        }
    }
}

impl SyncConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid("retention_days must be > 0".into()));
        }
        if self.max_cached_messages == 0 {
            return Err(ConfigError::Invalid("max_cached_messages must be > 0".into()));
        }
        if self.max_tombstones == 0 {
            return Err(ConfigError::Invalid("max_tombstones must be > 0".into()));
        }
        if self.max_sync_attempts == 0 {
            return Err(ConfigError::Invalid("max_sync_attempts must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.notification_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notification_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Where and how to reach the portal API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must be set".into()));
        }
        if self.request_timeout_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms should be at least 1000ms".into(),
            ));
        }
        if self.connect_timeout_ms == 0 || self.connect_timeout_ms > self.request_timeout_ms {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be > 0 and <= request_timeout_ms".into(),
            ));
        }
        Ok(())
    }
}
