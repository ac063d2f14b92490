//! Per-tenant message feed synchronization for the school portal app.
//!
//! [`FeedSync`] pulls incremental deltas from the portal, merges them into a
//! durable per-branch cache, applies the trailing retention window and keeps
//! read receipts, deletions and approval decisions consistent with the
//! server. Hosts supply a [`KeyValueStore`], a [`FeedService`] and a
//! [`PushDispatcher`]; HTTP and on-disk implementations ship behind the
//! `http` and `sqlite` features.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod mutations;
pub mod offline_store;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use cache::{CacheError, CacheStore};
pub use capabilities::{
    FeedService, HttpError, KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore,
    NotificationTrigger, PushDispatcher, PushError, ScheduledNotification,
};
pub use config::{ConfigError, RemoteConfig, SyncConfig};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use model::{
    Decision, DecisionAck, DeltaFeed, Message, MessageId, ReadReceipt, TenantContext, TopicId,
};
pub use mutations::MutationOutcome;
pub use offline_store::FileKvStore;
pub use sync::{FeedSync, SyncError, SyncReport};

#[cfg(feature = "http")]
pub use capabilities::HttpFeedService;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use offline_store::SqliteKvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Rejected,
    ActionNotApplied,
    Storage,
    Serialization,
    Deserialization,
    FeatureUnavailable,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Rejected => "REJECTED",
            Self::ActionNotApplied => "ACTION_NOT_APPLIED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::RateLimited
            | Self::ActionNotApplied
            | Self::Storage => ErrorSeverity::Transient,

            Self::Serialization | Self::Deserialization | Self::Internal => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Rejected
            | Self::FeatureUnavailable
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::Storage
                | Self::Conflict
                | Self::ActionNotApplied
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && matches!(self.severity, ErrorSeverity::Transient)
    }

    /// A read, delete or decision the server did not acknowledge. Local state
    /// is unchanged.
    #[must_use]
    pub fn action_not_applied(error: &SyncError) -> Self {
        let severity = if error.is_retryable() {
            ErrorSeverity::Transient
        } else {
            ErrorSeverity::Permanent
        };
        AppError::new(ErrorKind::ActionNotApplied, "Action not applied")
            .with_severity(severity)
            .with_internal(error.to_string())
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => {
                "Too many requests. Please wait a moment and try again.".into()
            }
            ErrorKind::Rejected => "The request was not accepted.".into(),
            ErrorKind::ActionNotApplied => "Action not applied, try again.".into(),
            ErrorKind::Storage => {
                "Unable to save messages on this device. Please free up some storage space.".into()
            }
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::FeatureUnavailable => self.message.clone(),
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Network,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let internal = e.to_string();
        let error = match &e {
            HttpError::Timeout { .. } => AppError::new(ErrorKind::Timeout, "Request timed out"),
            HttpError::ConnectionError { .. } => {
                AppError::new(ErrorKind::Network, "Connection failed")
            }
            HttpError::HttpStatus {
                status, message, ..
            } => AppError::from_http_status(*status, Some(message.as_bytes())),
            HttpError::InvalidResponse { .. } => {
                AppError::new(ErrorKind::Deserialization, "Unexpected server response")
            }
            HttpError::InvalidUrl { .. } | HttpError::InvalidRequest { .. } => {
                AppError::new(ErrorKind::Internal, "Invalid request")
            }
        };
        match e.request_id() {
            Some(request_id) => error
                .with_internal(internal)
                .with_context("request_id", request_id),
            None => error.with_internal(internal),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        let internal = e.to_string();
        match e {
            SyncError::Remote(http) => AppError::from(http),
            SyncError::Store(_) => {
                AppError::new(ErrorKind::Storage, "Local storage failed").with_internal(internal)
            }
            SyncError::CorruptedCache { key, .. } => {
                AppError::new(ErrorKind::Deserialization, "Cached messages are unreadable")
                    .with_internal(internal)
                    .with_context("key", key)
            }
            SyncError::InvalidTenant { .. } => {
                AppError::new(ErrorKind::Validation, "Unknown school branch")
                    .with_internal(internal)
            }
            SyncError::DecisionRejected { topic, .. } => {
                AppError::new(ErrorKind::Rejected, "Decision rejected")
                    .with_internal(internal)
                    .with_context("topic", topic)
            }
            SyncError::RetriesExhausted { attempts, last } => {
                AppError::from(*last).with_context("attempts", attempts.to_string())
            }
            SyncError::Config(_) => {
                AppError::new(ErrorKind::Internal, "Invalid configuration").with_internal(internal)
            }
            SyncError::Notifications(_) => {
                AppError::new(ErrorKind::FeatureUnavailable, "Notifications are unavailable")
                    .with_internal(internal)
            }
        }
    }
}

/// Exponential backoff capped at `max_ms`, plus `jitter_ms`.
#[must_use]
pub fn calculate_retry_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exponential.min(max_ms);
    capped.saturating_add(jitter_ms)
}

/// Pseudo-random value in `0..max_ms`; zero when `max_ms` is zero.
#[must_use]
pub fn generate_jitter(max_ms: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    if max_ms == 0 {
        return 0;
    }
    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos().into())
            .unwrap_or(0),
    );
    hasher.finish() % max_ms
}
