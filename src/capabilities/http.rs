use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::{Decision, DecisionAck, DeltaFeed, MessageId, ReadReceipt, TenantContext, TopicId};

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_ERROR_BODY_CHARS: usize = 256;

pub const DELTA_FEED_PATH: &str = "delta-feed";
pub const MARK_READ_PATH: &str = "mark-read";
pub const DELETE_MESSAGE_PATH: &str = "delete-message";
pub const DECIDE_PATH: &str = "decide";
pub const DISPATCH_NOTIFICATION_PATH: &str = "dispatch-notification";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        let parsed = Self::validate(&url)?;

        let scheme = parsed.scheme().to_lowercase();
        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "missing host".to_string(),
            })?
            .to_lowercase();

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolves an endpoint path below this URL, treating it as a directory.
    pub fn join(&self, path: &str) -> Result<Url, HttpError> {
        let mut base = self.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|b| b.join(path.trim_start_matches('/')))
            .map_err(|e| HttpError::InvalidUrl {
                url: Self::truncate_url(&base),
                reason: e.to_string(),
            })
    }

    fn validate(url: &str) -> Result<Url, HttpError> {
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url: String::new(),
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!("URL exceeds maximum length of {} bytes", MAX_URL_LENGTH),
            });
        }

        let parsed = Url::parse(url.trim()).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: format!(
                    "invalid scheme '{}', only 'http' and 'https' are allowed",
                    scheme
                ),
            });
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "URL must have a host".to_string(),
            });
        }

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(parsed)
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let mut end = 100;
            while !url.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &url[..end])
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
        retryable: bool,
    },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } => true,
            HttpError::ConnectionError { .. } => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            HttpError::Timeout { request_id, .. } => Some(request_id),
            HttpError::HttpStatus { request_id, .. } => Some(request_id),
            HttpError::InvalidResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn from_status(status: u16, body: &str, request_id: impl Into<String>) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP error: {status}")
        } else {
            body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect()
        };
        HttpError::HttpStatus {
            status,
            message,
            request_id: request_id.into(),
            retryable: is_retryable_status(status),
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Remote side of the message feed.
///
/// Every call either returns the server's acknowledgment or an error; the
/// engine never touches local state until the acknowledgment is in hand.
#[async_trait]
pub trait FeedService: Send + Sync {
    /// Messages with `id > since` visible to this identity, plus scheduled
    /// messages that have just become due.
    async fn delta_feed(&self, ctx: &TenantContext, since: MessageId) -> Result<DeltaFeed, HttpError>;

    async fn mark_read(&self, id: MessageId, role: &str) -> Result<ReadReceipt, HttpError>;

    async fn delete_message(&self, id: MessageId, ctx: &TenantContext) -> Result<(), HttpError>;

    async fn decide(
        &self,
        topic: &TopicId,
        decision: Decision,
        ctx: &TenantContext,
    ) -> Result<DecisionAck, HttpError>;
}

#[cfg(feature = "http")]
pub use self::client::HttpFeedService;

#[cfg(feature = "http")]
mod client {
    use super::*;
    use crate::capabilities::push::{PushDispatcher, PushError, ScheduledNotification};
    use crate::config::RemoteConfig;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use std::time::Duration;
    use tracing::{debug, instrument, warn};
    use uuid::Uuid;

    const REQUEST_ID_HEADER: &str = "x-request-id";

    /// JSON-over-HTTPS client for the portal feed endpoints.
    #[derive(Clone)]
    pub struct HttpFeedService {
        client: reqwest::Client,
        base: ValidatedUrl,
        timeout_ms: u64,
    }

    impl HttpFeedService {
        pub fn new(config: &RemoteConfig) -> Result<Self, HttpError> {
            config.validate().map_err(|e| HttpError::InvalidRequest {
                reason: e.to_string(),
            })?;
            let base = ValidatedUrl::new(config.base_url.as_str())?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_millis(config.request_timeout_ms))
                .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
                .user_agent(config.user_agent.as_str())
                .build()
                .map_err(|e| HttpError::InvalidRequest {
                    reason: e.to_string(),
                })?;
            Ok(Self {
                client,
                base,
                timeout_ms: config.request_timeout_ms,
            })
        }

        pub fn base_url(&self) -> &ValidatedUrl {
            &self.base
        }

        fn map_transport(&self, e: reqwest::Error, request_id: &str) -> HttpError {
            if e.is_timeout() {
                HttpError::Timeout {
                    timeout_ms: self.timeout_ms,
                    request_id: request_id.to_string(),
                }
            } else if e.is_decode() {
                HttpError::InvalidResponse {
                    reason: e.to_string(),
                    request_id: request_id.to_string(),
                }
            } else if e.is_builder() {
                HttpError::InvalidRequest {
                    reason: e.to_string(),
                }
            } else {
                HttpError::ConnectionError {
                    host: self.base.host().to_string(),
                    message: e.to_string(),
                }
            }
        }

        async fn send(
            &self,
            request: reqwest::RequestBuilder,
            request_id: &str,
        ) -> Result<reqwest::Response, HttpError> {
            let response = request
                .header(REQUEST_ID_HEADER, request_id)
                .send()
                .await
                .map_err(|e| self.map_transport(e, request_id))?;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            let error = HttpError::from_status(status.as_u16(), &body, request_id);
            warn!(status = status.as_u16(), request_id, "feed request rejected");
            Err(error)
        }

        async fn send_json<T: DeserializeOwned>(
            &self,
            request: reqwest::RequestBuilder,
            request_id: &str,
        ) -> Result<T, HttpError> {
            let response = self.send(request, request_id).await?;
            response
                .json::<T>()
                .await
                .map_err(|e| HttpError::InvalidResponse {
                    reason: e.to_string(),
                    request_id: request_id.to_string(),
                })
        }
    }

    #[async_trait]
    impl FeedService for HttpFeedService {
        #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
        async fn delta_feed(
            &self,
            ctx: &TenantContext,
            since: MessageId,
        ) -> Result<DeltaFeed, HttpError> {
            let request_id = Uuid::new_v4().to_string();
            let url = self.base.join(DELTA_FEED_PATH)?;
            let enrollment_ids = ctx.enrollment_ids.join(",");
            let since = since.to_string();
            let request = self.client.get(url).query(&[
                ("enrollmentIds", enrollment_ids.as_str()),
                ("sinceId", since.as_str()),
                ("role", ctx.role.as_str()),
                ("owner", ctx.owner.as_str()),
                ("branchid", ctx.branchid.as_str()),
            ]);
            let feed: DeltaFeed = self.send_json(request, &request_id).await?;
            debug!(
                new = feed.new_messages.len(),
                scheduled = feed.scheduled_messages.len(),
                "delta feed received"
            );
            Ok(feed)
        }

        #[instrument(skip(self))]
        async fn mark_read(&self, id: MessageId, role: &str) -> Result<ReadReceipt, HttpError> {
            let request_id = Uuid::new_v4().to_string();
            let url = self.base.join(MARK_READ_PATH)?;
            let request = self.client.post(url).json(&json!({ "id": id, "role": role }));
            self.send_json(request, &request_id).await
        }

        #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
        async fn delete_message(&self, id: MessageId, ctx: &TenantContext) -> Result<(), HttpError> {
            let request_id = Uuid::new_v4().to_string();
            let url = self.base.join(DELETE_MESSAGE_PATH)?;
            let request = self.client.post(url).json(&json!({
                "id": id,
                "owner": ctx.owner,
                "branchid": ctx.branchid,
            }));
            self.send(request, &request_id).await.map(|_| ())
        }

        #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
        async fn decide(
            &self,
            topic: &TopicId,
            decision: Decision,
            ctx: &TenantContext,
        ) -> Result<DecisionAck, HttpError> {
            let request_id = Uuid::new_v4().to_string();
            let url = self.base.join(DECIDE_PATH)?;
            let request = self.client.post(url).json(&json!({
                "topicid": topic,
                "decision": decision,
                "owner": ctx.owner,
                "branchid": ctx.branchid,
            }));
            self.send_json(request, &request_id).await
        }
    }

    #[async_trait]
    impl PushDispatcher for HttpFeedService {
        async fn dispatch(&self, notification: &ScheduledNotification) -> Result<(), PushError> {
            let request_id = Uuid::new_v4().to_string();
            let url = self
                .base
                .join(DISPATCH_NOTIFICATION_PATH)
                .map_err(|e| PushError::DispatchFailed {
                    reason: e.to_string(),
                    is_retryable: false,
                })?;
            let request = self.client.post(url).json(notification);
            self.send(request, &request_id)
                .await
                .map(|_| ())
                .map_err(|e| PushError::DispatchFailed {
                    is_retryable: e.is_retryable(),
                    reason: e.to_string(),
                })
        }
    }
}
