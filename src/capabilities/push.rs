use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::metrics::SyncMetrics;
use crate::model::Message;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PushError {
    #[error("notification dispatch not available: {reason}")]
    NotAvailable { reason: String },

    #[error("dispatch failed: {reason}")]
    DispatchFailed {
        reason: String,
        #[serde(default)]
        is_retryable: bool,
    },

    #[error("notification queue is full")]
    QueueFull,

    #[error("notification worker has stopped")]
    Closed,
}

impl PushError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::DispatchFailed { is_retryable, .. } => *is_retryable,
            Self::QueueFull => true,
            Self::NotAvailable { .. } | Self::Closed => false,
        }
    }

    #[must_use]
    pub fn dispatch_failed(reason: impl Into<String>) -> Self {
        Self::DispatchFailed {
            reason: reason.into(),
            is_retryable: false,
        }
    }
}

/// Payload sent to the dispatch endpoint for a due scheduled message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledNotification {
    pub title: Option<String>,
    pub content: Option<String>,
    pub classid: Option<String>,
    pub sectionid: Option<String>,
    pub branchid: String,
}

impl ScheduledNotification {
    pub fn from_message(message: &Message, branchid: &str) -> Self {
        Self {
            title: message.title.clone(),
            content: message.content.clone(),
            classid: message.classid.clone(),
            sectionid: message.sectionid.clone(),
            branchid: branchid.to_string(),
        }
    }
}

/// Fires a notification for a scheduled message. Delivery is not tracked.
#[async_trait]
pub trait PushDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, notification: &ScheduledNotification) -> Result<(), PushError>;
}

enum Command {
    Dispatch(ScheduledNotification),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front of a background dispatch worker.
///
/// Enqueueing never waits on the network and never fails the caller: a full
/// queue drops the notification with a warning, and dispatch errors are only
/// logged and counted.
#[derive(Clone)]
pub struct NotificationTrigger {
    tx: mpsc::Sender<Command>,
    metrics: Arc<SyncMetrics>,
}

impl NotificationTrigger {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(
        dispatcher: Arc<dyn PushDispatcher>,
        capacity: usize,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self, PushError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|e| PushError::NotAvailable {
                reason: e.to_string(),
            })?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        handle.spawn(run_worker(dispatcher, rx, Arc::clone(&metrics)));
        Ok(Self { tx, metrics })
    }

    pub fn notify_scheduled(&self, message: &Message, branchid: &str) -> Result<(), PushError> {
        self.enqueue(ScheduledNotification::from_message(message, branchid))
    }

    pub fn enqueue(&self, notification: ScheduledNotification) -> Result<(), PushError> {
        match self.tx.try_send(Command::Dispatch(notification)) {
            Ok(()) => {
                SyncMetrics::incr(&self.metrics.notifications_enqueued);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("notification queue full, dropping notification");
                SyncMetrics::incr(&self.metrics.notifications_dropped);
                Err(PushError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("notification worker stopped, dropping notification");
                SyncMetrics::incr(&self.metrics.notifications_dropped);
                Err(PushError::Closed)
            }
        }
    }

    /// Resolves once every notification queued before this call was attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_worker(
    dispatcher: Arc<dyn PushDispatcher>,
    mut rx: mpsc::Receiver<Command>,
    metrics: Arc<SyncMetrics>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Dispatch(notification) => match dispatcher.dispatch(&notification).await {
                Ok(()) => {
                    debug!(branchid = %notification.branchid, "notification dispatched");
                    SyncMetrics::incr(&metrics.notifications_dispatched);
                }
                Err(e) => {
                    warn!(
                        branchid = %notification.branchid,
                        error = %e,
                        retryable = e.is_retryable(),
                        "notification dispatch failed"
                    );
                    SyncMetrics::incr(&metrics.notifications_failed);
                }
            },
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("notification worker exiting");
}
