#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Notify;
use message_sync::capabilities::{KvResult, StorageErrorCode};
use message_sync::{
    Decision, DecisionAck, DeltaFeed, FeedService, FeedSync, HttpError, KeyNamespace,
    KeyValueStore, KvError, KvKey, MemoryKvStore, Message, MessageId, PushDispatcher, PushError,
    ReadReceipt, ScheduledNotification, SyncConfig, TenantContext, TopicId,
};

pub const READ_TIME: &str = "2024-01-31 10:00:00";

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
}

pub fn ctx(branch: &str) -> TenantContext {
    TenantContext::new(branch, "parent-17", "parent", ["enr-1", "enr-2"])
}

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        base_backoff_ms: 1,
        max_backoff_ms: 4,
        jitter_ms: 0,
        max_sync_attempts: 3,
        ..Default::default()
    }
}

pub fn msg(id: u64, day: &str) -> Message {
    Message::new(id, format!("{day} 09:30:00"))
}

pub fn ids(messages: &[Message]) -> Vec<u64> {
    messages.iter().map(|m| m.id.get()).collect()
}

/// In-process portal. Serves `id > since` per branch unless told to ignore
/// the cursor, and fails on demand.
#[derive(Default)]
pub struct FakeFeed {
    server: Mutex<HashMap<String, Vec<Message>>>,
    scheduled: Mutex<HashMap<String, Vec<Message>>>,
    cursors: Mutex<Vec<MessageId>>,
    hold: Mutex<Option<FeedHold>>,
    pub ignore_cursor: AtomicBool,
    pub feed_failures: AtomicU32,
    pub failure_status: AtomicU16,
    pub fail_mutations: AtomicBool,
    pub reject_decisions: AtomicBool,
    pub mutation_calls: AtomicU32,
}

impl FakeFeed {
    pub fn new() -> Self {
        let feed = Self::default();
        feed.failure_status.store(503, Ordering::SeqCst);
        feed
    }

    pub fn publish(&self, branch: &str, messages: impl IntoIterator<Item = Message>) {
        self.server
            .lock()
            .unwrap()
            .entry(branch.to_string())
            .or_default()
            .extend(messages);
    }

    /// Swaps the server row with the same id.
    pub fn replace(&self, branch: &str, message: Message) {
        if let Some(all) = self.server.lock().unwrap().get_mut(branch) {
            for row in all.iter_mut().filter(|m| m.id == message.id) {
                *row = message.clone();
            }
        }
    }

    /// Scheduled messages are handed out once, with the next delta.
    pub fn schedule(&self, branch: &str, messages: impl IntoIterator<Item = Message>) {
        self.scheduled
            .lock()
            .unwrap()
            .entry(branch.to_string())
            .or_default()
            .extend(messages);
    }

    pub fn fail_next(&self, times: u32, status: u16) {
        self.failure_status.store(status, Ordering::SeqCst);
        self.feed_failures.store(times, Ordering::SeqCst);
    }

    /// Parks the next `delta_feed` call until `release` is notified.
    pub fn hold_next_delta(&self) -> FeedHold {
        let hold = FeedHold {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        *self.hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn cursors(&self) -> Vec<u64> {
        self.cursors.lock().unwrap().iter().map(|c| c.get()).collect()
    }

    fn mutation_gate(&self) -> Result<(), HttpError> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(HttpError::ConnectionError {
                host: "portal.test".into(),
                message: "network unreachable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FeedService for FakeFeed {
    async fn delta_feed(&self, ctx: &TenantContext, since: MessageId) -> Result<DeltaFeed, HttpError> {
        self.cursors.lock().unwrap().push(since);

        let hold = self.hold.lock().unwrap().take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }

        let remaining = self.feed_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.feed_failures.store(remaining - 1, Ordering::SeqCst);
            let status = self.failure_status.load(Ordering::SeqCst);
            return Err(HttpError::from_status(status, "injected failure", "test-request"));
        }

        let ignore_cursor = self.ignore_cursor.load(Ordering::SeqCst);
        let new_messages = self
            .server
            .lock()
            .unwrap()
            .get(&ctx.branchid)
            .map(|all| {
                all.iter()
                    .filter(|m| ignore_cursor || m.id > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let scheduled_messages = self
            .scheduled
            .lock()
            .unwrap()
            .remove(&ctx.branchid)
            .unwrap_or_default();

        Ok(DeltaFeed {
            new_messages,
            scheduled_messages,
        })
    }

    async fn mark_read(&self, _id: MessageId, _role: &str) -> Result<ReadReceipt, HttpError> {
        self.mutation_gate()?;
        Ok(ReadReceipt {
            confirmed_read_time: READ_TIME.to_string(),
        })
    }

    // Rows stay on the server, so a replayed delta can still carry them.
    async fn delete_message(&self, _id: MessageId, _ctx: &TenantContext) -> Result<(), HttpError> {
        self.mutation_gate()
    }

    async fn decide(
        &self,
        _topic: &TopicId,
        decision: Decision,
        _ctx: &TenantContext,
    ) -> Result<DecisionAck, HttpError> {
        self.mutation_gate()?;
        Ok(DecisionAck {
            accepted: !self.reject_decisions.load(Ordering::SeqCst),
            status: Some(decision.as_str().to_string()),
        })
    }
}

#[derive(Clone)]
pub struct FeedHold {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<ScheduledNotification>>,
    pub fail: AtomicBool,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<ScheduledNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushDispatcher for RecordingDispatcher {
    async fn dispatch(&self, notification: &ScheduledNotification) -> Result<(), PushError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PushError::dispatch_failed("push gateway returned 502"));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Memory store with switchable read and write failures.
#[derive(Default)]
pub struct FailableStore {
    inner: MemoryKvStore,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FailableStore {
    pub async fn raw(&self, namespace: KeyNamespace, tenant: &str) -> Option<Vec<u8>> {
        let key = KvKey::new(namespace, tenant).unwrap();
        self.inner.get(&key).await.unwrap()
    }

    pub async fn put_raw(&self, namespace: KeyNamespace, tenant: &str, value: &[u8]) {
        let key = KvKey::new(namespace, tenant).unwrap();
        self.inner.set(&key, value.to_vec()).await.unwrap();
    }
}

#[async_trait]
impl KeyValueStore for FailableStore {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(KvError::storage(StorageErrorCode::IoError, "injected read failure"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::storage(StorageErrorCode::DiskFull, "injected write failure"));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &KvKey) -> KvResult<bool> {
        self.inner.delete(key).await
    }
}

pub struct Harness {
    pub engine: Arc<FeedSync<FailableStore, FakeFeed>>,
    pub store: Arc<FailableStore>,
    pub feed: Arc<FakeFeed>,
    pub push: Arc<RecordingDispatcher>,
}

/// Must be called inside a tokio runtime.
pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: SyncConfig) -> Harness {
    let store = Arc::new(FailableStore::default());
    let feed = Arc::new(FakeFeed::new());
    let push = Arc::new(RecordingDispatcher::default());
    let engine = FeedSync::new(store.clone(), feed.clone(), push.clone(), config).unwrap();
    Harness {
        engine: Arc::new(engine),
        store,
        feed,
        push,
    }
}
