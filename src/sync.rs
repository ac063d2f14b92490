//! Per-tenant sync engine.
//!
//! One [`FeedSync`] serves every tenant of the process. Each tenant gets a
//! slot holding an async mutex that serializes its cache read-modify-write
//! cycles, and a watch channel carrying the latest published feed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheError, CacheStore};
use crate::capabilities::{
    FeedService, HttpError, KeyNamespace, KeyValueStore, KvError, KvKey, NotificationTrigger,
    PushDispatcher, PushError,
};
use crate::config::{ConfigError, SyncConfig};
use crate::merge;
use crate::metrics::SyncMetrics;
use crate::model::{DeltaFeed, Message, MessageId, TenantContext};
use crate::{calculate_retry_delay, generate_jitter};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("remote feed unavailable: {0}")]
    Remote(#[from] HttpError),

    #[error("local store failed: {0}")]
    Store(KvError),

    #[error("corrupted cache entry '{key}': {reason}")]
    CorruptedCache { key: String, reason: String },

    #[error("invalid tenant '{tenant}': {reason}")]
    InvalidTenant { tenant: String, reason: String },

    #[error("decision on topic {topic} was not accepted")]
    DecisionRejected {
        topic: String,
        status: Option<String>,
    },

    #[error("sync gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("notification worker unavailable: {0}")]
    Notifications(#[from] PushError),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_remote(&self) -> bool {
        match self {
            SyncError::Remote(_) => true,
            SyncError::RetriesExhausted { last, .. } => last.is_remote(),
            _ => false,
        }
    }
}

impl From<CacheError> for SyncError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Store(e) => SyncError::Store(e),
            CacheError::Corrupted { key, reason } => SyncError::CorruptedCache { key, reason },
            CacheError::InvalidTenant { tenant, reason } => {
                SyncError::InvalidTenant { tenant, reason }
            }
        }
    }
}

/// Outcome of one successful sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Cursor sent to the server.
    pub since: MessageId,
    /// Cursor stored for the next cycle.
    pub cursor: MessageId,
    pub fetched: usize,
    pub added: usize,
    pub expired: usize,
    pub suppressed: usize,
    pub truncated: usize,
    pub notified: usize,
    /// False when the merged list matched the stored one and no write happened.
    pub persisted: bool,
    pub total: usize,
}

pub(crate) struct TenantSlot {
    pub(crate) lock: Mutex<()>,
    feed: watch::Sender<Arc<Vec<Message>>>,
}

impl TenantSlot {
    fn new() -> Self {
        let (feed, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            lock: Mutex::new(()),
            feed,
        }
    }

    pub(crate) fn publish(&self, messages: Vec<Message>) {
        self.feed.send_replace(Arc::new(messages));
    }
}

pub struct FeedSync<S, F> {
    pub(crate) cache: CacheStore<S>,
    pub(crate) remote: Arc<F>,
    pub(crate) notifications: NotificationTrigger,
    pub(crate) config: SyncConfig,
    pub(crate) metrics: Arc<SyncMetrics>,
    tenants: RwLock<HashMap<String, Arc<TenantSlot>>>,
}

impl<S, F> FeedSync<S, F>
where
    S: KeyValueStore,
    F: FeedService,
{
    /// Builds the engine and starts its notification worker on the current
    /// tokio runtime.
    pub fn new(
        store: Arc<S>,
        remote: Arc<F>,
        dispatcher: Arc<dyn PushDispatcher>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let metrics = Arc::new(SyncMetrics::new());
        let notifications = NotificationTrigger::spawn(
            dispatcher,
            config.notification_queue_capacity,
            Arc::clone(&metrics),
        )?;
        Ok(Self {
            cache: CacheStore::new(store),
            remote,
            notifications,
            config,
            metrics,
            tenants: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &CacheStore<S> {
        &self.cache
    }

    pub fn notifications(&self) -> &NotificationTrigger {
        &self.notifications
    }

    async fn existing_slot(&self, tenant: &str) -> Option<Arc<TenantSlot>> {
        self.tenants.read().await.get(tenant).map(Arc::clone)
    }

    /// Callers validate `tenant` first; slots are never removed.
    pub(crate) async fn slot(&self, tenant: &str) -> Arc<TenantSlot> {
        if let Some(slot) = self.existing_slot(tenant).await {
            return slot;
        }
        let mut tenants = self.tenants.write().await;
        Arc::clone(
            tenants
                .entry(tenant.to_string())
                .or_insert_with(|| Arc::new(TenantSlot::new())),
        )
    }

    pub(crate) fn check_tenant(ctx: &TenantContext) -> Result<(), SyncError> {
        ctx.validate().map_err(|e| SyncError::InvalidTenant {
            tenant: ctx.branchid.escape_debug().to_string(),
            reason: e.to_string(),
        })
    }

    /// Latest published feed for the tenant, newest first. Empty for a
    /// tenant nothing was published for.
    pub async fn feed(&self, tenant: &str) -> Arc<Vec<Message>> {
        match self.existing_slot(tenant).await {
            Some(slot) => {
                let current = slot.feed.borrow().clone();
                current
            }
            None => Arc::default(),
        }
    }

    pub async fn subscribe(
        &self,
        tenant: &str,
    ) -> Result<watch::Receiver<Arc<Vec<Message>>>, SyncError> {
        KvKey::new(KeyNamespace::Messages, tenant).map_err(|e| SyncError::InvalidTenant {
            tenant: tenant.escape_debug().to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.slot(tenant).await.feed.subscribe())
    }

    pub async fn unread_count(&self, tenant: &str) -> usize {
        self.feed(tenant).await.iter().filter(|m| !m.is_read()).count()
    }

    /// Publishes the persisted cache without contacting the server.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
    pub async fn hydrate(&self, ctx: &TenantContext) -> Result<usize, SyncError> {
        Self::check_tenant(ctx)?;
        let tenant = ctx.tenant_key();
        let slot = self.slot(tenant).await;
        let _guard = slot.lock.lock().await;

        let messages = self.cache.load(tenant).await.map_err(|e| self.storage_failure(e))?;
        let count = messages.len();
        slot.publish(messages);
        debug!(count, "feed hydrated from cache");
        Ok(count)
    }

    pub async fn sync(&self, ctx: &TenantContext) -> Result<SyncReport, SyncError> {
        self.sync_at(ctx, Local::now().date_naive()).await
    }

    /// One sync cycle with `today` as the retention reference date.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid, cycle = %Uuid::new_v4()))]
    pub async fn sync_at(
        &self,
        ctx: &TenantContext,
        today: NaiveDate,
    ) -> Result<SyncReport, SyncError> {
        Self::check_tenant(ctx)?;
        SyncMetrics::incr(&self.metrics.syncs_started);

        match self.run_cycle(ctx, today).await {
            Ok(report) => {
                SyncMetrics::incr(&self.metrics.syncs_succeeded);
                info!(
                    since = %report.since,
                    fetched = report.fetched,
                    added = report.added,
                    expired = report.expired,
                    total = report.total,
                    "sync complete"
                );
                Ok(report)
            }
            Err(e) => {
                SyncMetrics::incr(&self.metrics.syncs_failed);
                warn!(error = %e, retryable = e.is_retryable(), "sync failed, cache untouched");
                Err(e)
            }
        }
    }

    async fn run_cycle(
        &self,
        ctx: &TenantContext,
        today: NaiveDate,
    ) -> Result<SyncReport, SyncError> {
        let tenant = ctx.tenant_key();
        let slot = self.slot(tenant).await;
        let _guard = slot.lock.lock().await;

        let cached = self.cache.load(tenant).await.map_err(|e| self.storage_failure(e))?;
        let tombstones = self
            .cache
            .load_tombstones(tenant)
            .await
            .map_err(|e| self.storage_failure(e))?;
        let stored_cursor = self
            .cache
            .load_cursor(tenant)
            .await
            .map_err(|e| self.storage_failure(e))?;
        let since = merge::high_water_mark(&cached, stored_cursor);

        let DeltaFeed {
            new_messages,
            scheduled_messages,
        } = self.remote.delta_feed(ctx, since).await?;
        let fetched = new_messages.len();
        let cursor = merge::advance_cursor(since, &new_messages);
        SyncMetrics::add(&self.metrics.messages_fetched, fetched);

        let cutoff = merge::retention_cutoff(today, self.config.retention_days);
        let merged = merge::reconcile(
            &cached,
            new_messages,
            &tombstones,
            cutoff,
            self.config.max_cached_messages,
        );
        SyncMetrics::add(&self.metrics.messages_expired, merged.expired);
        SyncMetrics::add(&self.metrics.messages_suppressed, merged.suppressed);

        let persisted = merged.messages != cached;
        if persisted {
            self.cache
                .save(tenant, &merged.messages)
                .await
                .map_err(|e| self.storage_failure(e))?;
            SyncMetrics::incr(&self.metrics.cache_writes);
        } else {
            debug!("merged feed unchanged, skipping write");
        }

        // Message list first: a stale cursor only refetches rows.
        if cursor > stored_cursor {
            self.cache
                .save_cursor(tenant, cursor)
                .await
                .map_err(|e| self.storage_failure(e))?;
        }
        self.prune_tombstones(tenant, tombstones, cursor).await?;

        let mut notified = 0;
        for message in merge::due_notifications(&merged.messages, &scheduled_messages) {
            if self.notifications.notify_scheduled(message, tenant).is_ok() {
                notified += 1;
            }
        }

        let report = SyncReport {
            since,
            cursor,
            fetched,
            added: merged.added,
            expired: merged.expired,
            suppressed: merged.suppressed,
            truncated: merged.truncated,
            notified,
            persisted,
            total: merged.messages.len(),
        };
        slot.publish(merged.messages);
        Ok(report)
    }

    /// Runs [`sync`](Self::sync) until it succeeds, fails permanently, or the
    /// attempt budget is spent.
    pub async fn sync_with_retry(&self, ctx: &TenantContext) -> Result<SyncReport, SyncError> {
        let max_attempts = self.config.max_sync_attempts;
        let mut attempt = 0u32;
        loop {
            let error = match self.sync(ctx).await {
                Ok(report) => return Ok(report),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= max_attempts {
                error!(attempts = attempt, error = %error, "sync retries exhausted");
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay_ms = calculate_retry_delay(
                attempt - 1,
                self.config.base_backoff_ms,
                self.config.max_backoff_ms,
                generate_jitter(self.config.jitter_ms),
            );
            SyncMetrics::incr(&self.metrics.sync_retries);
            warn!(attempt, delay_ms, error = %error, "sync failed, retrying");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Saves the tombstone set capped against `cursor`, if that forgets any.
    pub(crate) async fn prune_tombstones(
        &self,
        tenant: &str,
        mut tombstones: BTreeSet<MessageId>,
        cursor: MessageId,
    ) -> Result<(), SyncError> {
        let limit = self.config.max_tombstones;
        if tombstones.len() <= limit {
            return Ok(());
        }
        let forgotten = merge::cap_tombstones(&mut tombstones, limit, cursor);
        if forgotten > 0 {
            self.cache
                .save_tombstones(tenant, &tombstones)
                .await
                .map_err(|e| self.storage_failure(e))?;
            debug!(forgotten, kept = tombstones.len(), "tombstones pruned");
        }
        if tombstones.len() > limit {
            warn!(
                kept = tombstones.len(),
                limit, "tombstones above the cursor exceed the limit"
            );
        }
        Ok(())
    }

    pub(crate) fn storage_failure(&self, e: CacheError) -> SyncError {
        if matches!(e, CacheError::Store(_) | CacheError::Corrupted { .. }) {
            SyncMetrics::incr(&self.metrics.storage_errors);
            error!(error = %e, "cache access failed");
        }
        e.into()
    }
}

impl<S, F> FeedSync<S, F>
where
    S: KeyValueStore + 'static,
    F: FeedService + 'static,
{
    /// Background driver: `sync_with_retry` every `every`. Failures are logged
    /// and the loop keeps going until the handle is aborted.
    pub fn spawn_periodic_sync(
        self: &Arc<Self>,
        ctx: TenantContext,
        every: Duration,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sync_with_retry(&ctx).await {
                    error!(tenant = %ctx.branchid, error = %e, "periodic sync failed");
                }
            }
        })
    }
}
