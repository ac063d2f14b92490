//! Server-acknowledged edits to cached messages.
//!
//! Each operation calls the remote first and only then enters the tenant's
//! critical section to reload, edit, persist and publish the cache. A remote
//! failure leaves local state exactly as it was.

use tracing::{debug, instrument, warn};

use crate::capabilities::{FeedService, KeyValueStore};
use crate::merge;
use crate::metrics::SyncMetrics;
use crate::model::{Decision, Message, MessageId, TenantContext, TopicId, READ_MARKER};
use crate::sync::{FeedSync, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Cached messages changed by the edit. Zero when the target was not
    /// cached, which is not an error.
    pub affected: usize,
}

impl<S, F> FeedSync<S, F>
where
    S: KeyValueStore,
    F: FeedService,
{
    #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
    pub async fn mark_read(
        &self,
        ctx: &TenantContext,
        id: MessageId,
    ) -> Result<MutationOutcome, SyncError> {
        Self::check_tenant(ctx)?;
        let result = match self.remote.mark_read(id, &ctx.role).await {
            Ok(receipt) => {
                let read_time = receipt.confirmed_read_time;
                self.rewrite(ctx.tenant_key(), move |messages| {
                    let mut affected = 0;
                    for message in messages.iter_mut().filter(|m| m.id == id) {
                        message.isread = Some(READ_MARKER.to_string());
                        message.rtime = Some(read_time.clone());
                        affected += 1;
                    }
                    affected
                })
                .await
            }
            Err(e) => Err(e.into()),
        };
        self.record_mutation(result)
    }

    /// Deletes on the server, then drops the message locally and remembers
    /// its id so a later delta cannot bring it back.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
    pub async fn delete_message(
        &self,
        ctx: &TenantContext,
        id: MessageId,
    ) -> Result<MutationOutcome, SyncError> {
        Self::check_tenant(ctx)?;
        let result = match self.remote.delete_message(id, ctx).await {
            Ok(()) => self.forget(ctx.tenant_key(), id).await,
            Err(e) => Err(e.into()),
        };
        self.record_mutation(result)
    }

    /// Records an approval decision on every cached message of the topic.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.branchid))]
    pub async fn decide(
        &self,
        ctx: &TenantContext,
        topic: &TopicId,
        decision: Decision,
    ) -> Result<MutationOutcome, SyncError> {
        Self::check_tenant(ctx)?;
        let result = match self.remote.decide(topic, decision, ctx).await {
            Ok(ack) if !ack.accepted => Err(SyncError::DecisionRejected {
                topic: topic.to_string(),
                status: ack.status,
            }),
            Ok(ack) => {
                let status = ack.status.unwrap_or_else(|| decision.as_str().to_string());
                self.rewrite(ctx.tenant_key(), move |messages| {
                    let mut affected = 0;
                    for message in messages.iter_mut().filter(|m| m.belongs_to(topic)) {
                        message.decision_status = Some(status.clone());
                        affected += 1;
                    }
                    affected
                })
                .await
            }
            Err(e) => Err(e.into()),
        };
        self.record_mutation(result)
    }

    /// Tombstone is written before the message list. The cursor is left alone.
    async fn forget(&self, tenant: &str, id: MessageId) -> Result<MutationOutcome, SyncError> {
        let slot = self.slot(tenant).await;
        let _guard = slot.lock.lock().await;

        let mut messages = self.cache.load(tenant).await.map_err(|e| self.storage_failure(e))?;
        let stored_cursor = self
            .cache
            .load_cursor(tenant)
            .await
            .map_err(|e| self.storage_failure(e))?;
        let cursor = merge::high_water_mark(&messages, stored_cursor);

        let mut tombstones = self
            .cache
            .load_tombstones(tenant)
            .await
            .map_err(|e| self.storage_failure(e))?;
        if tombstones.insert(id) {
            merge::cap_tombstones(&mut tombstones, self.config.max_tombstones, cursor);
            self.cache
                .save_tombstones(tenant, &tombstones)
                .await
                .map_err(|e| self.storage_failure(e))?;
        }

        let before = messages.len();
        messages.retain(|m| m.id != id);
        let affected = before - messages.len();
        if affected == 0 {
            debug!(%id, "deleted message was not cached");
            return Ok(MutationOutcome::default());
        }

        self.cache
            .save(tenant, &messages)
            .await
            .map_err(|e| self.storage_failure(e))?;
        slot.publish(messages);
        Ok(MutationOutcome { affected })
    }

    /// Reload, edit, persist and publish under the tenant lock. Nothing is
    /// written when the edit touches no message.
    async fn rewrite<E>(&self, tenant: &str, edit: E) -> Result<MutationOutcome, SyncError>
    where
        E: FnOnce(&mut Vec<Message>) -> usize + Send,
    {
        let slot = self.slot(tenant).await;
        let _guard = slot.lock.lock().await;

        let mut messages = self.cache.load(tenant).await.map_err(|e| self.storage_failure(e))?;
        let affected = edit(&mut messages);
        if affected == 0 {
            debug!("mutation target not cached, nothing to apply");
            return Ok(MutationOutcome::default());
        }

        self.cache
            .save(tenant, &messages)
            .await
            .map_err(|e| self.storage_failure(e))?;
        slot.publish(messages);
        Ok(MutationOutcome { affected })
    }

    fn record_mutation(
        &self,
        result: Result<MutationOutcome, SyncError>,
    ) -> Result<MutationOutcome, SyncError> {
        match &result {
            Ok(outcome) => {
                SyncMetrics::incr(&self.metrics.mutations_applied);
                debug!(affected = outcome.affected, "mutation applied");
            }
            Err(e) => {
                SyncMetrics::incr(&self.metrics.mutations_failed);
                warn!(error = %e, "mutation not applied");
            }
        }
        result
    }
}
