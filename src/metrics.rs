use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the sync engine. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Sync cycles
    pub syncs_started: AtomicU64,
    pub syncs_succeeded: AtomicU64,
    pub syncs_failed: AtomicU64,
    pub sync_retries: AtomicU64,

    // Message flow
    pub messages_fetched: AtomicU64,
    pub messages_expired: AtomicU64,
    pub messages_suppressed: AtomicU64,
    pub cache_writes: AtomicU64,

    // Mutations
    pub mutations_applied: AtomicU64,
    pub mutations_failed: AtomicU64,

    // Notifications
    pub notifications_enqueued: AtomicU64,
    pub notifications_dispatched: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub notifications_dropped: AtomicU64,

    pub storage_errors: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            syncs_started: self.syncs_started.load(Ordering::Relaxed),
            syncs_succeeded: self.syncs_succeeded.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            sync_retries: self.sync_retries.load(Ordering::Relaxed),
            messages_fetched: self.messages_fetched.load(Ordering::Relaxed),
            messages_expired: self.messages_expired.load(Ordering::Relaxed),
            messages_suppressed: self.messages_suppressed.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_failed: self.mutations_failed.load(Ordering::Relaxed),
            notifications_enqueued: self.notifications_enqueued.load(Ordering::Relaxed),
            notifications_dispatched: self.notifications_dispatched.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub syncs_started: u64,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    pub sync_retries: u64,
    pub messages_fetched: u64,
    pub messages_expired: u64,
    pub messages_suppressed: u64,
    pub cache_writes: u64,
    pub mutations_applied: u64,
    pub mutations_failed: u64,
    pub notifications_enqueued: u64,
    pub notifications_dispatched: u64,
    pub notifications_failed: u64,
    pub notifications_dropped: u64,
    pub storage_errors: u64,
}
