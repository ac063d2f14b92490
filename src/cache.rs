//! Typed per-tenant views over a [`KeyValueStore`].
//!
//! The message list lives at `messages:<branchid>` and the deletion record at
//! `tombstones:<branchid>`, both as JSON arrays. The delta cursor is a JSON
//! number at `cursor:<branchid>`. Each save replaces the whole value.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::model::{Message, MessageId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error("corrupted cache entry '{key}': {reason}")]
    Corrupted { key: String, reason: String },

    #[error("invalid tenant key '{tenant}': {reason}")]
    InvalidTenant { tenant: String, reason: String },
}

impl CacheError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Store(e) => e.is_retryable(),
            CacheError::Corrupted { .. } | CacheError::InvalidTenant { .. } => false,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

pub struct CacheStore<S> {
    store: Arc<S>,
}

impl<S> Clone for CacheStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> CacheStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn load(&self, tenant: &str) -> CacheResult<Vec<Message>> {
        let key = tenant_key(KeyNamespace::Messages, tenant)?;
        self.read_json(&key).await
    }

    pub async fn save(&self, tenant: &str, messages: &[Message]) -> CacheResult<()> {
        let key = tenant_key(KeyNamespace::Messages, tenant)?;
        self.write_json(&key, &messages).await?;
        debug!(tenant, count = messages.len(), "message cache saved");
        Ok(())
    }

    pub async fn load_tombstones(&self, tenant: &str) -> CacheResult<BTreeSet<MessageId>> {
        let key = tenant_key(KeyNamespace::Tombstones, tenant)?;
        self.read_json(&key).await
    }

    pub async fn save_tombstones(
        &self,
        tenant: &str,
        tombstones: &BTreeSet<MessageId>,
    ) -> CacheResult<()> {
        let key = tenant_key(KeyNamespace::Tombstones, tenant)?;
        self.write_json(&key, tombstones).await
    }

    /// Highest id ever received from the delta feed; zero for a new tenant.
    pub async fn load_cursor(&self, tenant: &str) -> CacheResult<MessageId> {
        let key = tenant_key(KeyNamespace::Cursor, tenant)?;
        self.read_json(&key).await
    }

    pub async fn save_cursor(&self, tenant: &str, cursor: MessageId) -> CacheResult<()> {
        let key = tenant_key(KeyNamespace::Cursor, tenant)?;
        self.write_json(&key, &cursor).await?;
        debug!(tenant, %cursor, "delta cursor saved");
        Ok(())
    }

    /// Drops everything stored for the tenant. Returns whether anything existed.
    pub async fn clear(&self, tenant: &str) -> CacheResult<bool> {
        let mut existed = false;
        for namespace in [
            KeyNamespace::Messages,
            KeyNamespace::Tombstones,
            KeyNamespace::Cursor,
        ] {
            let key = tenant_key(namespace, tenant)?;
            existed |= self.store.delete(&key).await?;
        }
        Ok(existed)
    }

    async fn read_json<T>(&self, key: &KvKey) -> CacheResult<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(T::default());
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            error!(key = %key.raw(), error = %e, "stored value failed to parse");
            CacheError::Corrupted {
                key: key.raw(),
                reason: e.to_string(),
            }
        })
    }

    async fn write_json<T: serde::Serialize + ?Sized>(
        &self,
        key: &KvKey,
        value: &T,
    ) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| KvError::serialization(e.to_string(), Some(key)))?;
        self.store.set(key, bytes).await?;
        Ok(())
    }
}

fn tenant_key(namespace: KeyNamespace, tenant: &str) -> CacheResult<KvKey> {
    KvKey::new(namespace, tenant).map_err(|e| CacheError::InvalidTenant {
        tenant: tenant.escape_debug().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;

    fn cache() -> CacheStore<MemoryKvStore> {
        CacheStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn test_missing_tenant_loads_empty() {
        let cache = cache();
        assert!(cache.load("b1").await.unwrap().is_empty());
        assert!(cache.load_tombstones("b1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let cache = cache();
        let messages = vec![
            Message::new(7, "2024-01-10 09:00:00").with_topic("t1"),
            Message::new(5, "2024-01-09 09:00:00"),
        ];
        cache.save("b1", &messages).await.unwrap();
        assert_eq!(cache.load("b1").await.unwrap(), messages);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let cache = cache();
        cache
            .save("b1", &[Message::new(1, "2024-01-10")])
            .await
            .unwrap();
        assert!(cache.load("b2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_roundtrip() {
        let cache = cache();
        let tombstones: BTreeSet<MessageId> = [MessageId(3), MessageId(9)].into_iter().collect();
        cache.save_tombstones("b1", &tombstones).await.unwrap();
        assert_eq!(cache.load_tombstones("b1").await.unwrap(), tombstones);

        let key = KvKey::new(KeyNamespace::Tombstones, "b1").unwrap();
        let raw = cache.store().get(&key).await.unwrap().unwrap();
        assert_eq!(raw, b"[3,9]".to_vec());
    }

    #[tokio::test]
    async fn test_corrupted_value_is_reported_and_kept() {
        let cache = cache();
        let key = KvKey::new(KeyNamespace::Messages, "b1").unwrap();
        cache.store().set(&key, b"{not json".to_vec()).await.unwrap();

        let result = cache.load("b1").await;
        assert!(matches!(result, Err(CacheError::Corrupted { .. })));
        assert_eq!(
            cache.store().get(&key).await.unwrap(),
            Some(b"{not json".to_vec())
        );
    }

    #[tokio::test]
    async fn test_invalid_tenant_rejected() {
        let cache = cache();
        assert!(matches!(
            cache.load("../etc").await,
            Err(CacheError::InvalidTenant { .. })
        ));
        assert!(matches!(
            cache.save("", &[]).await,
            Err(CacheError::InvalidTenant { .. })
        ));
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let cache = cache();
        assert_eq!(cache.load_cursor("b1").await.unwrap(), MessageId::ZERO);

        cache.save_cursor("b1", MessageId(42)).await.unwrap();
        assert_eq!(cache.load_cursor("b1").await.unwrap(), MessageId(42));

        let key = KvKey::new(KeyNamespace::Cursor, "b1").unwrap();
        assert_eq!(cache.store().get(&key).await.unwrap(), Some(b"42".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_removes_every_record() {
        let cache = cache();
        cache.save("b1", &[Message::new(1, "2024-01-10")]).await.unwrap();
        cache
            .save_tombstones("b1", &[MessageId(2)].into_iter().collect())
            .await
            .unwrap();
        cache.save_cursor("b1", MessageId(2)).await.unwrap();

        assert!(cache.clear("b1").await.unwrap());
        assert!(cache.load("b1").await.unwrap().is_empty());
        assert!(cache.load_tombstones("b1").await.unwrap().is_empty());
        assert_eq!(cache.load_cursor("b1").await.unwrap(), MessageId::ZERO);
        assert!(!cache.clear("b1").await.unwrap());
    }
}
