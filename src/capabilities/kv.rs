use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// Storage key as persisted, e.g. `messages:<branchid>`.
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.escape_debug().to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Messages,
    Tombstones,
    /// Highest id the tenant has received from the delta feed.
    Cursor,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Messages => "messages",
            KeyNamespace::Tombstones => "tombstones",
            KeyNamespace::Cursor => "cursor",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn serialization(message: impl Into<String>, key: Option<&KvKey>) -> Self {
        Self::Serialization {
            message: message.into(),
            key: key.map(KvKey::raw),
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                StorageErrorCode::Busy
            }
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                StorageErrorCode::Corrupted
            }
            _ => StorageErrorCode::IoError,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Durable byte store keyed by [`KvKey`].
///
/// `set` must replace the whole value or leave the previous one in place;
/// callers rely on there being no partially written state.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()>;
    async fn delete(&self, key: &KvKey) -> KvResult<bool>;
}

pub(crate) fn check_value_size(value: &[u8]) -> KvResult<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-local store. Not durable; for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
        check_value_size(&value)?;
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> KvResult<bool> {
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation_empty() {
        let result = KvKey::new(KeyNamespace::Messages, "");
        assert!(matches!(result, Err(KvError::InvalidKey { .. })));
    }

    #[test]
    fn test_key_validation_whitespace() {
        assert!(KvKey::new(KeyNamespace::Messages, "   ").is_err());
    }

    #[test]
    fn test_key_validation_null_byte() {
        assert!(KvKey::new(KeyNamespace::Messages, "key\0value").is_err());
    }

    #[test]
    fn test_key_validation_path_traversal() {
        assert!(KvKey::new(KeyNamespace::Messages, "../etc/passwd").is_err());
        assert!(KvKey::new(KeyNamespace::Messages, "/abs").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        let long_key = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(KvKey::new(KeyNamespace::Messages, long_key).is_err());
    }

    #[test]
    fn test_key_validation_control_chars() {
        assert!(KvKey::new(KeyNamespace::Messages, "key\x01value").is_err());
        assert!(KvKey::new(KeyNamespace::Messages, "key\tvalue").is_err());
    }

    #[test]
    fn test_tenant_key_layout() {
        let key = KvKey::new(KeyNamespace::Messages, "branch-7").unwrap();
        assert_eq!(key.raw(), "messages:branch-7");

        let key = KvKey::new(KeyNamespace::Tombstones, "branch-7").unwrap();
        assert_eq!(key.raw(), "tombstones:branch-7");

        let key = KvKey::new(KeyNamespace::Cursor, "branch-7").unwrap();
        assert_eq!(key.raw(), "cursor:branch-7");
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::serialization("bad json", None).is_retryable());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: KvError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into();
        assert!(matches!(
            err,
            KvError::Storage {
                code: StorageErrorCode::PermissionDenied,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(KeyNamespace::Messages, "b1").unwrap();

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, b"[]".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"[]".to_vec()));
        assert_eq!(store.len().await, 1);

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_oversized_value() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(KeyNamespace::Messages, "b1").unwrap();
        let result = store.set(&key, vec![0u8; MAX_VALUE_SIZE + 1]).await;
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
