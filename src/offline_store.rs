//! Durable [`KeyValueStore`] backends for the message cache.
//!
//! Both backends replace a value in a single step: the file store writes a
//! temp file and renames it over the target, the SQLite store upserts the row
//! inside one statement. A crash mid-write leaves the previous value intact.

use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::capabilities::check_value_size;
use crate::capabilities::{KeyValueStore, KvError, KvKey, KvResult, StorageErrorCode};

const FILE_EXTENSION: &str = "json";

async fn run_blocking<F, T>(f: F) -> KvResult<T>
where
    F: FnOnce() -> KvResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KvError::storage(StorageErrorCode::Unknown, format!("blocking task failed: {e}")))?
}

/// One file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn open(root: impl Into<PathBuf>) -> KvResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        info!("File store opened at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", encode_file_name(&key.raw()), FILE_EXTENSION))
    }
}

/// Escapes everything outside `[A-Za-z0-9_-]` so distinct keys never share a file.
fn encode_file_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn write_atomically(path: &Path, data: &[u8]) -> KvResult<()> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        run_blocking(move || match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
        check_value_size(&value)?;
        let path = self.path_for(key);
        debug!(key = %key.raw(), bytes = value.len(), "writing file entry");
        run_blocking(move || write_atomically(&path, &value)).await
    }

    async fn delete(&self, key: &KvKey) -> KvResult<bool> {
        let path = self.path_for(key);
        run_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteKvStore;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::{Arc, Mutex};

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS kv_entries (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL
        );
    ";

    fn map_sqlite(e: rusqlite::Error) -> KvError {
        use rusqlite::ErrorCode;
        let code = match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
            Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
            Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
            Some(ErrorCode::PermissionDenied | ErrorCode::ReadOnly) => {
                StorageErrorCode::PermissionDenied
            }
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
                StorageErrorCode::Corrupted
            }
            Some(ErrorCode::CannotOpen) => StorageErrorCode::ConnectionFailed,
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }

    /// SQLite-backed store; one row per key.
    #[derive(Clone)]
    pub struct SqliteKvStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteKvStore {
        pub fn open(path: &Path) -> KvResult<Self> {
            let conn = Connection::open(path).map_err(map_sqlite)?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(map_sqlite)?;
            info!("SQLite store opened at {}", path.display());
            Self::init(conn)
        }

        pub fn open_in_memory() -> KvResult<Self> {
            Self::init(Connection::open_in_memory().map_err(map_sqlite)?)
        }

        fn init(conn: Connection) -> KvResult<Self> {
            conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        /// Number of times `key` has been written, if present.
        pub async fn version(&self, key: &KvKey) -> KvResult<Option<u64>> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT version FROM kv_entries WHERE key = ?1",
                    params![raw],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map(|v| v.map(|v| v as u64))
                .map_err(map_sqlite)
            })
            .await
        }

        async fn with_conn<F, T>(&self, f: F) -> KvResult<T>
        where
            F: FnOnce(&Connection) -> KvResult<T> + Send + 'static,
            T: Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            run_blocking(move || {
                let guard = conn.lock().map_err(|e| {
                    KvError::storage(StorageErrorCode::Locked, format!("lock poisoned: {e}"))
                })?;
                f(&guard)
            })
            .await
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![raw],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
                .map_err(map_sqlite)
            })
            .await
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
            check_value_size(&value)?;
            let raw = key.raw();
            let now = chrono::Utc::now().timestamp_millis();
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO kv_entries (key, value, version, updated_at)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                         value = excluded.value,
                         version = kv_entries.version + 1,
                         updated_at = excluded.updated_at",
                    params![raw, value, now],
                )
                .map(|_| ())
                .map_err(map_sqlite)
            })
            .await
        }

        async fn delete(&self, key: &KvKey) -> KvResult<bool> {
            let raw = key.raw();
            self.with_conn(move |conn| {
                conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![raw])
                    .map(|n| n > 0)
                    .map_err(map_sqlite)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::KeyNamespace;
    use tempfile::tempdir;

    fn key(tenant: &str) -> KvKey {
        KvKey::new(KeyNamespace::Messages, tenant).unwrap()
    }

    #[test]
    fn test_file_names_are_escaped() {
        assert_eq!(encode_file_name("messages:b-1"), "messages%3Ab-1");
        assert_ne!(encode_file_name("messages:a/b"), encode_file_name("messages:a_b"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();

        assert_eq!(store.get(&key("b1")).await.unwrap(), None);
        store.set(&key("b1"), b"[1]".to_vec()).await.unwrap();
        store.set(&key("b1"), b"[2]".to_vec()).await.unwrap();
        assert_eq!(store.get(&key("b1")).await.unwrap(), Some(b"[2]".to_vec()));

        assert!(store.delete(&key("b1")).await.unwrap());
        assert!(!store.delete(&key("b1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.set(&key("b1"), b"persisted".to_vec()).await.unwrap();
        }
        let store = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get(&key("b1")).await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set(&key("b1"), b"x".to_vec()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["messages%3Ab1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_isolates_tenants() {
        let dir = tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set(&key("b1"), b"one".to_vec()).await.unwrap();
        store.set(&key("b2"), b"two".to_vec()).await.unwrap();
        assert_eq!(store.get(&key("b1")).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get(&key("b2")).await.unwrap(), Some(b"two".to_vec()));
    }

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[tokio::test]
    async fn test_sqlite_store_versions_writes() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        assert_eq!(store.version(&key("b1")).await.unwrap(), None);

        store.set(&key("b1"), b"a".to_vec()).await.unwrap();
        store.set(&key("b1"), b"b".to_vec()).await.unwrap();

        assert_eq!(store.get(&key("b1")).await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(store.version(&key("b1")).await.unwrap(), Some(2));
        assert!(store.delete(&key("b1")).await.unwrap());
        assert_eq!(store.get(&key("b1")).await.unwrap(), None);
    }

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[tokio::test]
    async fn test_sqlite_store_persistence_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feed.db");
        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.set(&key("b1"), b"[]".to_vec()).await.unwrap();
        }
        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(store.get(&key("b1")).await.unwrap(), Some(b"[]".to_vec()));
    }
}
