use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const KV_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Client-local key-value storage for small JSON snapshots.
pub trait SnapshotStore: Send {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn save(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

impl<T: SnapshotStore + ?Sized> SnapshotStore for Box<T> {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).save(key, value)
    }
}

pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > KV_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: KV_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_kv_store.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn updated_at(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT updated_at FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.conn.execute(
            "
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
            params![key, value, now],
        )?;
        Ok(())
    }
}

/// Process-local store. Clones share the same entries, which is how tests model a reload.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn migration_sets_schema_version() {
        let store = SqliteSnapshotStore::open_in_memory().expect("open db");
        assert_eq!(
            store.schema_version().expect("schema version"),
            KV_SCHEMA_VERSION
        );
        store.migrate().expect("second migrate is a no-op");
    }

    #[test]
    fn save_overwrites_previous_value() {
        let store = SqliteSnapshotStore::open_in_memory().expect("open db");
        assert_eq!(store.load("workspace.tabs").expect("load"), None);

        store.save("workspace.tabs", "{\"tabs\":[]}").expect("save first");
        store.save("workspace.tabs", "{\"tabs\":[1]}").expect("save second");

        assert_eq!(
            store.load("workspace.tabs").expect("load").as_deref(),
            Some("{\"tabs\":[1]}")
        );
        assert!(store.updated_at("workspace.tabs").expect("ts").is_some());
    }

    #[test]
    fn values_survive_reopen_on_disk() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let store = SqliteSnapshotStore::open(file.path()).expect("open db");
            store.save("k", "v").expect("save");
        }
        let reopened = SqliteSnapshotStore::open(file.path()).expect("reopen db");
        assert_eq!(reopened.load("k").expect("load").as_deref(), Some("v"));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("raw open");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        let result = SqliteSnapshotStore::open(file.path());
        assert!(matches!(
            result,
            Err(StorageError::UnsupportedSchemaVersion { found: 9, .. })
        ));
    }

    #[test]
    fn memory_store_clones_share_entries() {
        let store = MemorySnapshotStore::new();
        let reloaded = store.clone();
        store.save("k", "v").expect("save");
        assert_eq!(reloaded.load("k").expect("load").as_deref(), Some("v"));
        assert_eq!(reloaded.len(), 1);
    }
}
