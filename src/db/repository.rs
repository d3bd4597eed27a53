use std::collections::HashMap;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tokio::sync::{broadcast, Mutex};
use tokio_rusqlite::Connection;

use crate::error::Result;

use super::schema::SCHEMA;
use super::storage::{Storage, StorageArea, StorageChange, StorageKey};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Persistent storage backed by a single SQLite key/value table.
pub struct SqliteStorage {
    conn: Connection,
    area: StorageArea,
    changes: broadcast::Sender<StorageChange>,
    // Serializes read-compare-write so notifications carry the right old value.
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    pub async fn new(db_path: &str, area: StorageArea) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn, area).await
    }

    #[allow(dead_code)]
    pub async fn in_memory(area: StorageArea) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, area).await
    }

    async fn with_connection(conn: Connection, area: StorageArea) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn,
            area,
            changes,
            write_lock: Mutex::new(()),
        })
    }

    async fn read(&self, key: StorageKey) -> Result<Option<String>> {
        let area = self.area.as_str();
        let value = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM kv WHERE area = ?1 AND key = ?2",
                        params![area, key.as_str()],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, String>> {
        let mut values = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = self.read(*key).await?.unwrap_or_default();
            values.insert(*key, value);
        }
        Ok(values)
    }

    async fn set(&self, key: StorageKey, value: String) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let old_value = self.read(key).await?;
        if old_value.as_deref() == Some(value.as_str()) {
            return Ok(());
        }

        let area = self.area.as_str();
        let stored = value.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO kv (area, key, value) VALUES (?1, ?2, ?3)
                       ON CONFLICT(area, key) DO UPDATE SET
                           value = excluded.value,
                           updated_at = datetime('now')"#,
                    params![area, key.as_str(), stored],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!("Stored {} ({} bytes)", key, value.len());
        let _ = self.changes.send(StorageChange {
            key,
            old_value,
            new_value: Some(value),
            area: self.area,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
