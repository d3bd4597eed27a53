use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::error::{AppError, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Logical keys of the persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKey {
    Sources,
    FeedStates,
}

impl StorageKey {
    pub const ALL: [StorageKey; 2] = [StorageKey::Sources, StorageKey::FeedStates];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::Sources => "StorageKey:sources",
            StorageKey::FeedStates => "StorageKey:feedStates",
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage area a change happened in. Contexts only follow one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    #[default]
    Sync,
    Local,
}

impl StorageArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Sync => "sync",
            StorageArea::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: StorageKey,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub area: StorageArea,
}

/// Eventually consistent string store shared by every context.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Values for `keys`; absent keys map to an empty string.
    async fn get(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, String>>;

    /// Store `value` and notify subscribers if it differs from the current one.
    async fn set(&self, key: StorageKey, value: String) -> Result<()>;

    /// Change notifications for every key in this store's area.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// In-process storage, used by tests and short-lived tools.
pub struct MemoryStorage {
    area: StorageArea,
    values: Mutex<HashMap<StorageKey, String>>,
    changes: broadcast::Sender<StorageChange>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_area(StorageArea::Sync)
    }

    pub fn with_area(area: StorageArea) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            area,
            values: Mutex::new(HashMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following `set` fail, to exercise callers' error paths.
    #[allow(dead_code)]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, String>> {
        let values = self.values.lock().await;
        Ok(keys
            .iter()
            .map(|key| (*key, values.get(key).cloned().unwrap_or_default()))
            .collect())
    }

    async fn set(&self, key: StorageKey, value: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Storage(format!("write to {} rejected", key)));
        }

        let mut values = self.values.lock().await;
        let old_value = values.insert(key, value.clone());
        if old_value.as_deref() == Some(value.as_str()) {
            return Ok(());
        }

        // No subscribers is fine, nobody is listening yet.
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
