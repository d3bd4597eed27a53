use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::StorageArea;
use crate::error::{AppError, Result};
use crate::feed::{DiscoveryOptions, DEFAULT_POLL_INTERVAL};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,

    /// Unset means discovery polls until the page shows its subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_timeout_ms: Option<u64>,

    #[serde(default)]
    pub storage_area: StorageArea,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feed-throttle");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("state.db").to_string_lossy().to_string()
}

fn default_discovery_interval() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            discovery_interval_ms: default_discovery_interval(),
            discovery_timeout_ms: None,
            storage_area: StorageArea::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        if config.discovery_interval_ms == 0 {
            return Err(AppError::Config(
                "discovery_interval_ms must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feed-throttle")
            .join("config.toml")
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            interval: Duration::from_millis(self.discovery_interval_ms),
            timeout: self.discovery_timeout_ms.map(Duration::from_millis),
        }
    }
}
