use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored record set could not be decoded. The whole collection is rejected.
    #[error("Malformed {collection} data at line {line}: {reason}")]
    Decode {
        collection: &'static str,
        line: usize,
        reason: String,
    },

    #[error(
        "Timed out discovering sources (timeout_ms={timeout_ms}, interval_ms={interval_ms}, attempts={attempts_made})"
    )]
    DiscoveryTimeout {
        timeout_ms: u64,
        interval_ms: u64,
        attempts_made: u64,
    },

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
