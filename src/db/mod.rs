pub mod codec;
mod repository;
mod schema;
mod storage;

pub use repository::SqliteStorage;
pub use storage::{MemoryStorage, Storage, StorageArea, StorageChange, StorageKey};
