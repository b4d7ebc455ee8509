//! Local SQLite persistence layer.

pub mod error;
pub mod repository;
pub mod schema;

pub use error::DbError;
pub use repository::{
    BalanceSnapshot, CoinRepository, LearningRepository, QueueCounts, SqliteRepository,
    SyncMetadataRepository, SyncQueueRepository, UnlockRepository,
};

use std::path::PathBuf;

/// Default database location under the platform data directory.
pub fn default_db_path() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("kanjiquest").join("kanjiquest.db")
}
