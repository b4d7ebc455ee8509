//! Offline-first synchronization engine for KanjiQuest.
//!
//! Gameplay writes go to a local SQLite database together with durable sync
//! queue rows; a push/pull reconciler drains the queues to the backend and
//! merges remote changes back, keeping `local_balance = synced_balance +
//! unsynced queue sum` at all times.

pub mod config;
pub mod db;
pub mod migration;
pub mod scheduler;
pub mod sync;

pub use config::SyncConfig;
pub use db::{
    default_db_path, BalanceSnapshot, CoinRepository, DbError, LearningRepository, QueueCounts,
    SqliteRepository, SyncMetadataRepository, SyncQueueRepository, UnlockRepository,
};
pub use migration::{migrate_local_data, MigrationOutcome};
pub use scheduler::{run_periodic, PeriodicSyncSpec};
pub use sync::remote::{HttpRemoteStore, RemoteStore};
pub use sync::{EngineStatus, SyncEngine, SyncError, SyncOutcome};
