//! SQLite schema definitions.

/// Current schema version for migrations.
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema for the local KanjiQuest database.
pub const SCHEMA: &str = r#"
-- Coin ledger, one row per user. local_balance is authoritative for the UI.
CREATE TABLE IF NOT EXISTS coin_balance (
    user_id TEXT PRIMARY KEY NOT NULL,
    local_balance INTEGER NOT NULL DEFAULT 0,
    synced_balance INTEGER NOT NULL DEFAULT 0,
    lifetime_earned INTEGER NOT NULL DEFAULT 0,
    lifetime_spent INTEGER NOT NULL DEFAULT 0,
    tier TEXT NOT NULL DEFAULT 'bronze',
    last_synced_at INTEGER NOT NULL DEFAULT 0,
    needs_sync INTEGER NOT NULL DEFAULT 0
);

-- Durable economic event log (to sync)
CREATE TABLE IF NOT EXISTS coin_sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    event_id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    source_business TEXT NOT NULL DEFAULT 'kanjiquests',
    source_type TEXT NOT NULL,
    base_amount INTEGER NOT NULL,
    description TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    error_message TEXT
);

-- Durable learning event log (to sync)
CREATE TABLE IF NOT EXISTS learning_sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    event_id TEXT NOT NULL UNIQUE,
    user_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER,
    error_message TEXT
);

-- Learning events applied from the remote store, keyed by remote id
CREATE TABLE IF NOT EXISTS learning_events (
    remote_id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Per-user sync watermarks
CREATE TABLE IF NOT EXISTS learning_sync_metadata (
    user_id TEXT PRIMARY KEY NOT NULL,
    device_id TEXT,
    last_synced_at INTEGER NOT NULL DEFAULT 0,
    last_push_at INTEGER NOT NULL DEFAULT 0,
    last_pull_at INTEGER NOT NULL DEFAULT 0
);

-- Vocabulary SRS card state
CREATE TABLE IF NOT EXISTS vocab_srs_card (
    user_id TEXT NOT NULL,
    vocab_id INTEGER NOT NULL,
    ease_factor REAL NOT NULL DEFAULT 2.5,
    interval INTEGER NOT NULL DEFAULT 0,
    repetitions INTEGER NOT NULL DEFAULT 0,
    next_review INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'new',
    total_reviews INTEGER NOT NULL DEFAULT 0,
    correct_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, vocab_id)
);

-- Premium content purchased with coins
CREATE TABLE IF NOT EXISTS premium_content_unlocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    user_id TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content_id TEXT NOT NULL,
    unlocked_at INTEGER NOT NULL,
    cost_coins INTEGER NOT NULL,
    UNIQUE(user_id, content_type, content_id)
);

-- Time-limited earn multipliers
CREATE TABLE IF NOT EXISTS active_boosters (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    user_id TEXT NOT NULL,
    booster_type TEXT NOT NULL,
    multiplier REAL NOT NULL DEFAULT 1.0,
    activated_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_coin_queue_status ON coin_sync_queue(sync_status, created_at);
CREATE INDEX IF NOT EXISTS idx_coin_queue_user ON coin_sync_queue(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_learning_queue_status ON learning_sync_queue(sync_status, created_at);
CREATE INDEX IF NOT EXISTS idx_learning_queue_user ON learning_sync_queue(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_learning_events_user ON learning_events(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_unlocks_user ON premium_content_unlocks(user_id, content_type);
CREATE INDEX IF NOT EXISTS idx_boosters_user ON active_boosters(user_id, expires_at);
"#;
