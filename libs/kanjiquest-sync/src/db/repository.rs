//! Repository pattern for local database access.
//!
//! The local database is the single source of truth for balances and SRS
//! state. Every gameplay mutation commits its ledger change and its sync
//! queue row in one SQLite transaction, so the app stays fully functional
//! offline and the queue never drifts from the ledger.

use chrono::{DateTime, Utc};
use kanjiquest_core::{
    CoinBalance, CoinEvent, CoinEventType, CoinTier, EarnResult, LearningEvent, LedgerError,
    ReviewGrade, SpendResult, SrsAlgorithm, SrsCardState, SrsState, SyncMetadata, SyncStatus,
    SOURCE_BUSINESS,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

use crate::db::error::DbError;

type Result<T> = std::result::Result<T, DbError>;

/// Clock source, injectable for tests.
pub type Clock = Box<dyn Fn() -> i64 + Send>;

/// Queue counts for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}

/// Remote balance snapshot applied during the pull phase.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BalanceSnapshot {
    pub balance: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
    /// Server timestamp of the snapshot (epoch seconds).
    pub as_of: i64,
}

/// Repository for the coin ledger.
pub trait CoinRepository {
    fn get_balance(&self, user_id: &str) -> Result<CoinBalance>;
    fn earn_coins(
        &self,
        user_id: &str,
        source_type: &str,
        base_amount: i64,
        description: &str,
    ) -> Result<EarnResult>;
    fn spend_coins(
        &self,
        user_id: &str,
        source_type: &str,
        amount: i64,
        description: &str,
    ) -> Result<SpendResult>;
    fn adjust_coins(&self, user_id: &str, delta: i64, description: &str) -> Result<i64>;
}

/// Repository for SRS cards and learning events.
pub trait LearningRepository {
    fn get_srs_card(&self, user_id: &str, vocab_id: i64) -> Result<Option<SrsCardState>>;
    fn upsert_srs_card(&self, user_id: &str, vocab_id: i64, state: &SrsCardState) -> Result<()>;
    /// Applies the injected algorithm and queues a review event atomically.
    fn record_review(
        &self,
        user_id: &str,
        vocab_id: i64,
        grade: ReviewGrade,
        algorithm: &dyn SrsAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<SrsCardState>;
    fn queue_learning_event(
        &self,
        user_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64>;
}

/// Repository for the durable sync queues.
pub trait SyncQueueRepository {
    fn pending_coin_events(&self, user_id: &str, max_retries: i64) -> Result<Vec<CoinEvent>>;
    fn pending_learning_events(&self, user_id: &str, max_retries: i64)
        -> Result<Vec<LearningEvent>>;
    fn mark_coin_event_synced(&self, event_id: &str) -> Result<()>;
    fn mark_coin_event_failed(&self, event_id: &str, error: &str) -> Result<()>;
    fn mark_learning_event_synced(&self, event_id: &str) -> Result<()>;
    fn mark_learning_event_failed(&self, event_id: &str, error: &str) -> Result<()>;
    /// Signed sum of coin amounts not yet confirmed by the remote store.
    fn unsynced_amount_sum(&self, user_id: &str) -> Result<i64>;
    fn coin_queue_counts(&self, user_id: &str) -> Result<QueueCounts>;
    fn learning_queue_counts(&self, user_id: &str) -> Result<QueueCounts>;
    /// Records a coin event pulled from the remote store as already synced.
    /// Returns false when the event id is already present (idempotent merge).
    fn insert_remote_coin_event(&self, event: &CoinEvent) -> Result<bool>;
    /// Inserts a learning event pulled from the remote store, keyed by remote
    /// id. Returns false on duplicate.
    fn insert_remote_learning_event(
        &self,
        user_id: &str,
        remote_id: &str,
        event_type: &str,
        payload: &str,
        created_at: i64,
    ) -> Result<bool>;
}

/// Repository for sync watermarks.
pub trait SyncMetadataRepository {
    /// Lazily creates the row on first access.
    fn get_sync_metadata(&self, user_id: &str) -> Result<SyncMetadata>;
    /// Advances watermarks monotonically; values lower than the stored ones
    /// are ignored.
    fn advance_watermarks(
        &self,
        user_id: &str,
        last_synced_at: i64,
        last_push_at: i64,
        last_pull_at: i64,
    ) -> Result<()>;
    fn set_device_id(&self, user_id: &str, device_id: &str) -> Result<()>;
}

/// Repository for premium unlocks and boosters.
pub trait UnlockRepository {
    /// Spends coins and records the unlock in one transaction.
    fn unlock_content(
        &self,
        user_id: &str,
        content_type: &str,
        content_id: &str,
        cost_coins: i64,
    ) -> Result<SpendResult>;
    fn is_unlocked(&self, user_id: &str, content_type: &str, content_id: &str) -> Result<bool>;
    fn activate_booster(
        &self,
        user_id: &str,
        booster_type: &str,
        multiplier: f64,
        duration_secs: i64,
    ) -> Result<()>;
    /// Highest multiplier among boosters active at `now`, 1.0 when none.
    fn earn_multiplier(&self, user_id: &str, now: i64) -> Result<f64>;
}

/// SQLite implementation of all repositories.
pub struct SqliteRepository {
    conn: Connection,
    clock: Clock,
}

impl SqliteRepository {
    /// Open database at path, creating if necessary.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let repo = Self {
            conn,
            clock: Box::new(|| Utc::now().timestamp()),
        };
        repo.initialize()?;
        Ok(repo)
    }

    /// Replace the wall clock, for deterministic tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(super::schema::SCHEMA)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![super::schema::SCHEMA_VERSION],
        )?;
        Ok(())
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// True when a `coin_balance` row exists for the user. Used by identity
    /// migration to decide whether there is anything to move.
    pub fn has_balance_row(&self, user_id: &str) -> Result<bool> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT user_id FROM coin_balance WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Re-keys every user-scoped table from `from` to `to` in one
    /// transaction. Returns the number of rows moved.
    pub fn migrate_user_data(&self, from: &str, to: &str) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut moved = 0;
        for table in [
            "coin_balance",
            "coin_sync_queue",
            "learning_sync_queue",
            "learning_events",
            "learning_sync_metadata",
            "vocab_srs_card",
            "premium_content_unlocks",
            "active_boosters",
        ] {
            let sql = format!("UPDATE {table} SET user_id = ?1 WHERE user_id = ?2");
            moved += tx.execute(&sql, params![to, from])?;
        }
        tx.commit()?;
        Ok(moved)
    }

    /// Applies a remote balance snapshot with synced-balance reconciliation:
    /// the remote value becomes `synced_balance` and `local_balance` is
    /// recomputed as `synced_balance + sum(unsynced event amounts)` so local
    /// unsynced progress is never overwritten.
    pub fn apply_balance_snapshot(
        &self,
        user_id: &str,
        snapshot: &BalanceSnapshot,
    ) -> Result<CoinBalance> {
        let unsynced = self.unsynced_amount_sum(user_id)?;
        let local = self.get_balance(user_id)?;

        let synced_balance = snapshot.balance;
        let local_balance = synced_balance + unsynced;
        let lifetime_earned = local.lifetime_earned.max(snapshot.lifetime_earned);
        let lifetime_spent = local.lifetime_spent.max(snapshot.lifetime_spent);
        let tier = CoinTier::for_lifetime_earned(lifetime_earned);
        let needs_sync = local_balance != synced_balance;
        let last_synced_at = local.last_synced_at.max(snapshot.as_of);

        self.conn.execute(
            "INSERT INTO coin_balance (user_id, local_balance, synced_balance, lifetime_earned,
                lifetime_spent, tier, last_synced_at, needs_sync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id) DO UPDATE SET
                local_balance = excluded.local_balance,
                synced_balance = excluded.synced_balance,
                lifetime_earned = excluded.lifetime_earned,
                lifetime_spent = excluded.lifetime_spent,
                tier = excluded.tier,
                last_synced_at = excluded.last_synced_at,
                needs_sync = excluded.needs_sync",
            params![
                user_id,
                local_balance,
                synced_balance,
                lifetime_earned,
                lifetime_spent,
                tier.as_str(),
                last_synced_at,
                needs_sync as i64,
            ],
        )?;

        self.get_balance(user_id)
    }

    /// Once a push confirms events, the synced balance catches up by their
    /// summed amounts.
    pub fn advance_synced_balance(&self, user_id: &str, confirmed_amount: i64) -> Result<()> {
        let now = self.now();
        self.conn.execute(
            "UPDATE coin_balance SET
                synced_balance = synced_balance + ?1,
                last_synced_at = ?2,
                needs_sync = CASE WHEN local_balance = synced_balance + ?1 THEN 0 ELSE 1 END
             WHERE user_id = ?3",
            params![confirmed_amount, now, user_id],
        )?;
        Ok(())
    }

    /// Balance debit plus queue append inside the caller's transaction, so
    /// spends compose with other writes (unlock rows) atomically.
    fn spend_in_tx(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
        source_type: &str,
        amount: i64,
        description: &str,
        now: i64,
    ) -> Result<SpendResult> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }

        let available: i64 = tx
            .query_row(
                "SELECT local_balance FROM coin_balance WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available,
            }
            .into());
        }

        tx.execute(
            "UPDATE coin_balance SET
                local_balance = local_balance - ?1,
                lifetime_spent = lifetime_spent + ?1,
                needs_sync = 1
             WHERE user_id = ?2",
            params![amount, user_id],
        )?;
        Self::append_coin_event(
            tx,
            user_id,
            CoinEventType::Spend,
            source_type,
            -amount,
            description,
            now,
        )?;

        Ok(SpendResult {
            spent: amount,
            new_balance: available - amount,
            queued: true,
        })
    }

    fn append_coin_event(
        tx: &rusqlite::Transaction<'_>,
        user_id: &str,
        event_type: CoinEventType,
        source_type: &str,
        amount: i64,
        description: &str,
        created_at: i64,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO coin_sync_queue (event_id, user_id, event_type, source_business,
                source_type, base_amount, description, created_at, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending')",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                event_type.as_str(),
                SOURCE_BUSINESS,
                source_type,
                amount,
                description,
                created_at,
            ],
        )?;
        Ok(())
    }

    fn row_to_coin_event(row: &rusqlite::Row) -> rusqlite::Result<CoinEvent> {
        let event_type: String = row.get(3)?;
        let sync_status: String = row.get(10)?;
        Ok(CoinEvent {
            id: row.get(0)?,
            event_id: row.get(1)?,
            user_id: row.get(2)?,
            event_type: CoinEventType::from_str(&event_type).unwrap_or(CoinEventType::Adjust),
            source_business: row.get(4)?,
            source_type: row.get(5)?,
            base_amount: row.get(6)?,
            description: row.get(7)?,
            metadata: row.get(8)?,
            created_at: row.get(9)?,
            sync_status: SyncStatus::from_str(&sync_status).unwrap_or(SyncStatus::Pending),
            retry_count: row.get(11)?,
            last_attempt_at: row.get(12)?,
            error_message: row.get(13)?,
        })
    }

    fn row_to_learning_event(row: &rusqlite::Row) -> rusqlite::Result<LearningEvent> {
        let sync_status: String = row.get(6)?;
        Ok(LearningEvent {
            id: row.get(0)?,
            event_id: row.get(1)?,
            user_id: row.get(2)?,
            event_type: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            sync_status: SyncStatus::from_str(&sync_status).unwrap_or(SyncStatus::Pending),
            retry_count: row.get(7)?,
            last_attempt_at: row.get(8)?,
            error_message: row.get(9)?,
        })
    }

    fn queue_counts(&self, table: &str, user_id: &str) -> Result<QueueCounts> {
        let sql = format!(
            "SELECT
                SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END),
                SUM(CASE WHEN sync_status = 'synced' THEN 1 ELSE 0 END),
                SUM(CASE WHEN sync_status = 'failed' THEN 1 ELSE 0 END)
             FROM {table} WHERE user_id = ?1"
        );
        self.conn
            .query_row(&sql, params![user_id], |row| {
                Ok(QueueCounts {
                    pending: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    synced: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            })
            .map_err(Into::into)
    }

    fn mark_synced(&self, table: &str, event_id: &str) -> Result<()> {
        let now = self.now();
        let sql = format!(
            "UPDATE {table} SET sync_status = 'synced', last_attempt_at = ?1, error_message = NULL
             WHERE event_id = ?2"
        );
        self.conn.execute(&sql, params![now, event_id])?;
        Ok(())
    }

    fn mark_failed(&self, table: &str, event_id: &str, error: &str) -> Result<()> {
        let now = self.now();
        let sql = format!(
            "UPDATE {table} SET sync_status = 'failed', retry_count = retry_count + 1,
                last_attempt_at = ?1, error_message = ?2
             WHERE event_id = ?3"
        );
        self.conn.execute(&sql, params![now, error, event_id])?;
        Ok(())
    }
}

impl CoinRepository for SqliteRepository {
    fn get_balance(&self, user_id: &str) -> Result<CoinBalance> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, local_balance, synced_balance, lifetime_earned, lifetime_spent,
                        tier, last_synced_at, needs_sync
                 FROM coin_balance WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let tier: String = row.get(5)?;
                    Ok(CoinBalance {
                        user_id: row.get(0)?,
                        local_balance: row.get(1)?,
                        synced_balance: row.get(2)?,
                        lifetime_earned: row.get(3)?,
                        lifetime_spent: row.get(4)?,
                        tier: CoinTier::from_str(&tier).unwrap_or_default(),
                        last_synced_at: row.get(6)?,
                        needs_sync: row.get::<_, i64>(7)? != 0,
                    })
                },
            )
            .optional()?;

        Ok(row.unwrap_or_else(|| CoinBalance::empty(user_id)))
    }

    fn earn_coins(
        &self,
        user_id: &str,
        source_type: &str,
        base_amount: i64,
        description: &str,
    ) -> Result<EarnResult> {
        if base_amount < 0 {
            return Err(LedgerError::InvalidAmount(base_amount).into());
        }

        let multiplier = self.earn_multiplier(user_id, self.now())?;
        let earned = (base_amount as f64 * multiplier).round() as i64;
        let now = self.now();

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO coin_balance (user_id, local_balance, lifetime_earned, needs_sync)
             VALUES (?1, ?2, ?2, 1)
             ON CONFLICT(user_id) DO UPDATE SET
                local_balance = local_balance + ?2,
                lifetime_earned = lifetime_earned + ?2,
                needs_sync = 1",
            params![user_id, earned],
        )?;
        // Tier follows lifetime earnings.
        let lifetime_earned: i64 = tx.query_row(
            "SELECT lifetime_earned FROM coin_balance WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE coin_balance SET tier = ?1 WHERE user_id = ?2",
            params![CoinTier::for_lifetime_earned(lifetime_earned).as_str(), user_id],
        )?;
        Self::append_coin_event(
            &tx,
            user_id,
            CoinEventType::Earn,
            source_type,
            earned,
            description,
            now,
        )?;
        tx.commit()?;

        let balance = self.get_balance(user_id)?;
        Ok(EarnResult {
            earned,
            new_balance: balance.local_balance,
            queued: true,
            source_type: source_type.to_string(),
        })
    }

    fn spend_coins(
        &self,
        user_id: &str,
        source_type: &str,
        amount: i64,
        description: &str,
    ) -> Result<SpendResult> {
        let now = self.now();
        let tx = self.conn.unchecked_transaction()?;
        let result = Self::spend_in_tx(&tx, user_id, source_type, amount, description, now)?;
        tx.commit()?;
        Ok(result)
    }

    fn adjust_coins(&self, user_id: &str, delta: i64, description: &str) -> Result<i64> {
        let now = self.now();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO coin_balance (user_id, local_balance, needs_sync) VALUES (?1, ?2, 1)
             ON CONFLICT(user_id) DO UPDATE SET
                local_balance = local_balance + ?2,
                needs_sync = 1",
            params![user_id, delta],
        )?;
        Self::append_coin_event(
            &tx,
            user_id,
            CoinEventType::Adjust,
            "manual_adjustment",
            delta,
            description,
            now,
        )?;
        tx.commit()?;

        Ok(self.get_balance(user_id)?.local_balance)
    }
}

impl LearningRepository for SqliteRepository {
    fn get_srs_card(&self, user_id: &str, vocab_id: i64) -> Result<Option<SrsCardState>> {
        self.conn
            .query_row(
                "SELECT ease_factor, interval, repetitions, next_review, state, total_reviews,
                        correct_count
                 FROM vocab_srs_card WHERE user_id = ?1 AND vocab_id = ?2",
                params![user_id, vocab_id],
                |row| {
                    let state: String = row.get(4)?;
                    Ok(SrsCardState {
                        ease_factor: row.get(0)?,
                        interval: row.get(1)?,
                        repetitions: row.get(2)?,
                        next_review: row.get(3)?,
                        state: SrsState::from_str(&state).unwrap_or_default(),
                        total_reviews: row.get(5)?,
                        correct_count: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    fn upsert_srs_card(&self, user_id: &str, vocab_id: i64, state: &SrsCardState) -> Result<()> {
        self.conn.execute(
            "INSERT INTO vocab_srs_card (user_id, vocab_id, ease_factor, interval, repetitions,
                next_review, state, total_reviews, correct_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, vocab_id) DO UPDATE SET
                ease_factor = excluded.ease_factor,
                interval = excluded.interval,
                repetitions = excluded.repetitions,
                next_review = excluded.next_review,
                state = excluded.state,
                total_reviews = excluded.total_reviews,
                correct_count = excluded.correct_count",
            params![
                user_id,
                vocab_id,
                state.ease_factor,
                state.interval,
                state.repetitions,
                state.next_review,
                state.state.as_str(),
                state.total_reviews,
                state.correct_count,
            ],
        )?;
        Ok(())
    }

    fn record_review(
        &self,
        user_id: &str,
        vocab_id: i64,
        grade: ReviewGrade,
        algorithm: &dyn SrsAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<SrsCardState> {
        let current = self
            .get_srs_card(user_id, vocab_id)?
            .unwrap_or_else(|| algorithm.initial_state(now));
        let next = algorithm.schedule(&current, grade, now);

        let payload = serde_json::json!({
            "vocab_id": vocab_id,
            "grade": grade,
            "algorithm": algorithm.name(),
            "ease_factor": next.ease_factor,
            "interval": next.interval,
            "repetitions": next.repetitions,
            "next_review": next.next_review,
            "state": next.state,
        });

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO vocab_srs_card (user_id, vocab_id, ease_factor, interval, repetitions,
                next_review, state, total_reviews, correct_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, vocab_id) DO UPDATE SET
                ease_factor = excluded.ease_factor,
                interval = excluded.interval,
                repetitions = excluded.repetitions,
                next_review = excluded.next_review,
                state = excluded.state,
                total_reviews = excluded.total_reviews,
                correct_count = excluded.correct_count",
            params![
                user_id,
                vocab_id,
                next.ease_factor,
                next.interval,
                next.repetitions,
                next.next_review,
                next.state.as_str(),
                next.total_reviews,
                next.correct_count,
            ],
        )?;
        tx.execute(
            "INSERT INTO learning_sync_queue (event_id, user_id, event_type, payload, created_at,
                sync_status)
             VALUES (?1, ?2, 'review_complete', ?3, ?4, 'pending')",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                payload.to_string(),
                now.timestamp(),
            ],
        )?;
        tx.commit()?;

        Ok(next)
    }

    fn queue_learning_event(
        &self,
        user_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let now = self.now();
        self.conn.execute(
            "INSERT INTO learning_sync_queue (event_id, user_id, event_type, payload, created_at,
                sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                event_type,
                payload.to_string(),
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

impl SyncQueueRepository for SqliteRepository {
    fn pending_coin_events(&self, user_id: &str, max_retries: i64) -> Result<Vec<CoinEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, user_id, event_type, source_business, source_type, base_amount,
                    description, metadata, created_at, sync_status, retry_count, last_attempt_at,
                    error_message
             FROM coin_sync_queue
             WHERE user_id = ?1
               AND (sync_status = 'pending'
                    OR (sync_status = 'failed' AND retry_count < ?2))
             ORDER BY created_at ASC, id ASC",
        )?;

        let events = stmt
            .query_map(params![user_id, max_retries], Self::row_to_coin_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn pending_learning_events(
        &self,
        user_id: &str,
        max_retries: i64,
    ) -> Result<Vec<LearningEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, user_id, event_type, payload, created_at, sync_status,
                    retry_count, last_attempt_at, error_message
             FROM learning_sync_queue
             WHERE user_id = ?1
               AND (sync_status = 'pending'
                    OR (sync_status = 'failed' AND retry_count < ?2))
             ORDER BY created_at ASC, id ASC",
        )?;

        let events = stmt
            .query_map(params![user_id, max_retries], Self::row_to_learning_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn mark_coin_event_synced(&self, event_id: &str) -> Result<()> {
        self.mark_synced("coin_sync_queue", event_id)
    }

    fn mark_coin_event_failed(&self, event_id: &str, error: &str) -> Result<()> {
        self.mark_failed("coin_sync_queue", event_id, error)
    }

    fn mark_learning_event_synced(&self, event_id: &str) -> Result<()> {
        self.mark_synced("learning_sync_queue", event_id)
    }

    fn mark_learning_event_failed(&self, event_id: &str, error: &str) -> Result<()> {
        self.mark_failed("learning_sync_queue", event_id, error)
    }

    fn unsynced_amount_sum(&self, user_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(base_amount), 0) FROM coin_sync_queue
                 WHERE user_id = ?1 AND sync_status != 'synced'",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    fn coin_queue_counts(&self, user_id: &str) -> Result<QueueCounts> {
        self.queue_counts("coin_sync_queue", user_id)
    }

    fn learning_queue_counts(&self, user_id: &str) -> Result<QueueCounts> {
        self.queue_counts("learning_sync_queue", user_id)
    }

    fn insert_remote_coin_event(&self, event: &CoinEvent) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO coin_sync_queue (event_id, user_id, event_type,
                source_business, source_type, base_amount, description, metadata, created_at,
                sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'synced')",
            params![
                event.event_id,
                event.user_id,
                event.event_type.as_str(),
                event.source_business,
                event.source_type,
                event.base_amount,
                event.description,
                event.metadata,
                event.created_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn insert_remote_learning_event(
        &self,
        user_id: &str,
        remote_id: &str,
        event_type: &str,
        payload: &str,
        created_at: i64,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO learning_events (remote_id, user_id, event_type, payload,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![remote_id, user_id, event_type, payload, created_at],
        )?;
        Ok(inserted > 0)
    }
}

impl SyncMetadataRepository for SqliteRepository {
    fn get_sync_metadata(&self, user_id: &str) -> Result<SyncMetadata> {
        self.conn.execute(
            "INSERT OR IGNORE INTO learning_sync_metadata (user_id) VALUES (?1)",
            params![user_id],
        )?;
        self.conn
            .query_row(
                "SELECT user_id, device_id, last_synced_at, last_push_at, last_pull_at
                 FROM learning_sync_metadata WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(SyncMetadata {
                        user_id: row.get(0)?,
                        device_id: row.get(1)?,
                        last_synced_at: row.get(2)?,
                        last_push_at: row.get(3)?,
                        last_pull_at: row.get(4)?,
                    })
                },
            )
            .map_err(Into::into)
    }

    fn advance_watermarks(
        &self,
        user_id: &str,
        last_synced_at: i64,
        last_push_at: i64,
        last_pull_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO learning_sync_metadata (user_id) VALUES (?1)",
            params![user_id],
        )?;
        self.conn.execute(
            "UPDATE learning_sync_metadata SET
                last_synced_at = MAX(last_synced_at, ?1),
                last_push_at = MAX(last_push_at, ?2),
                last_pull_at = MAX(last_pull_at, ?3)
             WHERE user_id = ?4",
            params![last_synced_at, last_push_at, last_pull_at, user_id],
        )?;
        Ok(())
    }

    fn set_device_id(&self, user_id: &str, device_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO learning_sync_metadata (user_id) VALUES (?1)",
            params![user_id],
        )?;
        self.conn.execute(
            "UPDATE learning_sync_metadata SET device_id = ?1 WHERE user_id = ?2",
            params![device_id, user_id],
        )?;
        Ok(())
    }
}

impl UnlockRepository for SqliteRepository {
    fn unlock_content(
        &self,
        user_id: &str,
        content_type: &str,
        content_id: &str,
        cost_coins: i64,
    ) -> Result<SpendResult> {
        if self.is_unlocked(user_id, content_type, content_id)? {
            let balance = self.get_balance(user_id)?;
            return Ok(SpendResult {
                spent: 0,
                new_balance: balance.local_balance,
                queued: false,
            });
        }

        // Spend and unlock row commit together; a failed spend leaves no
        // unlock and a failed unlock insert rolls the spend back.
        let now = self.now();
        let tx = self.conn.unchecked_transaction()?;
        let result = Self::spend_in_tx(
            &tx,
            user_id,
            "premium_unlock",
            cost_coins,
            &format!("Unlock {content_type}/{content_id}"),
            now,
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO premium_content_unlocks (user_id, content_type, content_id,
                unlocked_at, cost_coins)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, content_type, content_id, now, cost_coins],
        )?;
        tx.commit()?;
        Ok(result)
    }

    fn is_unlocked(&self, user_id: &str, content_type: &str, content_id: &str) -> Result<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM premium_content_unlocks
                 WHERE user_id = ?1 AND content_type = ?2 AND content_id = ?3",
                params![user_id, content_type, content_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    fn activate_booster(
        &self,
        user_id: &str,
        booster_type: &str,
        multiplier: f64,
        duration_secs: i64,
    ) -> Result<()> {
        let now = self.now();
        self.conn.execute(
            "INSERT INTO active_boosters (user_id, booster_type, multiplier, activated_at,
                expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, booster_type, multiplier, now, now + duration_secs],
        )?;
        Ok(())
    }

    fn earn_multiplier(&self, user_id: &str, now: i64) -> Result<f64> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(multiplier), 1.0) FROM active_boosters
                 WHERE user_id = ?1 AND activated_at <= ?2 AND expires_at > ?2",
                params![user_id, now],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanjiquest_core::LOCAL_USER_ID;
    use pretty_assertions::assert_eq;

    fn repo() -> SqliteRepository {
        SqliteRepository::open_in_memory()
            .expect("in-memory db")
            .with_clock(Box::new(|| 1_700_000_000))
    }

    #[test]
    fn get_balance_initially_empty() {
        let repo = repo();
        let balance = repo.get_balance(LOCAL_USER_ID).unwrap();
        assert_eq!(balance.local_balance, 0);
        assert_eq!(balance.lifetime_earned, 0);
        assert_eq!(balance.tier, CoinTier::Bronze);
        assert!(!balance.needs_sync);
    }

    #[test]
    fn earn_coins_updates_balance_and_queues_event() {
        let repo = repo();
        let result = repo
            .earn_coins(LOCAL_USER_ID, "srs_review_complete", 10, "Test earn")
            .unwrap();
        assert_eq!(result.earned, 10);
        assert_eq!(result.new_balance, 10);
        assert!(result.queued);

        let balance = repo.get_balance(LOCAL_USER_ID).unwrap();
        assert_eq!(balance.local_balance, 10);
        assert_eq!(balance.lifetime_earned, 10);
        assert!(balance.needs_sync);

        let counts = repo.coin_queue_counts(LOCAL_USER_ID).unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn earn_coins_accumulates() {
        let repo = repo();
        repo.earn_coins(LOCAL_USER_ID, "srs_review_complete", 10, "Session 1")
            .unwrap();
        repo.earn_coins(LOCAL_USER_ID, "perfect_quiz", 25, "Perfect score")
            .unwrap();
        repo.earn_coins(LOCAL_USER_ID, "streak_7_days", 50, "7-day streak")
            .unwrap();

        let balance = repo.get_balance(LOCAL_USER_ID).unwrap();
        assert_eq!(balance.local_balance, 85);
        assert_eq!(balance.lifetime_earned, 85);
        assert_eq!(balance.synced_balance, 0);
    }

    #[test]
    fn earn_negative_amount_rejected() {
        let repo = repo();
        let err = repo
            .earn_coins(LOCAL_USER_ID, "bad", -5, "nope")
            .unwrap_err();
        assert!(matches!(err, DbError::Ledger(LedgerError::InvalidAmount(-5))));
    }

    #[test]
    fn spend_requires_funds() {
        let repo = repo();
        repo.earn_coins(LOCAL_USER_ID, "session_complete", 30, "earn")
            .unwrap();
        let err = repo
            .spend_coins(LOCAL_USER_ID, "shop", 50, "too much")
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::Ledger(LedgerError::InsufficientFunds { required: 50, available: 30 })
        ));

        let result = repo.spend_coins(LOCAL_USER_ID, "shop", 20, "ok").unwrap();
        assert_eq!(result.new_balance, 10);
    }

    #[test]
    fn local_balance_equals_synced_plus_unsynced_sum() {
        let repo = repo();
        repo.earn_coins(LOCAL_USER_ID, "session_complete", 50, "A")
            .unwrap();
        repo.earn_coins(LOCAL_USER_ID, "session_complete", 30, "B")
            .unwrap();
        repo.spend_coins(LOCAL_USER_ID, "shop", 15, "C").unwrap();

        let balance = repo.get_balance(LOCAL_USER_ID).unwrap();
        let unsynced = repo.unsynced_amount_sum(LOCAL_USER_ID).unwrap();
        assert_eq!(balance.local_balance, balance.synced_balance + unsynced);
        assert_eq!(unsynced, 65);
    }

    #[test]
    fn tier_upgrades_with_lifetime_earned() {
        let repo = repo();
        repo.earn_coins("u", "event_reward", 1_200, "big").unwrap();
        assert_eq!(repo.get_balance("u").unwrap().tier, CoinTier::Silver);

        repo.earn_coins("u", "event_reward", 4_000, "bigger").unwrap();
        assert_eq!(repo.get_balance("u").unwrap().tier, CoinTier::Gold);
    }

    #[test]
    fn tier_matches_threshold_exactly() {
        let repo = repo();
        repo.earn_coins("u", "event_reward", 999, "almost").unwrap();
        assert_eq!(repo.get_balance("u").unwrap().tier, CoinTier::Bronze);

        repo.earn_coins("u", "event_reward", 1, "over the line").unwrap();
        let balance = repo.get_balance("u").unwrap();
        assert_eq!(balance.lifetime_earned, 1_000);
        assert_eq!(balance.tier, CoinTier::for_lifetime_earned(balance.lifetime_earned));
        assert_eq!(balance.tier, CoinTier::Silver);
    }

    #[test]
    fn different_users_have_separate_balances() {
        let repo = repo();
        repo.earn_coins("user_a", "srs_review_complete", 10, "A").unwrap();
        repo.earn_coins("user_b", "srs_review_complete", 25, "B").unwrap();

        assert_eq!(repo.get_balance("user_a").unwrap().local_balance, 10);
        assert_eq!(repo.get_balance("user_b").unwrap().local_balance, 25);
    }

    #[test]
    fn failed_events_excluded_after_retry_budget() {
        let repo = repo();
        repo.earn_coins(LOCAL_USER_ID, "session_complete", 10, "A")
            .unwrap();
        let events = repo.pending_coin_events(LOCAL_USER_ID, 5).unwrap();
        assert_eq!(events.len(), 1);
        let event_id = events[0].event_id.clone();

        for _ in 0..4 {
            repo.mark_coin_event_failed(&event_id, "HTTP 503").unwrap();
        }
        // retry_count = 4 < 5: still eligible
        assert_eq!(repo.pending_coin_events(LOCAL_USER_ID, 5).unwrap().len(), 1);

        repo.mark_coin_event_failed(&event_id, "HTTP 503").unwrap();
        // retry_count = 5: exhausted
        assert_eq!(repo.pending_coin_events(LOCAL_USER_ID, 5).unwrap().len(), 0);
        // still counted toward the unsynced sum so the ledger invariant holds
        assert_eq!(repo.unsynced_amount_sum(LOCAL_USER_ID).unwrap(), 10);
    }

    #[test]
    fn pending_events_ordered_by_creation() {
        let repo = repo();
        repo.earn_coins(LOCAL_USER_ID, "first", 1, "1").unwrap();
        repo.earn_coins(LOCAL_USER_ID, "second", 2, "2").unwrap();
        repo.earn_coins(LOCAL_USER_ID, "third", 3, "3").unwrap();

        let events = repo.pending_coin_events(LOCAL_USER_ID, 5).unwrap();
        let sources: Vec<_> = events.iter().map(|e| e.source_type.as_str()).collect();
        assert_eq!(sources, vec!["first", "second", "third"]);
    }

    #[test]
    fn remote_coin_event_insert_is_idempotent() {
        let repo = repo();
        let event = CoinEvent {
            id: 0,
            event_id: "remote-abc".to_string(),
            user_id: "u".to_string(),
            event_type: CoinEventType::Earn,
            source_business: SOURCE_BUSINESS.to_string(),
            source_type: "session_complete".to_string(),
            base_amount: 40,
            description: "from another device".to_string(),
            metadata: "{}".to_string(),
            created_at: 1_700_000_100,
            sync_status: SyncStatus::Synced,
            retry_count: 0,
            last_attempt_at: None,
            error_message: None,
        };
        assert!(repo.insert_remote_coin_event(&event).unwrap());
        assert!(!repo.insert_remote_coin_event(&event).unwrap());
    }

    #[test]
    fn watermarks_never_move_backward() {
        let repo = repo();
        repo.advance_watermarks("u", 100, 100, 100).unwrap();
        repo.advance_watermarks("u", 50, 200, 80).unwrap();

        let meta = repo.get_sync_metadata("u").unwrap();
        assert_eq!(meta.last_synced_at, 100);
        assert_eq!(meta.last_push_at, 200);
        assert_eq!(meta.last_pull_at, 100);
    }

    #[test]
    fn unlock_content_spends_once() {
        let repo = repo();
        repo.earn_coins("u", "event_reward", 500, "seed").unwrap();

        let first = repo.unlock_content("u", "theme", "sakura", 200).unwrap();
        assert_eq!(first.spent, 200);
        assert_eq!(first.new_balance, 300);
        assert!(repo.is_unlocked("u", "theme", "sakura").unwrap());

        let second = repo.unlock_content("u", "theme", "sakura", 200).unwrap();
        assert_eq!(second.spent, 0);
        assert_eq!(second.new_balance, 300);
    }

    #[test]
    fn failed_unlock_leaves_no_partial_state() {
        let repo = repo();
        repo.earn_coins("u", "event_reward", 100, "seed").unwrap();

        let err = repo.unlock_content("u", "theme", "sakura", 200).unwrap_err();
        assert!(matches!(
            err,
            DbError::Ledger(LedgerError::InsufficientFunds { required: 200, available: 100 })
        ));

        // No unlock row, no debit, no spend event queued.
        assert!(!repo.is_unlocked("u", "theme", "sakura").unwrap());
        assert_eq!(repo.get_balance("u").unwrap().local_balance, 100);
        assert_eq!(repo.coin_queue_counts("u").unwrap().pending, 1);
    }

    #[test]
    fn booster_multiplies_earnings() {
        let repo = repo();
        repo.activate_booster("u", "double_coins", 2.0, 3600).unwrap();
        let result = repo.earn_coins("u", "session_complete", 10, "boosted").unwrap();
        assert_eq!(result.earned, 20);
    }

    #[test]
    fn migrate_user_data_moves_all_tables() {
        let repo = repo();
        repo.earn_coins(LOCAL_USER_ID, "session_complete", 100, "seed")
            .unwrap();
        repo.queue_learning_event(LOCAL_USER_ID, "xp_gain", &serde_json::json!({"xp": 10}))
            .unwrap();
        repo.activate_booster(LOCAL_USER_ID, "double_coins", 2.0, 60)
            .unwrap();

        let moved = repo.migrate_user_data(LOCAL_USER_ID, "auth-uuid").unwrap();
        assert!(moved >= 4);

        assert!(!repo.has_balance_row(LOCAL_USER_ID).unwrap());
        assert!(repo.has_balance_row("auth-uuid").unwrap());
        assert_eq!(repo.get_balance("auth-uuid").unwrap().local_balance, 100);
        assert_eq!(repo.coin_queue_counts("auth-uuid").unwrap().pending, 1);
        assert_eq!(repo.learning_queue_counts("auth-uuid").unwrap().pending, 1);
    }
}
