//! Core types for the KanjiQuest economy and learning sync model.

use serde::{Deserialize, Serialize};

/// Sentinel identity for a user who has never signed in.
///
/// All ledger and queue tables are keyed by this id until the first sign-in
/// migrates them to an authenticated UUID.
pub const LOCAL_USER_ID: &str = "local_user";

/// Fixed partition tag stamped on every economic event.
pub const SOURCE_BUSINESS: &str = "kanjiquests";

/// Reputation bracket derived from lifetime coin earnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Default for CoinTier {
    fn default() -> Self {
        Self::Bronze
    }
}

impl CoinTier {
    /// Lifetime-earned thresholds for each tier.
    const SILVER_AT: i64 = 1_000;
    const GOLD_AT: i64 = 5_000;
    const PLATINUM_AT: i64 = 20_000;
    const DIAMOND_AT: i64 = 50_000;

    pub fn for_lifetime_earned(lifetime_earned: i64) -> Self {
        match lifetime_earned {
            n if n >= Self::DIAMOND_AT => Self::Diamond,
            n if n >= Self::PLATINUM_AT => Self::Platinum,
            n if n >= Self::GOLD_AT => Self::Gold,
            n if n >= Self::SILVER_AT => Self::Silver,
            _ => Self::Bronze,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
            Self::Diamond => "diamond",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "bronze" => Some(Self::Bronze),
            "silver" => Some(Self::Silver),
            "gold" => Some(Self::Gold),
            "platinum" => Some(Self::Platinum),
            "diamond" => Some(Self::Diamond),
            _ => None,
        }
    }
}

/// Kind of economic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinEventType {
    Earn,
    Spend,
    Adjust,
}

impl CoinEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Spend => "spend",
            Self::Adjust => "adjust",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "earn" => Some(Self::Earn),
            "spend" => Some(Self::Spend),
            "adjust" => Some(Self::Adjust),
            _ => None,
        }
    }
}

/// Lifecycle state of a queued event.
///
/// `Synced` is terminal; rows are retained for audit. `Failed` rows are
/// retried until the retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the `coin_balance` ledger.
///
/// `local_balance` is authoritative for the UI and moves immediately with
/// gameplay; `synced_balance` trails it, moving only when the remote store
/// confirms events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinBalance {
    pub user_id: String,
    pub local_balance: i64,
    pub synced_balance: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
    pub tier: CoinTier,
    pub last_synced_at: i64,
    pub needs_sync: bool,
}

impl CoinBalance {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            local_balance: 0,
            synced_balance: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
            tier: CoinTier::Bronze,
            last_synced_at: 0,
            needs_sync: false,
        }
    }
}

/// Durable economic event, one row of `coin_sync_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinEvent {
    /// Monotonic local rowid.
    pub id: i64,
    /// Stable idempotency key (uuid v4, assigned at enqueue time).
    pub event_id: String,
    pub user_id: String,
    pub event_type: CoinEventType,
    pub source_business: String,
    /// Free-form cause, e.g. "session_complete".
    pub source_type: String,
    /// Signed coin delta.
    pub base_amount: i64,
    pub description: String,
    /// Opaque structured blob, JSON text.
    pub metadata: String,
    /// Event time (epoch seconds), not sync time.
    pub created_at: i64,
    pub sync_status: SyncStatus,
    pub retry_count: i64,
    pub last_attempt_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Durable learning event, one row of `learning_sync_queue`.
///
/// Same lifecycle as [`CoinEvent`] but append-only history rather than a
/// balance-affecting ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub id: i64,
    pub event_id: String,
    pub user_id: String,
    pub event_type: String,
    /// Serialized domain event (review outcome, XP gain, ...).
    pub payload: String,
    pub created_at: i64,
    pub sync_status: SyncStatus,
    pub retry_count: i64,
    pub last_attempt_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Per-user sync watermarks. Timestamps never move backward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub user_id: String,
    pub device_id: Option<String>,
    pub last_synced_at: i64,
    pub last_push_at: i64,
    pub last_pull_at: i64,
}

/// Device identity submitted on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    /// "android", "ios_iphone", "ios_ipad", "desktop"
    pub platform: String,
    pub app_version: String,
}

/// What caused a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    AppOpen,
    SessionComplete,
    BackgroundPeriodic,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppOpen => "app_open",
            Self::SessionComplete => "session_complete",
            Self::BackgroundPeriodic => "background_periodic",
            Self::Manual => "manual",
        }
    }
}

/// Result of an earn operation.
#[derive(Debug, Clone, Serialize)]
pub struct EarnResult {
    pub earned: i64,
    pub new_balance: i64,
    /// True when a sync queue row was appended alongside the balance change.
    pub queued: bool,
    pub source_type: String,
}

/// Result of a spend operation.
#[derive(Debug, Clone, Serialize)]
pub struct SpendResult {
    pub spent: i64,
    pub new_balance: i64,
    pub queued: bool,
}

/// SRS learning state of a vocabulary card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrsCardState {
    pub ease_factor: f64,
    /// Days until the next review.
    pub interval: i64,
    pub repetitions: i64,
    /// Epoch seconds of the next scheduled review.
    pub next_review: i64,
    pub state: SrsState,
    pub total_reviews: i64,
    pub correct_count: i64,
}

impl Default for SrsCardState {
    fn default() -> Self {
        Self {
            ease_factor: 2.5,
            interval: 0,
            repetitions: 0,
            next_review: 0,
            state: SrsState::New,
            total_reviews: 0,
            correct_count: 0,
        }
    }
}

/// SRS scheduling state of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrsState {
    New,
    Learning,
    Review,
    Relearning,
}

impl Default for SrsState {
    fn default() -> Self {
        Self::New
    }
}

impl SrsState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Learning => "learning",
            Self::Review => "review",
            Self::Relearning => "relearning",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "learning" => Some(Self::Learning),
            "review" => Some(Self::Review),
            "relearning" => Some(Self::Relearning),
            _ => None,
        }
    }
}

/// Grade given to a review answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewGrade {
    Again,
    Hard,
    Good,
    Easy,
}

impl ReviewGrade {
    pub fn is_correct(self) -> bool {
        !matches!(self, Self::Again)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tier_thresholds() {
        assert_eq!(CoinTier::for_lifetime_earned(0), CoinTier::Bronze);
        assert_eq!(CoinTier::for_lifetime_earned(999), CoinTier::Bronze);
        assert_eq!(CoinTier::for_lifetime_earned(1_000), CoinTier::Silver);
        assert_eq!(CoinTier::for_lifetime_earned(5_000), CoinTier::Gold);
        assert_eq!(CoinTier::for_lifetime_earned(20_000), CoinTier::Platinum);
        assert_eq!(CoinTier::for_lifetime_earned(50_000), CoinTier::Diamond);
        assert_eq!(CoinTier::for_lifetime_earned(1_000_000), CoinTier::Diamond);
    }

    #[test]
    fn tier_round_trips_through_str() {
        for tier in [
            CoinTier::Bronze,
            CoinTier::Silver,
            CoinTier::Gold,
            CoinTier::Platinum,
            CoinTier::Diamond,
        ] {
            assert_eq!(CoinTier::from_str(tier.as_str()), Some(tier));
        }
        assert_eq!(CoinTier::from_str("wood"), None);
    }

    #[test]
    fn sync_status_round_trips() {
        for status in [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Failed] {
            assert_eq!(SyncStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn grade_correctness() {
        assert!(!ReviewGrade::Again.is_correct());
        assert!(ReviewGrade::Hard.is_correct());
        assert!(ReviewGrade::Good.is_correct());
        assert!(ReviewGrade::Easy.is_correct());
    }
}
