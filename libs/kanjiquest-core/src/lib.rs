//! Core domain library shared by the KanjiQuest sync engine and host apps.
//!
//! Provides:
//! - Identity model (anonymous sentinel vs. authenticated UUID)
//! - J Coin economy types (balance, tiers, economic events)
//! - Learning event and SRS card types
//! - Capability traits consumed by the engine (`SrsAlgorithm`,
//!   `UserSessionProvider`)

pub mod error;
pub mod session;
pub mod srs;
pub mod types;

pub use error::LedgerError;
pub use session::{PremiumLevel, UserSessionProvider};
pub use srs::SrsAlgorithm;
pub use types::{
    CoinBalance, CoinEvent, CoinEventType, CoinTier, DeviceInfo, EarnResult, LearningEvent,
    ReviewGrade, SpendResult, SrsCardState, SrsState, SyncMetadata, SyncStatus, SyncTrigger,
    LOCAL_USER_ID, SOURCE_BUSINESS,
};
