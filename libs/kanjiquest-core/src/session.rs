//! User session capability consumed by the sync engine.

use serde::{Deserialize, Serialize};

use crate::types::LOCAL_USER_ID;

/// Entitlement level of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PremiumLevel {
    Free,
    Premium,
    Admin,
}

/// Provides the identity active on this device session.
///
/// Exactly one identity is active at a time: either the anonymous
/// [`LOCAL_USER_ID`] sentinel or an authenticated UUID.
pub trait UserSessionProvider: Send + Sync {
    /// Current user id; [`LOCAL_USER_ID`] when nobody is signed in.
    fn current_user_id(&self) -> String;

    fn premium_level(&self) -> PremiumLevel {
        PremiumLevel::Free
    }

    fn is_authenticated(&self) -> bool {
        self.current_user_id() != LOCAL_USER_ID
    }
}
