//! Identity migration from the anonymous local user to an authenticated
//! account.
//!
//! Until sign-in, every row is keyed by [`LOCAL_USER_ID`]. On first sign-in
//! the accumulated data is re-keyed to the account uuid in one transaction,
//! after which the queued events sync under the real identity.

use std::sync::{Arc, Mutex};

use kanjiquest_core::LOCAL_USER_ID;
use tracing::{debug, info};

use crate::db::{DbError, SqliteRepository};

/// What a migration attempt did.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// The signed-in id is still the anonymous sentinel.
    SkippedNotAuthenticated,
    /// Nothing accumulated under the anonymous identity.
    SkippedNoLocalData,
    /// The account already has local data; anonymous rows are left in place
    /// rather than merged.
    SkippedExistingData,
    Migrated { rows_moved: usize },
}

/// Re-keys anonymous data to `auth_user_id`. Safe to call on every sign-in;
/// repeat calls are no-ops.
pub fn migrate_local_data(
    repo: &Arc<Mutex<SqliteRepository>>,
    auth_user_id: &str,
) -> Result<MigrationOutcome, DbError> {
    let repo = repo
        .lock()
        .map_err(|_| DbError::InvalidData("repository lock poisoned".to_string()))?;

    if auth_user_id == LOCAL_USER_ID {
        debug!("migration skipped, still anonymous");
        return Ok(MigrationOutcome::SkippedNotAuthenticated);
    }
    if !repo.has_balance_row(LOCAL_USER_ID)? {
        debug!(user_id = %auth_user_id, "migration skipped, no anonymous data");
        return Ok(MigrationOutcome::SkippedNoLocalData);
    }
    if repo.has_balance_row(auth_user_id)? {
        debug!(user_id = %auth_user_id, "migration skipped, account already has data");
        return Ok(MigrationOutcome::SkippedExistingData);
    }

    let rows_moved = repo.migrate_user_data(LOCAL_USER_ID, auth_user_id)?;
    info!(user_id = %auth_user_id, rows_moved, "anonymous data migrated");
    Ok(MigrationOutcome::Migrated { rows_moved })
}
