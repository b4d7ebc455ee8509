//! Database error types.

use kanjiquest_core::LedgerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
