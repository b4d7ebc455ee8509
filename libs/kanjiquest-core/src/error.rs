//! Domain-level ledger errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
}
