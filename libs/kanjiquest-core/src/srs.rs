//! Spaced-repetition capability consumed by the sync engine.

use chrono::{DateTime, Utc};

use crate::types::{ReviewGrade, SrsCardState};

/// Trait for spaced repetition schedulers.
///
/// The engine never implements scheduling itself; hosts inject a concrete
/// algorithm and the ledger records whatever state it produces.
pub trait SrsAlgorithm: Send + Sync {
    /// Algorithm identifier.
    fn name(&self) -> &'static str;

    /// Next card state after a graded review.
    fn schedule(&self, state: &SrsCardState, grade: ReviewGrade, now: DateTime<Utc>)
        -> SrsCardState;

    /// State for a card that has never been reviewed.
    fn initial_state(&self, now: DateTime<Utc>) -> SrsCardState {
        let _ = now;
        SrsCardState::default()
    }
}
