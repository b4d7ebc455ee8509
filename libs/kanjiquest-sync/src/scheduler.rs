//! Background sync scheduling.
//!
//! Platform shells wire their own lifecycle hooks (app open, session
//! complete) straight to [`SyncEngine::sync_all`]; this module provides the
//! periodic driver those shells share.

use std::time::Duration;

use kanjiquest_core::SyncTrigger;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::sync::{remote::RemoteStore, SyncEngine, SyncOutcome};

/// Policy for the periodic background loop.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicSyncSpec {
    /// Pause between successful runs.
    pub interval: Duration,
    /// Skip the run entirely when the remote store is unreachable.
    pub requires_network: bool,
    /// First backoff delay after a failed run; doubles per consecutive
    /// failure up to [`Self::backoff_max`].
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for PeriodicSyncSpec {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            requires_network: true,
            backoff_initial: Duration::from_secs(15 * 60),
            backoff_max: Duration::from_secs(4 * 60 * 60),
        }
    }
}

impl PeriodicSyncSpec {
    fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let doubled = self
            .backoff_initial
            .saturating_mul(2u32.saturating_pow(consecutive_failures.saturating_sub(1)));
        doubled.min(self.backoff_max)
    }
}

/// Drives periodic background syncs until `shutdown` flips to true.
///
/// Failures back off exponentially; a successful run resets the cadence.
/// Runs that end in [`SyncOutcome::NotAuthenticated`] or
/// [`SyncOutcome::Disabled`] are treated as quiet successes so the loop does
/// not spin its backoff while signed out.
pub async fn run_periodic<R: RemoteStore>(
    engine: SyncEngine<R>,
    spec: PeriodicSyncSpec,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        let delay = if consecutive_failures == 0 {
            spec.interval
        } else {
            spec.backoff_for(consecutive_failures)
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("periodic sync loop stopped");
                    return;
                }
            }
        }

        if spec.requires_network && !engine.remote_reachable().await {
            debug!("periodic sync skipped, remote unreachable");
            continue;
        }

        match engine.sync_all(SyncTrigger::BackgroundPeriodic).await {
            Ok(SyncOutcome::Completed { pushed, pulled }) => {
                debug!(pushed, pulled, "periodic sync completed");
                consecutive_failures = 0;
            }
            Ok(_) => {
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    error = %e,
                    consecutive_failures,
                    "periodic sync failed, backing off"
                );
            }
        }
    }
}
