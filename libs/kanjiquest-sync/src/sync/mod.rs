//! Push/pull reconciler between the local database and the remote store.
//!
//! The engine is offline-first: gameplay never waits on it. A run drains the
//! durable queues (push), merges remote changes (pull) and only then advances
//! the watermarks, so an interrupted run repeats work instead of losing it.
//! Every queued event carries a uuid idempotency key, which makes repeats
//! safe on both sides.

pub mod remote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kanjiquest_core::{DeviceInfo, SrsCardState, SrsState, SyncTrigger, UserSessionProvider};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::{
    CoinRepository, DbError, LearningRepository, SqliteRepository, SyncMetadataRepository,
    SyncQueueRepository,
};
use remote::{EventAck, OutboundCoinEvent, OutboundLearningEvent, PullDelta, RemoteStore};

/// Errors surfaced by a sync run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("failed to parse backend response: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("sync cancelled")]
    Cancelled,
}

/// Terminal state of a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Both phases ran; watermarks advanced.
    Completed { pushed: usize, pulled: usize },
    /// Another run for the same user is in flight.
    AlreadyRunning,
    /// No remote store configured; local-only mode.
    Disabled,
    /// The current identity is the anonymous local user.
    NotAuthenticated,
}

/// Snapshot of engine state for UI surfaces.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStatus {
    pub is_syncing: bool,
    pub last_trigger: Option<SyncTrigger>,
    pub last_error: Option<String>,
    pub last_finished_at: Option<i64>,
}

/// Removes the user from the in-flight map when a run ends, however it ends.
struct InFlightGuard<'a> {
    map: &'a Mutex<HashMap<String, Arc<AtomicBool>>>,
    user_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(&self.user_id);
        }
    }
}

struct SyncEngineInner<R> {
    repo: Arc<Mutex<SqliteRepository>>,
    remote: Option<R>,
    session: Arc<dyn UserSessionProvider>,
    config: SyncConfig,
    /// One entry per running sync, holding that run's cancel flag.
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
    status: Mutex<EngineStatus>,
}

/// The reconciler. Cheap to clone; all clones share one engine.
pub struct SyncEngine<R: RemoteStore> {
    inner: Arc<SyncEngineInner<R>>,
}

impl<R: RemoteStore> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore> SyncEngine<R> {
    /// `remote: None` produces a permanently disabled engine whose runs
    /// report [`SyncOutcome::Disabled`] without touching the queues.
    pub fn new(
        repo: Arc<Mutex<SqliteRepository>>,
        remote: Option<R>,
        session: Arc<dyn UserSessionProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SyncEngineInner {
                repo,
                remote,
                session,
                config,
                in_flight: Mutex::new(HashMap::new()),
                status: Mutex::new(EngineStatus::default()),
            }),
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.inner
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Requests cancellation of the named user's in-flight run, if any. The
    /// run stops at its next checkpoint; work already confirmed stays
    /// confirmed. Other users' runs are unaffected.
    pub fn request_cancel(&self, user_id: &str) {
        if let Ok(in_flight) = self.inner.in_flight.lock() {
            if let Some(flag) = in_flight.get(user_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    fn checkpoint(cancel: &AtomicBool) -> Result<(), SyncError> {
        if cancel.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn with_repo<T>(
        &self,
        f: impl FnOnce(&SqliteRepository) -> Result<T, DbError>,
    ) -> Result<T, SyncError> {
        let repo = self
            .inner
            .repo
            .lock()
            .map_err(|_| DbError::InvalidData("repository lock poisoned".to_string()))?;
        f(&repo).map_err(Into::into)
    }

    /// True when a remote store is configured and answers its health probe.
    pub async fn remote_reachable(&self) -> bool {
        match self.inner.remote.as_ref() {
            Some(remote) => remote.check_connectivity().await,
            None => false,
        }
    }

    /// Runs a full push/pull cycle for the current user.
    pub async fn sync_all(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let user_id = self.inner.session.current_user_id();
        if !self.inner.session.is_authenticated() {
            debug!(trigger = trigger.as_str(), "sync skipped, not authenticated");
            return Ok(SyncOutcome::NotAuthenticated);
        }

        let Some(remote) = self.inner.remote.as_ref() else {
            return Ok(SyncOutcome::Disabled);
        };

        // Single flight per user. The guard releases the slot on any exit;
        // the cancel flag lives and dies with this run.
        let (cancel, _guard) = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .map_err(|_| DbError::InvalidData("in-flight lock poisoned".to_string()))?;
            if in_flight.contains_key(&user_id) {
                return Ok(SyncOutcome::AlreadyRunning);
            }
            let cancel = Arc::new(AtomicBool::new(false));
            in_flight.insert(user_id.clone(), Arc::clone(&cancel));
            (
                cancel,
                InFlightGuard {
                    map: &self.inner.in_flight,
                    user_id: user_id.clone(),
                },
            )
        };

        if let Ok(mut status) = self.inner.status.lock() {
            status.is_syncing = true;
            status.last_trigger = Some(trigger);
            status.last_error = None;
        }
        info!(user_id = %user_id, trigger = trigger.as_str(), "sync started");

        let result = self.run(remote, &user_id, &cancel).await;

        if let Ok(mut status) = self.inner.status.lock() {
            status.is_syncing = false;
            status.last_finished_at = Some(chrono::Utc::now().timestamp());
            if let Err(ref e) = result {
                status.last_error = Some(e.to_string());
            }
        }

        match &result {
            Ok(SyncOutcome::Completed { pushed, pulled }) => {
                info!(user_id = %user_id, pushed, pulled, "sync completed");
            }
            Ok(outcome) => debug!(user_id = %user_id, ?outcome, "sync ended early"),
            Err(e) => warn!(user_id = %user_id, error = %e, "sync failed"),
        }
        result
    }

    async fn run(
        &self,
        remote: &R,
        user_id: &str,
        cancel: &AtomicBool,
    ) -> Result<SyncOutcome, SyncError> {
        self.ensure_device_registered(user_id).await?;

        Self::checkpoint(cancel)?;
        let pushed = self.push_phase(remote, user_id, cancel).await?;

        Self::checkpoint(cancel)?;
        let push_time = chrono::Utc::now().timestamp();
        let since = self.with_repo(|r| r.get_sync_metadata(user_id))?.last_pull_at;
        let delta = remote.pull_changes(since).await?;

        Self::checkpoint(cancel)?;
        let pulled = self.apply_pull(user_id, &delta)?;

        // Watermarks move only after both phases land; a failed run repeats
        // work, it never skips any.
        self.with_repo(|r| {
            r.advance_watermarks(
                user_id,
                push_time.max(delta.server_time),
                push_time,
                delta.server_time,
            )
        })?;

        self.verify_ledger(user_id)?;
        Ok(SyncOutcome::Completed { pushed, pulled })
    }

    /// Registers this device under the host-supplied identity and persists
    /// the issued id into the sync metadata row.
    ///
    /// Safe to call on every app open: an already-registered device returns
    /// the stored id without a network round trip. Returns `None` when no
    /// remote store is configured.
    pub async fn register_device(
        &self,
        user_id: &str,
        info: &DeviceInfo,
    ) -> Result<Option<String>, SyncError> {
        let metadata = self.with_repo(|r| r.get_sync_metadata(user_id))?;
        if metadata.device_id.is_some() {
            return Ok(metadata.device_id);
        }

        let Some(remote) = self.inner.remote.as_ref() else {
            return Ok(None);
        };
        let registration = remote.register_device(info).await?;
        info!(user_id = %user_id, device_id = %registration.device_id, "device registered");
        self.with_repo(|r| r.set_device_id(user_id, &registration.device_id))?;
        Ok(Some(registration.device_id))
    }

    /// Fallback registration with a generic identity, for hosts that never
    /// called [`Self::register_device`] before the first sync.
    async fn ensure_device_registered(&self, user_id: &str) -> Result<(), SyncError> {
        let info = DeviceInfo {
            device_name: hostname(),
            platform: "desktop".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.register_device(user_id, &info).await.map(|_| ())
    }

    async fn push_phase(
        &self,
        remote: &R,
        user_id: &str,
        cancel: &AtomicBool,
    ) -> Result<usize, SyncError> {
        let max_retries = self.inner.config.max_retries;
        let coin_events = self.with_repo(|r| r.pending_coin_events(user_id, max_retries))?;
        let learning_events =
            self.with_repo(|r| r.pending_learning_events(user_id, max_retries))?;

        if coin_events.is_empty() && learning_events.is_empty() {
            return Ok(0);
        }

        let mut pushed = 0;
        let batch = self.inner.config.push_batch_size.max(1);
        let coin_chunks = coin_events.chunks(batch);
        let learning_chunks = learning_events.chunks(batch);

        for chunk in coin_chunks {
            let outbound: Vec<OutboundCoinEvent> = chunk.iter().map(Into::into).collect();
            let acks = remote.push_events(&outbound, &[]).await?;
            pushed += self.apply_coin_acks(user_id, chunk, &acks)?;
            Self::checkpoint(cancel)?;
        }

        for chunk in learning_chunks {
            let outbound: Vec<OutboundLearningEvent> = chunk.iter().map(Into::into).collect();
            let acks = remote.push_events(&[], &outbound).await?;
            pushed += self.apply_learning_acks(chunk, &acks)?;
            Self::checkpoint(cancel)?;
        }

        Ok(pushed)
    }

    fn apply_coin_acks(
        &self,
        user_id: &str,
        sent: &[kanjiquest_core::CoinEvent],
        acks: &[EventAck],
    ) -> Result<usize, SyncError> {
        let mut accepted = 0;
        let mut confirmed_amount = 0;

        self.with_repo(|r| {
            for ack in acks {
                match ack {
                    EventAck::Accepted { event_id } => {
                        r.mark_coin_event_synced(event_id)?;
                        if let Some(event) = sent.iter().find(|e| &e.event_id == event_id) {
                            confirmed_amount += event.base_amount;
                        }
                        accepted += 1;
                    }
                    EventAck::Rejected { event_id, reason } => {
                        warn!(event_id = %event_id, reason = %reason, "coin event rejected");
                        r.mark_coin_event_failed(event_id, reason)?;
                    }
                }
            }
            if confirmed_amount != 0 || accepted > 0 {
                r.advance_synced_balance(user_id, confirmed_amount)?;
            }
            Ok(())
        })?;

        Ok(accepted)
    }

    fn apply_learning_acks(
        &self,
        _sent: &[kanjiquest_core::LearningEvent],
        acks: &[EventAck],
    ) -> Result<usize, SyncError> {
        let mut accepted = 0;
        self.with_repo(|r| {
            for ack in acks {
                match ack {
                    EventAck::Accepted { event_id } => {
                        r.mark_learning_event_synced(event_id)?;
                        accepted += 1;
                    }
                    EventAck::Rejected { event_id, reason } => {
                        warn!(event_id = %event_id, reason = %reason, "learning event rejected");
                        r.mark_learning_event_failed(event_id, reason)?;
                    }
                }
            }
            Ok(())
        })?;
        Ok(accepted)
    }

    fn apply_pull(&self, user_id: &str, delta: &PullDelta) -> Result<usize, SyncError> {
        let mut applied = 0;

        self.with_repo(|r| {
            for event in &delta.coin_events {
                let row = kanjiquest_core::CoinEvent {
                    id: 0,
                    event_id: event.event_id.clone(),
                    user_id: user_id.to_string(),
                    event_type: kanjiquest_core::CoinEventType::from_str(&event.event_type)
                        .unwrap_or(kanjiquest_core::CoinEventType::Adjust),
                    source_business: event.source_business.clone(),
                    source_type: event.source_type.clone(),
                    base_amount: event.base_amount,
                    description: event.description.clone(),
                    metadata: event.metadata.clone().unwrap_or_else(|| "{}".to_string()),
                    created_at: event.created_at,
                    sync_status: kanjiquest_core::SyncStatus::Synced,
                    retry_count: 0,
                    last_attempt_at: None,
                    error_message: None,
                };
                if r.insert_remote_coin_event(&row)? {
                    applied += 1;
                }
            }

            for event in &delta.learning_events {
                if r.insert_remote_learning_event(
                    user_id,
                    &event.remote_id,
                    &event.event_type,
                    &event.payload,
                    event.created_at,
                )? {
                    applied += 1;
                }
            }

            for card in &delta.srs_cards {
                let incoming = SrsCardState {
                    ease_factor: card.ease_factor,
                    interval: card.interval,
                    repetitions: card.repetitions,
                    next_review: card.next_review,
                    state: SrsState::from_str(&card.state).unwrap_or_default(),
                    total_reviews: card.total_reviews,
                    correct_count: card.correct_count,
                };
                // Most-reviewed wins; equal histories defer to the server.
                let keep_local = r
                    .get_srs_card(user_id, card.vocab_id)?
                    .map(|local| local.total_reviews > incoming.total_reviews)
                    .unwrap_or(false);
                if !keep_local {
                    r.upsert_srs_card(user_id, card.vocab_id, &incoming)?;
                    applied += 1;
                }
            }

            if let Some(ref snapshot) = delta.balance {
                r.apply_balance_snapshot(user_id, snapshot)?;
            }
            Ok(())
        })?;

        Ok(applied)
    }

    /// Post-run ledger check: `local = synced + unsynced`. A divergence is
    /// repaired from the queue, which is the durable record.
    fn verify_ledger(&self, user_id: &str) -> Result<(), SyncError> {
        self.with_repo(|r| {
            let balance = r.get_balance(user_id)?;
            let unsynced = r.unsynced_amount_sum(user_id)?;
            let expected = balance.synced_balance + unsynced;
            if balance.local_balance != expected {
                warn!(
                    user_id = %user_id,
                    local = balance.local_balance,
                    expected,
                    "ledger divergence repaired from queue"
                );
                let snapshot = crate::db::BalanceSnapshot {
                    balance: balance.synced_balance,
                    lifetime_earned: balance.lifetime_earned,
                    lifetime_spent: balance.lifetime_spent,
                    as_of: balance.last_synced_at,
                };
                r.apply_balance_snapshot(user_id, &snapshot)?;
            }
            Ok(())
        })
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-device".to_string())
}
