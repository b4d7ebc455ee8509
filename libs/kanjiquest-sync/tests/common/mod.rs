//! Shared fixtures for sync engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kanjiquest_core::{DeviceInfo, UserSessionProvider};
use kanjiquest_sync::db::BalanceSnapshot;
use kanjiquest_sync::sync::remote::{
    DeviceRegistration, EventAck, OutboundCoinEvent, OutboundLearningEvent, PullDelta,
    RemoteStore,
};
use kanjiquest_sync::sync::SyncError;
use kanjiquest_sync::{SqliteRepository, SyncConfig, SyncEngine};
use tokio::sync::Notify;

/// Session provider with a switchable user id.
pub struct TestSession {
    user_id: Mutex<String>,
}

impl TestSession {
    pub fn new(user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: Mutex::new(user_id.to_string()),
        })
    }
}

impl UserSessionProvider for TestSession {
    fn current_user_id(&self) -> String {
        self.user_id.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct MockState {
    /// Event ids the server has already applied; resubmission is a no-op.
    seen_event_ids: Mutex<HashSet<String>>,
    reject_event_ids: Mutex<HashSet<String>>,
    server_balance: Mutex<i64>,
    server_lifetime_earned: Mutex<i64>,
    server_lifetime_spent: Mutex<i64>,
    /// Extra content served on pull, on top of the balance snapshot.
    pull_extra: Mutex<PullDelta>,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    register_calls: AtomicUsize,
    registered_platforms: Mutex<Vec<String>>,
    fail_next_pushes: AtomicUsize,
    /// Pushes that apply server-side but report a network error, as when a
    /// response times out after the server committed.
    drop_response_pushes: AtomicUsize,
    /// When set, push blocks until notified. Lets tests cancel mid-run.
    push_gate: Mutex<Option<Arc<Notify>>>,
}

/// In-memory [`RemoteStore`] with server-side idempotency, matching the
/// backend contract: duplicate event ids ack as accepted without reapplying.
#[derive(Clone, Default)]
pub struct MockRemote {
    state: Arc<MockState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_balance(&self) -> i64 {
        *self.state.server_balance.lock().unwrap()
    }

    pub fn push_calls(&self) -> usize {
        self.state.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.state.pull_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.state.register_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_pushes(&self, count: usize) {
        self.state.fail_next_pushes.store(count, Ordering::SeqCst);
    }

    /// The next `count` pushes are applied server-side but answered with a
    /// network error, simulating a timeout after the server committed.
    pub fn drop_response_for_next_pushes(&self, count: usize) {
        self.state.drop_response_pushes.store(count, Ordering::SeqCst);
    }

    pub fn registered_platforms(&self) -> Vec<String> {
        self.state.registered_platforms.lock().unwrap().clone()
    }

    pub fn reject_event(&self, event_id: &str) {
        self.state
            .reject_event_ids
            .lock()
            .unwrap()
            .insert(event_id.to_string());
    }

    pub fn set_pull_extra(&self, delta: PullDelta) {
        *self.state.pull_extra.lock().unwrap() = delta;
    }

    /// Installs a gate; push waits on it until [`Notify::notify_waiters`].
    pub fn gate_pushes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.state.push_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }
}

impl RemoteStore for MockRemote {
    async fn push_events(
        &self,
        coin_events: &[OutboundCoinEvent],
        learning_events: &[OutboundLearningEvent],
    ) -> Result<Vec<EventAck>, SyncError> {
        let gate = self.state.push_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.state.push_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .state
            .fail_next_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Network("connection reset".to_string()));
        }
        let drop_response = self
            .state
            .drop_response_pushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut acks = Vec::new();
        let rejects = self.state.reject_event_ids.lock().unwrap();
        let mut seen = self.state.seen_event_ids.lock().unwrap();

        for event in coin_events {
            if rejects.contains(&event.event_id) {
                acks.push(EventAck::Rejected {
                    event_id: event.event_id.clone(),
                    reason: "validation failed".to_string(),
                });
                continue;
            }
            if seen.insert(event.event_id.clone()) {
                *self.state.server_balance.lock().unwrap() += event.base_amount;
                if event.base_amount > 0 {
                    *self.state.server_lifetime_earned.lock().unwrap() += event.base_amount;
                } else {
                    *self.state.server_lifetime_spent.lock().unwrap() += -event.base_amount;
                }
            }
            acks.push(EventAck::Accepted {
                event_id: event.event_id.clone(),
            });
        }

        for event in learning_events {
            if rejects.contains(&event.event_id) {
                acks.push(EventAck::Rejected {
                    event_id: event.event_id.clone(),
                    reason: "validation failed".to_string(),
                });
            } else {
                seen.insert(event.event_id.clone());
                acks.push(EventAck::Accepted {
                    event_id: event.event_id.clone(),
                });
            }
        }

        if drop_response {
            return Err(SyncError::Network("response timed out".to_string()));
        }
        Ok(acks)
    }

    async fn pull_changes(&self, _since: i64) -> Result<PullDelta, SyncError> {
        self.state.pull_calls.fetch_add(1, Ordering::SeqCst);
        let extra = self.state.pull_extra.lock().unwrap();
        Ok(PullDelta {
            coin_events: extra.coin_events.clone(),
            balance: Some(BalanceSnapshot {
                balance: *self.state.server_balance.lock().unwrap(),
                lifetime_earned: *self.state.server_lifetime_earned.lock().unwrap(),
                lifetime_spent: *self.state.server_lifetime_spent.lock().unwrap(),
                as_of: 1_700_000_500,
            }),
            learning_events: extra.learning_events.clone(),
            srs_cards: extra.srs_cards.clone(),
            server_time: 1_700_000_500,
        })
    }

    async fn register_device(&self, info: &DeviceInfo) -> Result<DeviceRegistration, SyncError> {
        self.state.register_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .registered_platforms
            .lock()
            .unwrap()
            .push(info.platform.clone());
        Ok(DeviceRegistration {
            device_id: "device-0001".to_string(),
        })
    }

    async fn check_connectivity(&self) -> bool {
        true
    }
}

/// Engine over an in-memory database and a fresh mock remote.
pub fn engine_for(user_id: &str) -> (SyncEngine<MockRemote>, Arc<Mutex<SqliteRepository>>, MockRemote) {
    let repo = Arc::new(Mutex::new(
        SqliteRepository::open_in_memory().expect("in-memory db"),
    ));
    let remote = MockRemote::new();
    let engine = SyncEngine::new(
        Arc::clone(&repo),
        Some(remote.clone()),
        TestSession::new(user_id),
        SyncConfig::default(),
    );
    (engine, repo, remote)
}
