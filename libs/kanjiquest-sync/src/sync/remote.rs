//! Remote store abstraction and the HTTP implementation.
//!
//! The sync engine speaks to the backend only through [`RemoteStore`], so
//! tests can drive sync runs against an in-memory fake and the engine can be
//! constructed without any remote at all in offline builds.

use kanjiquest_core::{CoinEvent, DeviceInfo, LearningEvent};
use serde::{Deserialize, Serialize};

use crate::db::BalanceSnapshot;
use crate::sync::SyncError;

/// An event as sent to the remote store.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundCoinEvent {
    /// Idempotency key; resubmitting the same id is a no-op server-side.
    pub event_id: String,
    pub event_type: String,
    pub source_business: String,
    pub source_type: String,
    pub base_amount: i64,
    pub description: String,
    pub metadata: String,
    pub created_at: i64,
}

impl From<&CoinEvent> for OutboundCoinEvent {
    fn from(event: &CoinEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            source_business: event.source_business.clone(),
            source_type: event.source_type.clone(),
            base_amount: event.base_amount,
            description: event.description.clone(),
            metadata: event.metadata.clone(),
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundLearningEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub created_at: i64,
}

impl From<&LearningEvent> for OutboundLearningEvent {
    fn from(event: &LearningEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
        }
    }
}

/// Per-event outcome of a push. A rejected event is a permanent refusal
/// (validation, not transport) and consumes a retry.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventAck {
    Accepted { event_id: String },
    Rejected { event_id: String, reason: String },
}

impl EventAck {
    pub fn event_id(&self) -> &str {
        match self {
            Self::Accepted { event_id } | Self::Rejected { event_id, .. } => event_id,
        }
    }
}

/// A coin event from another device, delivered during pull.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCoinEvent {
    pub event_id: String,
    pub event_type: String,
    pub source_business: String,
    pub source_type: String,
    pub base_amount: i64,
    pub description: String,
    #[serde(default)]
    pub metadata: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLearningEvent {
    pub remote_id: String,
    pub event_type: String,
    pub payload: String,
    pub created_at: i64,
}

/// SRS card state merged from the server during pull.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSrsCard {
    pub vocab_id: i64,
    pub ease_factor: f64,
    pub interval: i64,
    pub repetitions: i64,
    pub next_review: i64,
    pub state: String,
    pub total_reviews: i64,
    pub correct_count: i64,
}

/// Everything that changed server-side since the pull watermark.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullDelta {
    #[serde(default)]
    pub coin_events: Vec<RemoteCoinEvent>,
    #[serde(default)]
    pub balance: Option<BalanceSnapshot>,
    #[serde(default)]
    pub learning_events: Vec<RemoteLearningEvent>,
    #[serde(default)]
    pub srs_cards: Vec<RemoteSrsCard>,
    /// Server clock at response time, used as the next pull watermark.
    pub server_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
}

/// Backend contract for the reconciler. All calls carry the user's auth
/// token; the backend resolves the user from it.
pub trait RemoteStore: Send + Sync {
    /// Submits queued events. The response carries one ack per submitted
    /// event; events already seen (same `event_id`) come back `Accepted`.
    fn push_events(
        &self,
        coin_events: &[OutboundCoinEvent],
        learning_events: &[OutboundLearningEvent],
    ) -> impl std::future::Future<Output = Result<Vec<EventAck>, SyncError>> + Send;

    /// Fetches everything newer than `since` (epoch seconds).
    fn pull_changes(
        &self,
        since: i64,
    ) -> impl std::future::Future<Output = Result<PullDelta, SyncError>> + Send;

    /// Registers this device; idempotent for a given device identity.
    fn register_device(
        &self,
        info: &DeviceInfo,
    ) -> impl std::future::Future<Output = Result<DeviceRegistration, SyncError>> + Send;

    /// Cheap reachability probe before a run.
    fn check_connectivity(&self) -> impl std::future::Future<Output = bool> + Send;
}

#[derive(Serialize)]
struct PushRequest<'a> {
    coin_events: &'a [OutboundCoinEvent],
    learning_events: &'a [OutboundLearningEvent],
}

#[derive(Deserialize)]
struct PushResponse {
    acks: Vec<EventAck>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// [`RemoteStore`] over the KanjiQuest backend HTTP API.
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token: auth_token.into(),
        }
    }

    async fn error_from(response: reqwest::Response) -> SyncError {
        let status = response.status().as_u16();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.message.unwrap_or_else(|| "unknown error".to_string()),
            Err(_) => "unknown error".to_string(),
        };
        SyncError::Backend { status, message }
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn push_events(
        &self,
        coin_events: &[OutboundCoinEvent],
        learning_events: &[OutboundLearningEvent],
    ) -> Result<Vec<EventAck>, SyncError> {
        let response = self
            .client
            .post(format!("{}/sync/push", self.base_url))
            .bearer_auth(&self.auth_token)
            .json(&PushRequest {
                coin_events,
                learning_events,
            })
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Parse(e.to_string()))?;
        Ok(body.acks)
    }

    async fn pull_changes(&self, since: i64) -> Result<PullDelta, SyncError> {
        let response = self
            .client
            .get(format!("{}/sync/pull", self.base_url))
            .query(&[("since", since)])
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Parse(e.to_string()))
    }

    async fn register_device(&self, info: &DeviceInfo) -> Result<DeviceRegistration, SyncError> {
        let response = self
            .client
            .post(format!("{}/devices/register", self.base_url))
            .bearer_auth(&self.auth_token)
            .json(info)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Parse(e.to_string()))
    }

    async fn check_connectivity(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
