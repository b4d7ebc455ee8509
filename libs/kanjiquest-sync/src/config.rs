//! Engine configuration.

use crate::sync::remote::HttpRemoteStore;

/// Tunables for the sync engine. `Default` matches production; tests
/// override fields directly.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backend_url: String,
    /// Bearer token for the backend; `None` runs the engine local-only.
    pub auth_token: Option<String>,
    /// Events are dropped from the push set once they have failed this many
    /// times; they stay in the queue for the ledger invariant.
    pub max_retries: i64,
    pub push_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: "https://api.kanjiquest.app".to_string(),
            auth_token: None,
            max_retries: 5,
            push_batch_size: 50,
        }
    }
}

impl SyncConfig {
    /// Reads overrides from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend_url: std::env::var("KANJIQUEST_BACKEND_URL")
                .unwrap_or(defaults.backend_url),
            auth_token: std::env::var("KANJIQUEST_AUTH_TOKEN").ok(),
            max_retries: std::env::var("KANJIQUEST_SYNC_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            push_batch_size: std::env::var("KANJIQUEST_SYNC_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.push_batch_size),
        }
    }

    /// Builds the HTTP remote when a token is configured.
    pub fn remote_store(&self) -> Option<HttpRemoteStore> {
        self.auth_token
            .as_deref()
            .map(|token| HttpRemoteStore::new(self.backend_url.clone(), token))
    }
}
