// Session context
// Owns the token store and refresh lock for one client instance

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::manager::RefreshLockManager;
use super::refresh::RefreshOperation;
use super::storage::SqliteMirror;
use super::store::TokenManager;
use super::types::{SessionEvent, TokenPair};

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 32;

/// Per-client authentication state
///
/// Constructed once per client and shared by reference with the HTTP layer.
/// Tests build as many independent contexts as they need.
pub struct SessionContext {
    api_url: String,
    client: Client,
    tokens: Arc<TokenManager>,
    refresh_lock: RefreshLockManager,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionContext {
    /// Create a context persisting tokens to `db_file`, or memory only when `None`
    pub fn create(api_url: &str, db_file: Option<&Path>, request_timeout: u64) -> Result<Arc<Self>> {
        let mirror = match db_file {
            Some(path) => {
                tracing::info!("Opening session store: {}", path.display());
                Some(SqliteMirror::open(path)?)
            }
            None => None,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_parts(api_url, client, mirror))
    }

    fn with_parts(api_url: &str, client: Client, mirror: Option<SqliteMirror>) -> Arc<Self> {
        let api_url = api_url.trim_end_matches('/').to_string();
        let (tokens, writer) = TokenManager::new(mirror);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let refresh_lock = RefreshLockManager::new(
            tokens.clone(),
            writer,
            RefreshOperation::new(client.clone(), &api_url),
            events.clone(),
        );

        Arc::new(Self {
            api_url,
            client,
            tokens,
            refresh_lock,
            events,
        })
    }

    /// Create a context with a pre-installed pair and no persistence
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(api_url: &str, pair: Option<TokenPair>) -> Arc<Self> {
        let context = Self::with_parts(api_url, Client::new(), None);
        if let Some(pair) = pair {
            context.refresh_lock.begin_session(pair);
        }
        context
    }

    /// Release waiters and stop refreshing; persisted tokens are kept
    pub fn dispose(&self) {
        tracing::debug!("Disposing session context");
        self.refresh_lock.shutdown();
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn refresh_lock(&self) -> &RefreshLockManager {
        &self.refresh_lock
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub(super) fn client(&self) -> &Client {
        &self.client
    }

    pub(super) fn events(&self) -> &broadcast::Sender<SessionEvent> {
        &self.events
    }

    /// Receive session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(super) fn install(&self, pair: TokenPair) {
        self.refresh_lock.begin_session(pair);
    }

    pub(super) fn teardown(&self) {
        self.refresh_lock.end_session();
    }
}
