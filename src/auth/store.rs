// Token store
// Holds the current token pair; mutation is only possible through `TokenWriter`

use anyhow::Result;
use std::sync::{Arc, Mutex, RwLock};

use super::storage::SqliteMirror;
use super::types::TokenPair;

/// Owner of the current token pair
///
/// Readers call [`TokenManager::get`] on demand; nobody is notified of changes.
/// There is no public way to change the pair:
///
/// ```compile_fail
/// use tally_session::auth::{SessionContext, TokenPair};
///
/// let session = SessionContext::create("http://localhost", None, 5).unwrap();
/// session.tokens().set(TokenPair::new("a", "r", None));
/// ```
///
/// ```compile_fail
/// use tally_session::auth::store::TokenWriter;
/// ```
pub struct TokenManager {
    /// Current pair, `None` when there is no session, with its write version
    pair: RwLock<(u64, Option<TokenPair>)>,

    /// Best-effort persisted copy
    mirror: Option<SqliteMirror>,

    /// Serializes version check and mirror write
    persist_lock: Mutex<()>,
}

/// Write capability for a `TokenManager`
///
/// Created once alongside the manager and not `Clone`, so exactly one owner
/// can mutate the pair.
pub struct TokenWriter {
    tokens: Arc<TokenManager>,
}

/// Mirror write owed by an in-memory write
#[must_use]
pub(super) struct MirrorUpdate {
    version: u64,
    pair: Option<TokenPair>,
}

impl TokenManager {
    /// Create a manager and its single writer
    pub(super) fn new(mirror: Option<SqliteMirror>) -> (Arc<Self>, TokenWriter) {
        let tokens = Arc::new(Self {
            pair: RwLock::new((0, None)),
            mirror,
            persist_lock: Mutex::new(()),
        });
        let writer = TokenWriter {
            tokens: tokens.clone(),
        };
        (tokens, writer)
    }

    /// Current pair, or `None` if there is no session
    pub fn get(&self) -> Option<TokenPair> {
        self.pair
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .1
            .clone()
    }

    /// Whether a session is present
    pub fn has_session(&self) -> bool {
        self.pair
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .1
            .is_some()
    }

    fn version(&self) -> u64 {
        self.pair.read().unwrap_or_else(|e| e.into_inner()).0
    }

    /// Read the persisted pair without installing it
    pub(super) fn load_persisted(&self) -> Result<Option<TokenPair>> {
        match &self.mirror {
            Some(mirror) => mirror.load(),
            None => Ok(None),
        }
    }
}

impl TokenWriter {
    fn replace(&self, pair: Option<TokenPair>) -> MirrorUpdate {
        let mut current = self
            .tokens
            .pair
            .write()
            .unwrap_or_else(|e| e.into_inner());
        current.0 += 1;
        current.1 = pair.clone();

        MirrorUpdate {
            version: current.0,
            pair,
        }
    }

    /// Replace both tokens in memory; the mirror is written by `persist`
    pub(super) fn set(&self, pair: TokenPair) -> MirrorUpdate {
        self.replace(Some(pair))
    }

    /// Remove both tokens from memory; the mirror is cleared by `persist`
    pub(super) fn clear(&self) -> MirrorUpdate {
        self.replace(None)
    }

    /// Write `update` to the mirror unless a later write superseded it
    pub(super) fn persist(&self, update: MirrorUpdate) {
        let Some(mirror) = &self.tokens.mirror else {
            return;
        };

        let _guard = self
            .tokens
            .persist_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if self.tokens.version() != update.version {
            tracing::debug!(version = update.version, "Skipping superseded mirror write");
            return;
        }

        let result = match &update.pair {
            Some(pair) => mirror.save(pair),
            None => mirror.remove(),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to update persisted token pair");
        }
    }
}
