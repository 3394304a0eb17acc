// Refresh lock manager
// Coalesces concurrent refresh attempts into one in-flight exchange

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};

use super::refresh::RefreshOperation;
use super::store::{TokenManager, TokenWriter};
use super::types::{LockStatus, SessionEvent, TokenPair};
use crate::error::RefreshError;

type RefreshResult = Result<TokenPair, RefreshError>;

/// Refresh lock state
enum Status {
    Idle,
    Refreshing {
        /// Round id; a settling exchange with a different id was orphaned
        round: u64,

        /// Callers waiting on this round, FIFO
        waiters: Vec<oneshot::Sender<RefreshResult>>,
    },
}

struct LockState {
    status: Status,
    next_round: u64,

    /// Set by `shutdown`; no further rounds may start
    disposed: bool,
}

struct Inner {
    state: Mutex<LockState>,
    tokens: Arc<TokenManager>,

    /// Sole write capability for the token store; in-memory writes happen
    /// under `state`, mirror writes after it is released
    writer: TokenWriter,
    operation: RefreshOperation,
    events: broadcast::Sender<SessionEvent>,
}

/// Single-flight refresh coordinator
///
/// Any number of callers may call [`ensure_fresh`](Self::ensure_fresh)
/// concurrently; at most one refresh exchange runs at a time and every
/// caller of a round receives the same result. The exchange runs in its own
/// task, so callers may drop their future without affecting the round.
#[derive(Clone)]
pub struct RefreshLockManager {
    inner: Arc<Inner>,
}

impl RefreshLockManager {
    pub(super) fn new(
        tokens: Arc<TokenManager>,
        writer: TokenWriter,
        operation: RefreshOperation,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LockState {
                    status: Status::Idle,
                    next_round: 1,
                    disposed: false,
                }),
                tokens,
                writer,
                operation,
                events,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current lock status
    pub fn status(&self) -> LockStatus {
        match self.lock_state().status {
            Status::Idle => LockStatus::Idle,
            Status::Refreshing { .. } => LockStatus::Refreshing,
        }
    }

    /// Refresh the token pair, joining the in-flight round if there is one
    ///
    /// Freshness is not judged here: calling this while idle always performs
    /// a real exchange.
    pub async fn ensure_fresh(&self) -> RefreshResult {
        let (tx, rx) = oneshot::channel();

        // Check-and-set without any await in between
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.disposed {
                return Err(RefreshError::SessionEnded);
            }

            match &mut state.status {
                Status::Refreshing { round, waiters } => {
                    waiters.push(tx);
                    tracing::debug!(
                        round = *round,
                        waiters = waiters.len(),
                        "Joining in-flight token refresh"
                    );
                }
                Status::Idle => {
                    let refresh_token = match self.inner.tokens.get() {
                        Some(pair) if !pair.refresh_token.is_empty() => pair.refresh_token,
                        _ => return Err(RefreshError::InvalidRefreshToken),
                    };

                    let round = state.next_round;
                    state.next_round += 1;
                    state.status = Status::Refreshing {
                        round,
                        waiters: vec![tx],
                    };

                    tracing::debug!(round, "Starting token refresh");
                    tokio::spawn(self.clone().drive(round, refresh_token));
                }
            }
        }

        // The sender is only dropped unsent if the refresh task died
        rx.await.unwrap_or(Err(RefreshError::SessionEnded))
    }

    /// Run one round and settle it
    async fn drive(self, round: u64, refresh_token: String) {
        let result = self.inner.operation.run(&refresh_token).await;
        self.settle(round, result);
    }

    fn settle(&self, round: u64, result: RefreshResult) {
        let (waiters, update) = {
            let mut state = self.lock_state();

            let current =
                matches!(&state.status, Status::Refreshing { round: r, .. } if *r == round);
            if !current {
                tracing::info!(round, "Discarding refresh result for ended session");
                return;
            }

            let waiters = match std::mem::replace(&mut state.status, Status::Idle) {
                Status::Refreshing { waiters, .. } => waiters,
                Status::Idle => Vec::new(),
            };

            let update = match &result {
                Ok(pair) => Some(self.inner.writer.set(pair.clone())),
                Err(RefreshError::RefreshRejected { .. }) => Some(self.inner.writer.clear()),
                Err(_) => None,
            };

            (waiters, update)
        };

        if let Some(update) = update {
            self.inner.writer.persist(update);
        }

        // Queued before any waiter resumes
        if let Err(RefreshError::RefreshRejected { message, .. }) = &result {
            let _ = self.inner.events.send(SessionEvent::ForcedLogout {
                reason: message.clone(),
            });
        }

        let count = waiters.len();
        for waiter in waiters {
            // A waiter that gave up has dropped its receiver
            let _ = waiter.send(result.clone());
        }

        match &result {
            Ok(pair) => tracing::info!(
                round,
                waiters = count,
                token = pair.access_token_hint(),
                "Token refresh round completed"
            ),
            Err(e) => tracing::warn!(
                round,
                waiters = count,
                error = %e,
                "Token refresh round failed"
            ),
        }
    }

    /// Orphan the in-flight round, returning its waiters
    fn reset(state: &mut LockState) -> Vec<oneshot::Sender<RefreshResult>> {
        match std::mem::replace(&mut state.status, Status::Idle) {
            Status::Refreshing { round, waiters } => {
                tracing::debug!(
                    round,
                    waiters = waiters.len(),
                    "Abandoning in-flight token refresh"
                );
                waiters
            }
            Status::Idle => Vec::new(),
        }
    }

    fn end_waiters(waiters: Vec<oneshot::Sender<RefreshResult>>) {
        for waiter in waiters {
            let _ = waiter.send(Err(RefreshError::SessionEnded));
        }
    }

    /// Install a new session pair (login or restore)
    pub(super) fn begin_session(&self, pair: TokenPair) {
        let (waiters, update) = {
            let mut state = self.lock_state();
            let waiters = Self::reset(&mut state);
            (waiters, self.inner.writer.set(pair))
        };
        self.inner.writer.persist(update);
        Self::end_waiters(waiters);
    }

    /// Clear the session and release waiters with `SessionEnded`
    pub(super) fn end_session(&self) {
        let (waiters, update) = {
            let mut state = self.lock_state();
            let waiters = Self::reset(&mut state);
            (waiters, self.inner.writer.clear())
        };
        self.inner.writer.persist(update);
        Self::end_waiters(waiters);
    }

    /// Stop coordinating; persisted tokens are left in place
    pub(super) fn shutdown(&self) {
        let waiters = {
            let mut state = self.lock_state();
            state.disposed = true;
            Self::reset(&mut state)
        };
        Self::end_waiters(waiters);
    }
}
