// Login, logout and session bootstrap

use reqwest::StatusCode;
use std::sync::Arc;

use super::session::SessionContext;
use super::types::{LoginRequest, SessionEvent, TokenResponse};
use crate::error::AuthError;

/// Login/logout entry points
///
/// Together with the refresh path this is the only code that installs or
/// clears tokens.
pub struct AuthService {
    context: Arc<SessionContext>,
    login_url: String,
}

impl AuthService {
    pub fn new(context: Arc<SessionContext>) -> Self {
        let login_url = format!("{}/auth/login", context.api_url());
        Self { context, login_url }
    }

    /// Sign in with email and password
    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        tracing::info!(email, "Signing in...");

        let response = self
            .context
            .client()
            .post(&self.login_url)
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| AuthError::Network(format!("Failed to send login request: {}", e)))?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            tracing::warn!(status = status.as_u16(), "Login rejected");
            return Err(AuthError::InvalidCredentials);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AuthError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let data: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Network(format!("Failed to parse login response: {}", e)))?;

        let pair = data.into_pair(None).ok_or_else(|| AuthError::Api {
            status: status.as_u16(),
            message: "Login response does not contain both tokens".to_string(),
        })?;

        self.context.install(pair);
        let _ = self.context.events().send(SessionEvent::SignedIn);

        tracing::info!("✅ Signed in");
        Ok(())
    }

    /// End the session locally; in-flight refresh waiters get `SessionEnded`
    pub fn logout(&self) {
        self.context.teardown();
        let _ = self.context.events().send(SessionEvent::SignedOut);
        tracing::info!("Signed out");
    }

    /// Restore a persisted session, returning whether one was found
    ///
    /// An unreadable persisted pair is removed and treated as no session.
    pub fn bootstrap_from_storage(&self) -> bool {
        let persisted = match self.context.tokens().load_persisted() {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable persisted session");
                self.context.teardown();
                return false;
            }
        };

        match persisted {
            Some(pair) => {
                tracing::info!(
                    token = pair.access_token_hint(),
                    "Restored session from storage"
                );
                self.context.install(pair);
                let _ = self.context.events().send(SessionEvent::SignedIn);
                true
            }
            None => {
                tracing::debug!("No persisted session");
                false
            }
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }
}
