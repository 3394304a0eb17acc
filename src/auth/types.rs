// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access and refresh token issued together for one session
///
/// Both tokens always travel as a unit: the store holds `Option<TokenPair>`,
/// so there is no state where one token exists without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,

    /// When absent, expiry is only detected by server rejection
    pub access_expires_at: Option<DateTime<Utc>>,
}

impl TokenPair {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        access_expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            access_expires_at,
        }
    }

    /// Check if the access token expires within `threshold` seconds
    /// A pair without expiry metadata is never judged expiring
    pub fn expires_within(&self, threshold: i64) -> bool {
        match self.access_expires_at {
            None => false,
            Some(exp) => exp <= Utc::now() + Duration::seconds(threshold),
        }
    }

    /// Short, log-safe prefix of the access token
    /// Cut on a character boundary, at most eight characters
    pub fn access_token_hint(&self) -> &str {
        self.access_token
            .char_indices()
            .nth(8)
            .map_or(&self.access_token[..], |(i, _)| &self.access_token[..i])
    }
}

/// Observable state of the refresh lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Idle,
    Refreshing,
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A pair was installed by login or restored from storage
    SignedIn,

    /// The user logged out
    SignedOut,

    /// The refresh token was rejected; the user must sign in again
    ForcedLogout { reason: String },
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token response shared by the login and refresh endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Build a pair, falling back to `previous_refresh` when the server did not rotate it
    pub fn into_pair(self, previous_refresh: Option<&str>) -> Option<TokenPair> {
        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))?;

        if self.access_token.is_empty() {
            return None;
        }

        let access_expires_at = self
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs as i64));

        Some(TokenPair {
            access_token: self.access_token,
            refresh_token,
            access_expires_at,
        })
    }
}

/// OAuth-style error body returned by the auth endpoints
#[derive(Debug, Deserialize)]
pub struct AuthErrorBody {
    pub error: Option<String>,
    pub error_description: Option<String>,
}
