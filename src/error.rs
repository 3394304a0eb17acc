// Error handling module
// Defines refresh, authentication and API error types

use thiserror::Error;

/// Outcome of a failed refresh round
///
/// Cloned to every waiter of the round, so it carries only owned strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// No refresh token is held; nothing was sent
    #[error("No refresh token available")]
    InvalidRefreshToken,

    /// Transport failure or transient server error
    #[error("Network error during token refresh: {0}")]
    Network(String),

    /// The server refused the refresh token; the session is over
    #[error("Refresh token rejected: {status} - {message}")]
    RefreshRejected { status: u16, message: String },

    /// The session was ended while the caller was waiting
    #[error("Session ended")]
    SessionEnded,
}

/// Login errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Wrong email or password
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Transport failure talking to the auth endpoint
    #[error("Network error: {0}")]
    Network(String),

    /// Unexpected response from the auth endpoint
    #[error("Auth API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// No session is present
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The refresh token was rejected; the user has to sign in again
    #[error("Session expired, please sign in again")]
    SessionExpired,

    /// The session ended while the request was in flight
    #[error("Session ended")]
    SessionEnded,

    /// Generic connectivity failure
    #[error("Network error: {0}")]
    Network(String),

    /// Error response from the Tally API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::InvalidRefreshToken => ApiError::NotAuthenticated,
            RefreshError::Network(msg) => ApiError::Network(msg),
            RefreshError::RefreshRejected { .. } => ApiError::SessionExpired,
            RefreshError::SessionEnded => ApiError::SessionEnded,
        }
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
