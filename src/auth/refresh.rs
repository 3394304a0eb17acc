// Token refresh exchange

use reqwest::{Client, StatusCode};

use super::types::{AuthErrorBody, RefreshRequest, TokenPair, TokenResponse};
use crate::error::RefreshError;

/// Single network exchange of a refresh token for a new pair
///
/// Only `RefreshLockManager` holds one of these. It never touches the token
/// store; persisting the result is the caller's job.
pub(super) struct RefreshOperation {
    client: Client,
    url: String,
}

/// Statuses meaning the refresh token itself is no longer accepted
fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

impl RefreshOperation {
    pub(super) fn new(client: Client, api_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/auth/refresh", api_url.trim_end_matches('/')),
        }
    }

    /// Exchange `refresh_token` for a new pair
    pub(super) async fn run(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        if refresh_token.is_empty() {
            return Err(RefreshError::InvalidRefreshToken);
        }

        tracing::debug!(url = %self.url, "Sending token refresh request");

        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(format!("Failed to send refresh request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();

            if is_rejection(status) {
                // Try to parse an OAuth-style error for more details
                if let Ok(body) = serde_json::from_str::<AuthErrorBody>(&error_text) {
                    tracing::warn!(
                        status = status.as_u16(),
                        error = body.error.as_deref().unwrap_or("unknown"),
                        description = body.error_description.as_deref().unwrap_or(""),
                        "Refresh token rejected"
                    );
                }

                return Err(RefreshError::RefreshRejected {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            tracing::warn!(status = status.as_u16(), "Token refresh failed");
            return Err(RefreshError::Network(format!(
                "Refresh endpoint returned {} - {}",
                status, error_text
            )));
        }

        let data: TokenResponse = response.json().await.map_err(|e| {
            RefreshError::Network(format!("Failed to parse refresh response: {}", e))
        })?;

        let pair = data.into_pair(Some(refresh_token)).ok_or_else(|| {
            RefreshError::Network("Refresh response does not contain accessToken".to_string())
        })?;

        tracing::info!(
            expires = ?pair.access_expires_at.map(|t| t.to_rfc3339()),
            "Access token refreshed"
        );

        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_successful_refresh_rotates_tokens() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .match_body(Matcher::Json(json!({"refreshToken": "r1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accessToken":"a2","refreshToken":"r2","expiresIn":900}"#)
            .expect(1)
            .create_async()
            .await;

        let op = RefreshOperation::new(Client::new(), &server.url());
        let pair = op.run("r1").await.unwrap();

        assert_eq!(pair.access_token, "a2");
        assert_eq!(pair.refresh_token, "r2");
        assert!(pair.access_expires_at.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"a2"}"#)
            .create_async()
            .await;

        let op = RefreshOperation::new(Client::new(), &format!("{}/", server.url()));
        let pair = op.run("r1").await.unwrap();
        assert_eq!(pair.refresh_token, "r1");
        assert!(pair.access_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_empty_token_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let op = RefreshOperation::new(Client::new(), &server.url());
        assert_eq!(op.run("").await, Err(RefreshError::InvalidRefreshToken));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_statuses() {
        for status in [400, 401, 403] {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/auth/refresh")
                .with_status(status)
                .with_body(r#"{"error":"invalid_grant","error_description":"revoked"}"#)
                .create_async()
                .await;

            let op = RefreshOperation::new(Client::new(), &server.url());
            match op.run("r1").await {
                Err(RefreshError::RefreshRejected { status: s, .. }) => {
                    assert_eq!(s as usize, status)
                }
                other => panic!("expected rejection for {}, got {:?}", status, other),
            }
        }
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        for status in [429, 500, 503] {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("POST", "/auth/refresh")
                .with_status(status)
                .expect(1)
                .create_async()
                .await;

            let op = RefreshOperation::new(Client::new(), &server.url());
            let result = op.run("r1").await;
            assert!(matches!(result, Err(RefreshError::Network(_))));
            // Not retried internally
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_network_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body("<html>gateway</html>")
            .create_async()
            .await;

        let op = RefreshOperation::new(Client::new(), &server.url());
        assert!(matches!(
            op.run("r1").await,
            Err(RefreshError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let op = RefreshOperation::new(Client::new(), "http://127.0.0.1:1");
        assert!(matches!(
            op.run("r1").await,
            Err(RefreshError::Network(_))
        ));
    }
}
