use anyhow::Context;
use reqwest::{header, Client, Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{SessionContext, TokenPair};
use crate::error::ApiError;

/// Upper bound for a single backoff delay (milliseconds)
const MAX_BACKOFF_MS: u64 = 30_000;

/// HTTP client for the Tally API with token refresh and retry logic
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session the requests are authorized with
    session: Arc<SessionContext>,

    /// Refresh ahead of time when the token expires within this many seconds
    refresh_threshold: i64,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    /// Create a new HTTP client
    pub fn new(
        session: Arc<SessionContext>,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
        refresh_threshold: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            session,
            refresh_threshold: refresh_threshold as i64,
            max_retries,
            base_delay_ms: 500,
        })
    }

    /// Build a request for `path` relative to the API base URL
    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/{}",
            self.session.api_url(),
            path.trim_start_matches('/')
        );
        self.client.request(method, url)
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, ApiError> {
        let request = self
            .request(Method::GET, path)
            .build()
            .map_err(|e| ApiError::Internal(e.into()))?;
        let response = self.execute(request).await?;

        response
            .json()
            .await
            .map_err(|e| ApiError::Network(format!("Failed to decode response: {}", e)))
    }

    /// Execute an authorized request
    /// Automatically handles:
    /// - expiring token: refreshes before sending
    /// - 401: refreshes the token and retries once
    /// - 429 / 5xx / transport errors: exponential backoff
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            "Sending HTTP request"
        );

        let mut pair = self.session.tokens().get().ok_or(ApiError::NotAuthenticated)?;
        let mut refreshed = false;

        if pair.expires_within(self.refresh_threshold) {
            tracing::debug!(request_id = %request_id, "Access token expiring, refreshing first");
            pair = self.session.refresh_lock().ensure_fresh().await?;
            refreshed = true;
        }

        let mut attempt = 0;

        loop {
            let req = self.authorize(&request, &pair, &request_id)?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(request_id = %request_id, status = %status, "Request successful");
                        return Ok(response);
                    }

                    match status {
                        StatusCode::UNAUTHORIZED if !refreshed => {
                            tracing::warn!(request_id = %request_id, "Received 401, refreshing token and retrying...");
                            pair = self.session.refresh_lock().ensure_fresh().await.map_err(|e| {
                                tracing::error!(request_id = %request_id, error = %e, "Token refresh failed");
                                ApiError::from(e)
                            })?;
                            refreshed = true;
                            continue;
                        }

                        StatusCode::TOO_MANY_REQUESTS => {}
                        s if s.is_server_error() => {}

                        _ => return Err(Self::error_response(response, &request_id).await),
                    }

                    if attempt >= self.max_retries {
                        return Err(Self::error_response(response, &request_id).await);
                    }

                    let delay = self.calculate_backoff_delay(attempt);
                    tracing::warn!(
                        request_id = %request_id,
                        "Received {}, retrying after {}ms (attempt {}/{})",
                        status,
                        delay,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_body() {
                        "body_error"
                    } else {
                        "unknown"
                    };

                    if attempt >= self.max_retries {
                        tracing::error!(
                            request_id = %request_id,
                            error_kind,
                            error = %e,
                            url = %url,
                            total_attempts = attempt + 1,
                            "HTTP request failed after all retries"
                        );
                        return Err(ApiError::Network(format!(
                            "HTTP request failed: {} (kind: {})",
                            e, error_kind
                        )));
                    }

                    let delay = self.calculate_backoff_delay(attempt);
                    tracing::warn!(
                        request_id = %request_id,
                        error_kind,
                        "Request failed: {}, retrying after {}ms (attempt {}/{})",
                        e,
                        delay,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Clone `request` with the bearer token and request id attached
    fn authorize(
        &self,
        request: &Request,
        pair: &TokenPair,
        request_id: &str,
    ) -> Result<Request, ApiError> {
        let mut req = request.try_clone().ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
        })?;

        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", pair.access_token))
            .map_err(|e| ApiError::Internal(e.into()))?;
        req.headers_mut().insert(header::AUTHORIZATION, bearer);

        if let Ok(value) = header::HeaderValue::from_str(request_id) {
            req.headers_mut().insert("X-Request-Id", value);
        }

        Ok(req)
    }

    async fn error_response(response: Response, request_id: &str) -> ApiError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();

        tracing::error!(
            request_id = %request_id,
            status = status.as_u16(),
            response_body = %error_text,
            "HTTP request failed with error response"
        );

        ApiError::Api {
            status: status.as_u16(),
            message: error_text,
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, capped, plus up to 10% jitter
        let delay = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(MAX_BACKOFF_MS);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay.saturating_add(jitter)
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn client_for(session: Arc<SessionContext>, max_retries: u32) -> ApiClient {
        let mut client = ApiClient::new(session, 4, 5, 5, max_retries, 60).unwrap();
        client.base_delay_ms = 1;
        client
    }

    #[test]
    fn test_backoff_calculation() {
        let session = SessionContext::new_for_testing("http://localhost", None);
        let client = ApiClient::new(session, 20, 30, 300, 3, 60).unwrap();

        let delay0 = client.calculate_backoff_delay(0);
        let delay1 = client.calculate_backoff_delay(1);
        let delay2 = client.calculate_backoff_delay(2);

        assert!((500..=550).contains(&delay0));
        assert!((1000..=1100).contains(&delay1));
        assert!((2000..=2200).contains(&delay2));
    }

    #[test]
    fn test_backoff_is_capped_for_large_attempts() {
        let session = SessionContext::new_for_testing("http://localhost", None);
        let client = ApiClient::new(session, 20, 30, 300, u32::MAX, 60).unwrap();

        for attempt in [6, 63, 64, 1000, u32::MAX] {
            let delay = client.calculate_backoff_delay(attempt);
            assert!(
                (MAX_BACKOFF_MS..=MAX_BACKOFF_MS + MAX_BACKOFF_MS / 10).contains(&delay),
                "attempt {} gave {}",
                attempt,
                delay
            );
        }
    }

    #[tokio::test]
    async fn test_no_session_is_not_authenticated() {
        let session = SessionContext::new_for_testing("http://127.0.0.1:1", None);
        let client = client_for(session, 0);

        assert!(matches!(
            client.get_json("/groups").await,
            Err(ApiError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_bearer_and_request_id_attached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/groups")
            .match_header("authorization", "Bearer a1")
            .match_header("x-request-id", mockito::Matcher::Regex("^[0-9a-f-]{8}$".to_string()))
            .with_status(200)
            .with_body(r#"{"groups":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let session =
            SessionContext::new_for_testing(&server.url(), Some(TokenPair::new("a1", "r1", None)));
        let body = client_for(session, 0).get_json("groups").await.unwrap();

        assert_eq!(body["groups"], serde_json::json!([]));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries_once() {
        let mut server = mockito::Server::new_async().await;
        let stale = server
            .mock("GET", "/balances")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"fresh","refreshToken":"r2"}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/balances")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body(r#"{"total":"12.50"}"#)
            .expect(1)
            .create_async()
            .await;

        let session =
            SessionContext::new_for_testing(&server.url(), Some(TokenPair::new("stale", "r1", None)));
        let body = client_for(session.clone(), 0).get_json("/balances").await.unwrap();

        assert_eq!(body["total"], "12.50");
        assert_eq!(session.tokens().get().unwrap().refresh_token, "r2");
        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_not_refreshed_again() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/balances")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"fresh"}"#)
            .expect(1)
            .create_async()
            .await;

        let session =
            SessionContext::new_for_testing(&server.url(), Some(TokenPair::new("stale", "r1", None)));
        let result = client_for(session, 3).get_json("/balances").await;

        assert!(matches!(result, Err(ApiError::Api { status: 401, .. })));
        api.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_expiring_token_refreshed_before_sending() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"fresh","expiresIn":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let api = server
            .mock("GET", "/groups")
            .match_header("authorization", "Bearer fresh")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let expiring = TokenPair::new("old", "r1", Some(Utc::now() + ChronoDuration::seconds(5)));
        let session = SessionContext::new_for_testing(&server.url(), Some(expiring));
        tokio_test::assert_ok!(client_for(session, 0).get_json("/groups").await);

        refresh.assert_async().await;
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_session_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/groups")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(401)
            .create_async()
            .await;

        let session =
            SessionContext::new_for_testing(&server.url(), Some(TokenPair::new("stale", "r1", None)));
        let result = client_for(session.clone(), 0).get_json("/groups").await;

        assert!(matches!(result, Err(ApiError::SessionExpired)));
        assert!(!session.tokens().has_session());
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/groups")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let session =
            SessionContext::new_for_testing(&server.url(), Some(TokenPair::new("a", "r", None)));
        let result = client_for(session, 2).get_json("/groups").await;

        assert!(matches!(result, Err(ApiError::Api { status: 503, .. })));
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/groups/9")
            .with_status(404)
            .with_body("not found")
            .expect(1)
            .create_async()
            .await;

        let session =
            SessionContext::new_for_testing(&server.url(), Some(TokenPair::new("a", "r", None)));
        let result = client_for(session, 3).get_json("/groups/9").await;

        assert!(matches!(result, Err(ApiError::Api { status: 404, message }) if message == "not found"));
        api.assert_async().await;
    }
}
