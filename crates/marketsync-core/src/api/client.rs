//! API client for the investing backend's REST API.
//!
//! This module provides the `ApiClient` struct, the production implementation
//! of [`RemoteApi`]. It attaches the bearer token from the configured
//! [`AuthProvider`], applies an overall request timeout, and retries
//! rate-limited (429) and overloaded (503) responses on its own.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{debug, warn};

use super::remote::{HttpMethod, RemoteApi};
use super::ApiError;
use crate::auth::AuthProvider;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) or overloaded (503) requests.
const MAX_OVERLOAD_RETRIES: u32 = 3;

/// Backoff step for overload retries: 2s, 4s, 6s.
const OVERLOAD_BACKOFF_STEP_MS: u64 = 2000;

/// Upper bound on a reachability check, independent of the request timeout.
const REACHABILITY_TIMEOUT_SECS: u64 = 5;

/// API client for the backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth: Option<Arc<dyn AuthProvider>>,
    backoff_step: Duration,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: None,
            backoff_step: Duration::from_millis(OVERLOAD_BACKOFF_STEP_MS),
        })
    }

    /// Attach a session source; every request carries its bearer token.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Override the overload backoff step (the n-th retry waits n steps).
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the backend answers at all. Any HTTP response counts; only a
    /// failed connection or a timeout does not.
    pub async fn is_reachable(&self) -> bool {
        let result = self
            .client
            .head(&self.base_url)
            .timeout(Duration::from_secs(REACHABILITY_TIMEOUT_SECS))
            .send()
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Backend unreachable");
                false
            }
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref auth) = self.auth {
            if let Some(token) = auth.current_session().await {
                let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ApiError::InvalidResponse(format!("Invalid token: {}", e)))?;
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for overload (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(Some(response))
        } else if matches!(status.as_u16(), 429 | 503) {
            Ok(None)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn read_json(response: reqwest::Response, url: &str) -> Result<Value, ApiError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let mut retries = 0;

        loop {
            let mut request = match method {
                HttpMethod::Get => self.client.get(url),
                HttpMethod::Post => self.client.post(url),
                HttpMethod::Put => self.client.put(url),
                HttpMethod::Delete => self.client.delete(url),
            }
            .headers(self.auth_headers().await?);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(|e| {
                if e.is_connect() {
                    ApiError::Unreachable(e.to_string())
                } else {
                    ApiError::NetworkError(e)
                }
            })?;

            let status = response.status();
            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    debug!(%method, url = url, status = status.as_u16(), "Request succeeded");
                    return Self::read_json(response, url).await;
                }
                None => {
                    retries += 1;
                    if retries > MAX_OVERLOAD_RETRIES {
                        return Err(ApiError::from_status(status, ""));
                    }
                    let backoff = self.backoff_step * retries;
                    warn!(
                        url = url,
                        status = status.as_u16(),
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Backend overloaded, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn request(
        &self,
        path: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = self.url(path);
        self.send(method, &url, body.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = ApiClient::new("https://api.example.com/", Duration::from_secs(5))
            .expect("client should build");
        assert_eq!(client.base_url(), "https://api.example.com");
        assert_eq!(
            client.url("/api/user/preferences"),
            "https://api.example.com/api/user/preferences"
        );
        assert_eq!(
            client.url("api/user/chat"),
            "https://api.example.com/api/user/chat"
        );
    }
}
