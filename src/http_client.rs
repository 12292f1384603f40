use anyhow::Context;
use reqwest::{Client, Request, Response, StatusCode};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Default fixed delay between retry attempts (milliseconds)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// HTTP client for the Strava API with bounded, fixed-backoff retries
#[derive(Clone)]
pub struct StravaHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Maximum number of retries after the first attempt
    max_retries: u32,

    /// Fixed delay between attempts
    retry_delay: Duration,
}

/// Which failures a request may retry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryOn {
    /// Only network-level failures (connect, timeout, reset)
    NetworkOnly,
    /// Network failures plus 429 and 5xx responses
    NetworkAndServerErrors,
}

impl StravaHttpClient {
    /// Create a new HTTP client
    pub fn new(
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
        retry_delay_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
        })
    }

    /// Execute a request, retrying transient failures
    ///
    /// Returns the response for any status the policy does not retry; status
    /// classification is left to the caller.
    pub async fn send(&self, request: Request, retry_on: RetryOn) -> Result<Response> {
        let mut attempt: u32 = 0;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        loop {
            let req = request.try_clone().ok_or_else(|| {
                SyncError::Internal(anyhow::anyhow!("Request body is not cloneable"))
            })?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    tracing::debug!(status = %status, attempt = attempt + 1, "Received HTTP response");

                    if retry_on == RetryOn::NetworkAndServerErrors
                        && is_retryable_status(status)
                        && attempt < self.max_retries
                    {
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            self.retry_delay.as_millis(),
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Ok(response);
                }

                Err(e) => {
                    if e.is_builder() {
                        return Err(SyncError::Internal(anyhow::anyhow!(
                            "Invalid request: {}",
                            e
                        )));
                    }

                    let error_kind = classify_error(&e);
                    tracing::warn!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        "HTTP request error"
                    );

                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_delay).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );

                    return Err(SyncError::TransientNetwork(format!(
                        "{} {} failed after {} attempts: {} (kind: {})",
                        method,
                        url.path(),
                        attempt + 1,
                        e,
                        error_kind
                    )));
                }
            }
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// 429 and 5xx are worth another attempt
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Categorize a reqwest error for logs
fn classify_error(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
