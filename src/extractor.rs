// Paginated activity extraction

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{AuthManager, Credential};
use crate::error::{Result, SyncError};
use crate::http_client::{RetryOn, StravaHttpClient};
use crate::models::{ActivityRecord, PageRequest, DEFAULT_PER_PAGE};

/// Default Strava API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://www.strava.com/api/v3";

/// Default upper bound on pages per extraction
pub const DEFAULT_MAX_PAGES: u32 = 100;

/// Source of one page of activities
#[async_trait]
pub trait ActivityApi: Send + Sync {
    async fn fetch_page(
        &self,
        credential: &Credential,
        request: &PageRequest,
    ) -> Result<Vec<ActivityRecord>>;
}

/// Supplies the credential used for each page
///
/// Read before every page so a long extraction never runs on a token past
/// its buffered expiry.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn current(&self) -> Result<Credential>;
}

#[async_trait]
impl CredentialSource for Credential {
    async fn current(&self) -> Result<Credential> {
        Ok(self.clone())
    }
}

#[async_trait]
impl CredentialSource for AuthManager {
    async fn current(&self) -> Result<Credential> {
        self.ensure_valid(false).await
    }
}

/// Strava REST client for `GET /athlete/activities`
pub struct StravaApiClient {
    http: StravaHttpClient,
    base_url: String,
}

impl StravaApiClient {
    pub fn new(http: StravaHttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn activities_url(&self) -> String {
        format!("{}/athlete/activities", self.base_url)
    }
}

#[async_trait]
impl ActivityApi for StravaApiClient {
    async fn fetch_page(
        &self,
        credential: &Credential,
        request: &PageRequest,
    ) -> Result<Vec<ActivityRecord>> {
        tracing::info!(
            page = request.page,
            per_page = request.per_page,
            "Fetching activities page"
        );

        let req = self
            .http
            .client()
            .get(self.activities_url())
            .query(&request.query_pairs())
            .header("Authorization", credential.authorization_header())
            .build()
            .context("Failed to build activities request")?;

        let response = self
            .http
            .send(req, RetryOn::NetworkAndServerErrors)
            .await?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let message = response.text().await.unwrap_or_default();
                tracing::error!("Authentication failed - token may be invalid");
                Err(SyncError::Authentication {
                    status: status.as_u16(),
                    message,
                })
            }
            s if s.is_success() => response.json().await.map_err(|e| SyncError::PageFetch {
                page: request.page,
                message: format!("Failed to parse activities: {}", e),
            }),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::PageFetch {
                    page: request.page,
                    message: format!("HTTP {}: {}", status.as_u16(), body),
                })
            }
        }
    }
}

/// Why an extraction stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// An empty page was returned
    Exhausted,
    /// `max_pages` pages were fetched
    PageCap,
    /// A page after the first failed; earlier pages were kept
    PartialFailure {
        page: u32,
        error: String,
        /// Whether rerunning the extraction could recover the missing pages
        retryable: bool,
    },
}

/// Records accumulated by one extraction
#[derive(Debug, Clone)]
pub struct Extraction {
    pub records: Vec<ActivityRecord>,
    /// Non-empty pages fetched
    pub pages_fetched: u32,
    pub stop: StopReason,
}

/// Walks the activities listing page by page
pub struct PaginatedExtractor {
    api: Arc<dyn ActivityApi>,
    per_page: u32,
}

impl PaginatedExtractor {
    pub fn new(api: Arc<dyn ActivityApi>) -> Self {
        Self {
            api,
            per_page: DEFAULT_PER_PAGE,
        }
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page;
        self
    }

    /// Fetch pages sequentially until an empty page, a failure, or `max_pages`
    ///
    /// A failure on page 1 and any authentication failure propagate. A
    /// failure on a later page ends the walk and keeps what was fetched.
    pub async fn extract_all(
        &self,
        credentials: &dyn CredentialSource,
        after: Option<i64>,
        before: Option<i64>,
        max_pages: u32,
    ) -> Result<Extraction> {
        tracing::info!("Starting to fetch all activities (max_pages={})", max_pages);

        let mut records = Vec::new();
        let mut page: u32 = 1;
        let mut stop = StopReason::PageCap;

        while page <= max_pages {
            let credential = credentials.current().await?;
            let request = PageRequest::new(page, self.per_page, after, before);

            match self.api.fetch_page(&credential, &request).await {
                Ok(batch) if batch.is_empty() => {
                    tracing::info!("No more activities found at page {}. Stopping pagination.", page);
                    stop = StopReason::Exhausted;
                    break;
                }
                Ok(batch) => {
                    records.extend(batch);
                    tracing::info!(
                        page,
                        total = records.len(),
                        "Page fetched"
                    );
                    page += 1;
                }
                Err(e @ SyncError::Authentication { .. }) => {
                    tracing::error!("Authentication failed at page {}: {}", page, e);
                    return Err(e);
                }
                Err(e) if page == 1 => {
                    tracing::error!("Failed to fetch first page: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to fetch page {}: {}. Continuing with {} activities from {} pages",
                        page,
                        e,
                        records.len(),
                        page - 1
                    );
                    stop = StopReason::PartialFailure {
                        page,
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    };
                    break;
                }
            }
        }

        let pages_fetched = page - 1;
        tracing::info!(
            "Completed fetching activities. Total: {} activities from {} pages",
            records.len(),
            pages_fetched
        );

        Ok(Extraction {
            records,
            pages_fetched,
            stop,
        })
    }
}
