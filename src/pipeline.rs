// Pipeline coordinator
// Runs token check, extraction, transform and load in order and reports the outcome

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::error::{Result, SyncError};
use crate::extractor::{Extraction, PaginatedExtractor, StopReason};
use crate::loader::{IncrementalLoader, LoadResult};
use crate::models::{ActivityRecord, ActivityRow};
use crate::transform::transform_activities;

/// Days looked back by the daily window
pub const DAILY_LOOKBACK_DAYS: i64 = 7;

/// Page cap for the daily window
pub const DAILY_MAX_PAGES: u32 = 10;

/// Page cap for the full window
pub const FULL_MAX_PAGES: u32 = 200;

// ==================================================================================================
// Sync windows
// ==================================================================================================

/// Date range and page budget for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncWindow {
    /// Recent activities only
    Daily,
    /// Everything the athlete has
    Full,
    /// Explicit `YYYY-MM-DD` bounds
    Custom {
        after: Option<String>,
        before: Option<String>,
        max_pages: u32,
    },
}

/// Resolved extraction parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowBounds {
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub max_pages: u32,
}

impl SyncWindow {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<WindowBounds> {
        match self {
            SyncWindow::Daily => {
                let since = (now - Duration::days(DAILY_LOOKBACK_DAYS)).date_naive();
                Ok(WindowBounds {
                    after: Some(midnight_epoch(since)),
                    before: None,
                    max_pages: DAILY_MAX_PAGES,
                })
            }
            SyncWindow::Full => Ok(WindowBounds {
                after: None,
                before: None,
                max_pages: FULL_MAX_PAGES,
            }),
            SyncWindow::Custom {
                after,
                before,
                max_pages,
            } => Ok(WindowBounds {
                after: after.as_deref().map(parse_date_to_epoch).transpose()?,
                before: before.as_deref().map(parse_date_to_epoch).transpose()?,
                max_pages: *max_pages,
            }),
        }
    }
}

/// `YYYY-MM-DD` to epoch seconds at midnight UTC
pub fn parse_date_to_epoch(date: &str) -> Result<i64> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map(midnight_epoch)
        .map_err(|e| SyncError::Config(format!("Invalid date '{}': {}", date, e)))
}

fn midnight_epoch(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

// ==================================================================================================
// Sync result
// ==================================================================================================

/// Pipeline states; the first four double as step names in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    TokenCheck,
    Extract,
    Transform,
    Load,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::TokenCheck => "token_check",
            PipelineState::Extract => "extract",
            PipelineState::Transform => "transform",
            PipelineState::Load => "load",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
}

impl From<&SyncError> for StepError {
    fn from(e: &SyncError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenMetrics {
    pub refreshed: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractMetrics {
    pub activities_count: usize,
    pub pages_fetched: u32,
    pub stop: StopReason,
    pub window: WindowBounds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformMetrics {
    pub input_rows: usize,
    pub output_rows: usize,
}

/// Outcome of one pipeline run
///
/// Always produced, whether the run succeeded or not.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub state: PipelineState,
    /// Steps that finished, in order
    pub steps_completed: Vec<PipelineState>,
    pub failed_step: Option<PipelineState>,
    pub error: Option<StepError>,
    pub token: Option<TokenMetrics>,
    pub extraction: Option<ExtractMetrics>,
    pub transformation: Option<TransformMetrics>,
    pub load: Option<LoadResult>,
    pub total_activities_processed: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SyncResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            state: PipelineState::TokenCheck,
            steps_completed: Vec::new(),
            failed_step: None,
            error: None,
            token: None,
            extraction: None,
            transformation: None,
            load: None,
            total_activities_processed: 0,
            started_at,
            duration_ms: 0,
        }
    }

    fn complete(&mut self, step: PipelineState, next: PipelineState) {
        self.steps_completed.push(step);
        self.state = next;
    }

    fn fail(mut self, error: SyncError, timer: Instant) -> Self {
        tracing::error!(step = %self.state, kind = error.kind(), "Pipeline failed: {}", error);
        self.failed_step = Some(self.state);
        self.state = PipelineState::Failed;
        self.error = Some(StepError::from(&error));
        self.duration_ms = timer.elapsed().as_millis() as u64;
        self
    }

    fn finish(mut self, timer: Instant) -> Self {
        self.success = true;
        self.state = PipelineState::Done;
        self.duration_ms = timer.elapsed().as_millis() as u64;
        self
    }
}

// ==================================================================================================
// Coordinator
// ==================================================================================================

/// Sequences the sync stages
///
/// Each stage is also callable on its own so an outer scheduler can retry
/// stages independently.
pub struct SyncPipeline {
    auth: Arc<AuthManager>,
    extractor: PaginatedExtractor,
    loader: Arc<IncrementalLoader>,
    table: String,
}

impl SyncPipeline {
    pub fn new(
        auth: Arc<AuthManager>,
        extractor: PaginatedExtractor,
        loader: IncrementalLoader,
        table: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            extractor,
            loader: Arc::new(loader),
            table: table.into(),
        }
    }

    /// Make sure a usable credential is stored, refreshing if it is close to expiry
    pub async fn token_check(&self) -> Result<TokenMetrics> {
        let before = self.auth.status()?;
        let credential = self.auth.ensure_valid(false).await?;
        let after = self.auth.status_of(&credential);

        Ok(TokenMetrics {
            refreshed: before.expiring_soon,
            expires_at: after.expires_at,
        })
    }

    /// Fetch all pages in the window
    pub async fn extract(&self, window: &SyncWindow) -> Result<(Extraction, WindowBounds)> {
        let bounds = window.resolve(Utc::now())?;
        let extraction = self
            .extractor
            .extract_all(&*self.auth, bounds.after, bounds.before, bounds.max_pages)
            .await?;
        Ok((extraction, bounds))
    }

    pub fn transform(&self, records: &[ActivityRecord]) -> Vec<ActivityRow> {
        transform_activities(records)
    }

    /// Load rows on the blocking pool
    pub async fn load(&self, rows: Vec<ActivityRow>) -> Result<LoadResult> {
        let loader = self.loader.clone();
        let table = self.table.clone();

        tokio::task::spawn_blocking(move || loader.load(rows, &table))
            .await
            .map_err(|e| SyncError::Internal(anyhow::anyhow!("Load task failed: {}", e)))?
    }

    /// Run every stage, stopping at the first failure or at cancellation
    pub async fn run(&self, window: &SyncWindow, cancel: &CancellationToken) -> SyncResult {
        let timer = Instant::now();
        let mut result = SyncResult::new(Utc::now());
        tracing::info!(?window, table = %self.table, "Starting sync pipeline");

        // Token check
        if cancel.is_cancelled() {
            return result.fail(SyncError::Cancelled, timer);
        }
        // Not raced against cancellation: a refresh must reach the store
        match self.token_check().await {
            Ok(metrics) => {
                result.token = Some(metrics);
                result.complete(PipelineState::TokenCheck, PipelineState::Extract);
                tracing::info!("Token check completed");
            }
            Err(e) => return result.fail(e, timer),
        }

        // Extract
        if cancel.is_cancelled() {
            return result.fail(SyncError::Cancelled, timer);
        }
        // Page fetches may be abandoned; a refresh triggered mid-extraction finishes in its own task
        let extracted = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            r = self.extract(window) => r,
        };
        let records = match extracted {
            Ok((extraction, bounds)) => {
                if extraction.records.is_empty() {
                    tracing::warn!("No activities extracted from API");
                }
                result.extraction = Some(ExtractMetrics {
                    activities_count: extraction.records.len(),
                    pages_fetched: extraction.pages_fetched,
                    stop: extraction.stop,
                    window: bounds,
                });
                result.complete(PipelineState::Extract, PipelineState::Transform);
                extraction.records
            }
            Err(e) => return result.fail(e, timer),
        };

        // Transform
        if cancel.is_cancelled() {
            return result.fail(SyncError::Cancelled, timer);
        }
        let rows = self.transform(&records);
        result.transformation = Some(TransformMetrics {
            input_rows: records.len(),
            output_rows: rows.len(),
        });
        result.complete(PipelineState::Transform, PipelineState::Load);

        // Load; not interruptible once started, each chunk commits on its own
        if cancel.is_cancelled() {
            return result.fail(SyncError::Cancelled, timer);
        }
        if rows.is_empty() {
            tracing::info!("Skipping load - no data to load");
        } else {
            match self.load(rows).await {
                Ok(load) => {
                    result.total_activities_processed = load.rows_processed;
                    result.load = Some(load);
                }
                Err(e) => return result.fail(e, timer),
            }
        }
        result.complete(PipelineState::Load, PipelineState::Done);

        let result = result.finish(timer);
        tracing::info!(
            duration_ms = result.duration_ms,
            processed = result.total_activities_processed,
            "Pipeline completed successfully"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, MemoryTokenStore};
    use crate::extractor::ActivityApi;
    use crate::http_client::StravaHttpClient;
    use crate::loader::{ConflictPolicy, SqliteDestination};
    use crate::models::PageRequest;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves a fixed list of activities, `per_page` at a time
    struct FixedApi {
        ids: Vec<i64>,
        fail_first_page: bool,
        calls: AtomicU32,
    }

    impl FixedApi {
        fn new(ids: Vec<i64>) -> Arc<Self> {
            Arc::new(Self {
                ids,
                fail_first_page: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                ids: Vec::new(),
                fail_first_page: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ActivityApi for FixedApi {
        async fn fetch_page(
            &self,
            _credential: &Credential,
            request: &PageRequest,
        ) -> Result<Vec<ActivityRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_page {
                return Err(SyncError::TransientNetwork("connection refused".to_string()));
            }
            let start = ((request.page - 1) * request.per_page) as usize;
            Ok(self
                .ids
                .iter()
                .skip(start)
                .take(request.per_page as usize)
                .map(|id| {
                    ActivityRecord::new(*id)
                        .with_field("name", format!("Activity {}", id))
                        .with_field("distance", 1000.0 * *id as f64)
                })
                .collect())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        destination: Arc<SqliteDestination>,
        store: Arc<MemoryTokenStore>,
    }

    impl Harness {
        fn new(credential: Option<Credential>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let destination = Arc::new(SqliteDestination::new(dir.path().join("strava.db")));
            let store = Arc::new(match credential {
                Some(c) => MemoryTokenStore::with_credential(&c),
                None => MemoryTokenStore::default(),
            });
            Self {
                _dir: dir,
                destination,
                store,
            }
        }

        fn pipeline(&self, api: Arc<FixedApi>, policy: ConflictPolicy) -> SyncPipeline {
            let http = StravaHttpClient::new(5, 5, 0, 0).unwrap();
            let auth = Arc::new(AuthManager::new(
                self.store.clone(),
                http,
                "http://127.0.0.1:9/oauth/token",
                10,
            ));
            let extractor = PaginatedExtractor::new(api).with_per_page(2);
            let loader = IncrementalLoader::new(self.destination.clone(), policy);
            SyncPipeline::new(auth, extractor, loader, "activities")
        }
    }

    fn fresh_credential() -> Credential {
        Credential {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now().timestamp() + 6 * 3600,
            client_id: Some("1".to_string()),
            client_secret: Some("s".to_string()),
        }
    }

    fn full() -> SyncWindow {
        SyncWindow::Full
    }

    #[test]
    fn test_window_presets() {
        let now = DateTime::parse_from_rfc3339("2024-05-20T15:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let daily = SyncWindow::Daily.resolve(now).unwrap();
        assert_eq!(daily.after, Some(parse_date_to_epoch("2024-05-13").unwrap()));
        assert_eq!(daily.before, None);
        assert_eq!(daily.max_pages, DAILY_MAX_PAGES);

        let full = SyncWindow::Full.resolve(now).unwrap();
        assert_eq!(full.after, None);
        assert_eq!(full.max_pages, FULL_MAX_PAGES);
    }

    #[test]
    fn test_custom_window_dates() {
        let window = SyncWindow::Custom {
            after: Some("2024-01-01".to_string()),
            before: Some("2024-02-01".to_string()),
            max_pages: 5,
        };
        let bounds = window.resolve(Utc::now()).unwrap();
        assert_eq!(bounds.after, Some(1_704_067_200));
        assert_eq!(bounds.before, Some(1_706_745_600));
        assert_eq!(bounds.max_pages, 5);
    }

    #[test]
    fn test_invalid_custom_date() {
        let window = SyncWindow::Custom {
            after: Some("01/01/2024".to_string()),
            before: None,
            max_pages: 5,
        };
        assert!(matches!(window.resolve(Utc::now()), Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_successful_run_reports_every_step() {
        let harness = Harness::new(Some(fresh_credential()));
        let pipeline = harness.pipeline(FixedApi::new(vec![1, 2, 3]), ConflictPolicy::Append);

        let result = pipeline.run(&full(), &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.state, PipelineState::Done);
        assert_eq!(
            result.steps_completed,
            vec![
                PipelineState::TokenCheck,
                PipelineState::Extract,
                PipelineState::Transform,
                PipelineState::Load
            ]
        );
        assert!(result.error.is_none());
        let extraction = result.extraction.as_ref().unwrap();
        assert_eq!(extraction.activities_count, 3);
        assert_eq!(extraction.pages_fetched, 2);
        assert_eq!(extraction.stop, StopReason::Exhausted);
        assert_eq!(result.load.as_ref().unwrap().rows_loaded, 3);
        assert_eq!(result.total_activities_processed, 3);
        assert_eq!(
            harness
                .destination
                .read_column(2, "activities", "distance_km")
                .unwrap(),
            Some(json!(2.0))
        );
    }

    #[tokio::test]
    async fn test_rerun_loads_nothing_new() {
        let harness = Harness::new(Some(fresh_credential()));
        let pipeline = harness.pipeline(FixedApi::new(vec![1, 2, 3]), ConflictPolicy::Append);
        pipeline.run(&full(), &CancellationToken::new()).await;

        let pipeline = harness.pipeline(FixedApi::new(vec![1, 2, 3, 4]), ConflictPolicy::Append);
        let result = pipeline.run(&full(), &CancellationToken::new()).await;

        let load = result.load.unwrap();
        assert_eq!(load.skipped_existing, 3);
        assert_eq!(load.rows_loaded, 1);
        assert_eq!(load.total_rows_in_table, 4);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_token_check() {
        let harness = Harness::new(None);
        let api = FixedApi::new(vec![1]);
        let pipeline = harness.pipeline(api.clone(), ConflictPolicy::Append);

        let result = pipeline.run(&full(), &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.failed_step, Some(PipelineState::TokenCheck));
        assert!(result.steps_completed.is_empty());
        assert_eq!(result.error.unwrap().kind, "missing_credential");
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_page_failure_fails_extract() {
        let harness = Harness::new(Some(fresh_credential()));
        let pipeline = harness.pipeline(FixedApi::failing(), ConflictPolicy::Append);

        let result = pipeline.run(&full(), &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(PipelineState::Extract));
        assert_eq!(result.steps_completed, vec![PipelineState::TokenCheck]);
        assert_eq!(result.error.unwrap().kind, "transient_network");
        assert!(result.load.is_none());
    }

    #[tokio::test]
    async fn test_load_failure_is_reported() {
        let harness = Harness::new(Some(fresh_credential()));
        harness
            .pipeline(FixedApi::new(vec![1]), ConflictPolicy::Append)
            .run(&full(), &CancellationToken::new())
            .await;

        let pipeline = harness.pipeline(FixedApi::new(vec![2]), ConflictPolicy::FailIfExists);
        let result = pipeline.run(&full(), &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(PipelineState::Load));
        assert_eq!(
            result.steps_completed,
            vec![
                PipelineState::TokenCheck,
                PipelineState::Extract,
                PipelineState::Transform
            ]
        );
        let error = result.error.unwrap();
        assert_eq!(error.kind, "load");
        assert!(error.message.contains("already exists"));
    }

    #[tokio::test]
    async fn test_empty_extraction_skips_load() {
        let harness = Harness::new(Some(fresh_credential()));
        let pipeline = harness.pipeline(FixedApi::new(Vec::new()), ConflictPolicy::Append);

        let result = pipeline.run(&full(), &CancellationToken::new()).await;

        assert!(result.success);
        assert_eq!(result.steps_completed.len(), 4);
        assert!(result.load.is_none());
        assert_eq!(result.total_activities_processed, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let harness = Harness::new(Some(fresh_credential()));
        let api = FixedApi::new(vec![1]);
        let pipeline = harness.pipeline(api.clone(), ConflictPolicy::Append);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pipeline.run(&full(), &cancel).await;

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(PipelineState::TokenCheck));
        assert_eq!(result.error.unwrap().kind, "cancelled");
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stages_invocable_independently() {
        let harness = Harness::new(Some(fresh_credential()));
        let pipeline = harness.pipeline(FixedApi::new(vec![5, 6]), ConflictPolicy::Append);

        let token = pipeline.token_check().await.unwrap();
        assert!(!token.refreshed);

        let (extraction, _) = pipeline.extract(&full()).await.unwrap();
        let rows = pipeline.transform(&extraction.records);
        let load = pipeline.load(rows.clone()).await.unwrap();
        assert_eq!(load.rows_loaded, 2);

        // Retrying the load stage is a no-op
        let again = pipeline.load(rows).await.unwrap();
        assert_eq!(again.rows_loaded, 0);
    }

    #[test]
    fn test_report_serializes_step_names() {
        let mut result = SyncResult::new(Utc::now());
        result.complete(PipelineState::TokenCheck, PipelineState::Extract);
        let result = result.fail(SyncError::Cancelled, Instant::now());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["steps_completed"], json!(["token_check"]));
        assert_eq!(json["failed_step"], "extract");
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"]["kind"], "cancelled");
    }
}
