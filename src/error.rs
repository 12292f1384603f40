// Error handling module
// Defines the sync error taxonomy and its classification helpers

use thiserror::Error;

/// Errors that can occur while syncing activities
#[derive(Error, Debug)]
pub enum SyncError {
    /// No credential has been stored yet (initial authorization required)
    #[error("No stored credential found. Initial authorization required.")]
    MissingCredential,

    /// Stored credential lacks required fields
    #[error("Malformed credential: missing fields {missing:?}")]
    MalformedCredential { missing: Vec<String> },

    /// Token endpoint answered with a non-200 status
    #[error("Token refresh failed: {status} - {body}")]
    TokenRefresh { status: u16, body: String },

    /// API rejected the access token (401/403)
    #[error("Authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    /// Network-level failure that survived all local retries
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Non-auth failure fetching a page of activities
    #[error("Failed to fetch page {page}: {message}")]
    PageFetch { page: u32, message: String },

    /// Destination write failure
    #[error("Load error: {0}")]
    Load(String),

    /// Destination membership query failure
    #[error("Existence check failed: {0}")]
    ExistenceCheck(String),

    /// Token store could not be read or written
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run aborted between stages
    #[error("Pipeline run cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Stable tag used in sync reports
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::MissingCredential => "missing_credential",
            SyncError::MalformedCredential { .. } => "malformed_credential",
            SyncError::TokenRefresh { .. } => "token_refresh",
            SyncError::Authentication { .. } => "authentication",
            SyncError::TransientNetwork(_) => "transient_network",
            SyncError::PageFetch { .. } => "page_fetch",
            SyncError::Load(_) => "load",
            SyncError::ExistenceCheck(_) => "existence_check",
            SyncError::CredentialStore(_) => "credential_store",
            SyncError::Config(_) => "config",
            SyncError::Cancelled => "cancelled",
            SyncError::Json(_) => "json",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Whether a local retry could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Create a malformed credential error from field names
    pub fn malformed<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SyncError::MalformedCredential {
            missing: missing.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a credential store error from a message
    pub fn store(msg: impl Into<String>) -> Self {
        SyncError::CredentialStore(msg.into())
    }

    /// Create a load error from a message
    pub fn load(msg: impl Into<String>) -> Self {
        SyncError::Load(msg.into())
    }
}

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
