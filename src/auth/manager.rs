use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::credentials::TokenStore;
use super::refresh;
use super::types::{ClientCredentials, Credential, TokenStatus};
use crate::error::{Result, SyncError};
use crate::http_client::StravaHttpClient;

/// Default buffer before expiry during which a token is refreshed
pub const DEFAULT_REFRESH_BUFFER_MINUTES: i64 = 10;

/// Authentication manager
/// Owns the credential lifecycle: status checks, proactive refresh and
/// persistence. The store is the single source of truth; nothing is cached
/// in memory between calls.
pub struct AuthManager {
    /// Credential persistence
    store: Arc<dyn TokenStore>,

    /// HTTP client for refresh requests
    http: StravaHttpClient,

    /// OAuth token endpoint
    token_url: String,

    /// Used when the stored credential carries no client id/secret
    fallback_client: Option<ClientCredentials>,

    /// Refresh buffer window
    buffer: Duration,

    /// Serializes refreshes (single-flight); held by the refresh task itself
    refresh_lock: Arc<Mutex<()>>,

    /// Bumped after every successful refresh
    refresh_generation: Arc<AtomicU64>,
}

impl AuthManager {
    /// Create a new AuthManager over a token store
    pub fn new(
        store: Arc<dyn TokenStore>,
        http: StravaHttpClient,
        token_url: impl Into<String>,
        buffer_minutes: i64,
    ) -> Self {
        Self {
            store,
            http,
            token_url: token_url.into(),
            fallback_client: None,
            buffer: Duration::minutes(buffer_minutes),
            refresh_lock: Arc::new(Mutex::new(())),
            refresh_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set client credentials used when the stored credential lacks them
    pub fn with_client_credentials(mut self, client: Option<ClientCredentials>) -> Self {
        self.fallback_client = client;
        self
    }

    /// Location of the backing store
    pub fn store_description(&self) -> String {
        self.store.describe()
    }

    /// Read the stored credential
    pub fn load_credential(&self) -> Result<Credential> {
        self.store.load()?.ok_or(SyncError::MissingCredential)
    }

    /// Status of the stored credential
    pub fn status(&self) -> Result<TokenStatus> {
        let credential = self.load_credential()?;
        let status = self.status_of(&credential);

        tracing::info!(
            expires_at = %status.expires_at,
            expires_in_secs = status.expires_in.as_secs(),
            expiring_soon = status.expiring_soon,
            "Token status"
        );

        Ok(status)
    }

    /// Status of a given credential at the current time
    pub fn status_of(&self, credential: &Credential) -> TokenStatus {
        TokenStatus::evaluate(credential, self.buffer, Utc::now())
    }

    /// Return a credential that is usable beyond the buffer window
    ///
    /// Refreshes when `force` is set or the stored credential is expiring
    /// soon; otherwise the stored credential is returned unchanged.
    pub async fn ensure_valid(&self, force: bool) -> Result<Credential> {
        let credential = self.load_credential()?;

        if !force {
            let status = self.status_of(&credential);
            if !status.expiring_soon {
                tracing::debug!(
                    "Token refresh not needed, expires at {}",
                    status.expires_at
                );
                return Ok(credential);
            }
            tracing::info!(
                "Token expires at {} (within {} min buffer), refreshing",
                status.expires_at,
                status.buffer_minutes
            );
        }

        self.refresh_single_flight(force).await
    }

    /// Refresh unconditionally
    pub async fn refresh(&self) -> Result<Credential> {
        self.refresh_single_flight(true).await
    }

    /// At most one refresh in flight; callers that waited behind a refresh
    /// reuse its result
    ///
    /// The request and the save run in a spawned task that owns the lock, so
    /// dropping the caller cannot lose a rotated refresh token between the
    /// provider's answer and the store write.
    async fn refresh_single_flight(&self, force: bool) -> Result<Credential> {
        let observed = self.refresh_generation.load(Ordering::SeqCst);
        let guard = self.refresh_lock.clone().lock_owned().await;

        if self.refresh_generation.load(Ordering::SeqCst) != observed {
            tracing::debug!("Reusing credential from concurrent refresh");
            return self.load_credential();
        }

        // Re-read under the lock
        let credential = self.load_credential()?;
        if !force && !self.status_of(&credential).expiring_soon {
            return Ok(credential);
        }

        let client = self.client_credentials(&credential)?;
        let http = self.http.clone();
        let token_url = self.token_url.clone();
        let store = self.store.clone();
        let generation = self.refresh_generation.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let data = refresh::refresh_token(&http, &token_url, &credential, &client).await?;

            let updated = credential.refreshed(data, &client);
            store.save(&updated)?;
            generation.fetch_add(1, Ordering::SeqCst);

            tracing::info!("Persisted refreshed credential to {}", store.describe());
            Ok::<_, SyncError>(updated)
        });

        task.await
            .map_err(|e| SyncError::Internal(anyhow::anyhow!("Token refresh task failed: {}", e)))?
    }

    /// Client id/secret: stored values first, configured fallback second
    fn client_credentials(&self, credential: &Credential) -> Result<ClientCredentials> {
        let fallback = self.fallback_client.as_ref();

        let client_id = credential
            .client_id
            .clone()
            .or_else(|| fallback.map(|c| c.client_id.clone()))
            .filter(|s| !s.is_empty());
        let client_secret = credential
            .client_secret
            .clone()
            .or_else(|| fallback.map(|c| c.client_secret.clone()))
            .filter(|s| !s.is_empty());

        match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(ClientCredentials {
                client_id,
                client_secret,
            }),
            (id, secret) => {
                let mut missing = Vec::new();
                if id.is_none() {
                    missing.push("client_id");
                }
                if secret.is_none() {
                    missing.push("client_secret");
                }
                Err(SyncError::malformed(missing))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::MemoryTokenStore;
    use std::io::Write;

    fn credential(expires_in: i64) -> Credential {
        Credential {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at: Utc::now().timestamp() + expires_in,
            client_id: Some("4242".to_string()),
            client_secret: Some("s3cret".to_string()),
        }
    }

    fn manager(store: Arc<MemoryTokenStore>, token_url: String) -> AuthManager {
        let http = StravaHttpClient::new(5, 5, 3, 0).unwrap();
        AuthManager::new(store, http, token_url, DEFAULT_REFRESH_BUFFER_MINUTES)
    }

    fn refreshed_body() -> String {
        let expires_at = Utc::now().timestamp() + 21_600;
        format!(
            r#"{{"access_token":"new-access","refresh_token":"new-refresh","expires_at":{}}}"#,
            expires_at
        )
    }

    #[test]
    fn test_status_missing_credential() {
        let store = Arc::new(MemoryTokenStore::default());
        let manager = manager(store, "http://unused".to_string());
        assert!(matches!(manager.status(), Err(SyncError::MissingCredential)));
    }

    #[test]
    fn test_status_malformed_credential() {
        let store = Arc::new(MemoryTokenStore::with_raw(r#"{"access_token":"a"}"#));
        let manager = manager(store, "http://unused".to_string());
        assert!(matches!(
            manager.status(),
            Err(SyncError::MalformedCredential { .. })
        ));
    }

    #[test]
    fn test_status_expiring_soon_uses_buffer() {
        let store = Arc::new(MemoryTokenStore::with_credential(&credential(5 * 60)));
        let status = manager(store, "http://unused".to_string()).status().unwrap();
        assert!(status.valid);
        assert!(status.expiring_soon);

        let store = Arc::new(MemoryTokenStore::with_credential(&credential(60 * 60)));
        let status = manager(store, "http://unused".to_string()).status().unwrap();
        assert!(!status.expiring_soon);
    }

    #[tokio::test]
    async fn test_ensure_valid_returns_fresh_credential_unchanged() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .expect(0)
            .create_async()
            .await;

        let original = credential(60 * 60);
        let store = Arc::new(MemoryTokenStore::with_credential(&original));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()));

        let result = manager.ensure_valid(false).await.unwrap();
        assert_eq!(result, original);
        assert_eq!(store.save_count(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_valid_twice_refreshes_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(refreshed_body())
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryTokenStore::with_credential(&credential(60)));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()));

        let first = manager.ensure_valid(false).await.unwrap();
        let second = manager.ensure_valid(false).await.unwrap();

        assert_eq!(first.access_token, "new-access");
        assert_eq!(first, second);
        assert_eq!(store.save_count(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_forced_refresh_is_single_flight() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(refreshed_body())
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryTokenStore::with_credential(&credential(60 * 60)));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()));

        let (a, b) = tokio::join!(manager.ensure_valid(true), manager.ensure_valid(true));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert_eq!(a.access_token, "new-access");
        assert_eq!(store.save_count(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dropped_caller_still_persists_refresh() {
        let mut server = mockito::Server::new_async().await;
        let body = refreshed_body();
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_chunked_body(move |w| {
                std::thread::sleep(std::time::Duration::from_millis(400));
                w.write_all(body.as_bytes())
            })
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(MemoryTokenStore::with_credential(&credential(60)));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()));

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            manager.ensure_valid(false),
        )
        .await;
        assert!(outcome.is_err(), "refresh should still be in flight");

        for _ in 0..50 {
            if store.save_count() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap().unwrap().refresh_token, "new-refresh");

        // The next caller sees the persisted credential without another request
        let next = manager.ensure_valid(false).await.unwrap();
        assert_eq!(next.access_token, "new-access");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_persists_new_credential() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(refreshed_body())
            .create_async()
            .await;

        let store = Arc::new(MemoryTokenStore::with_credential(&credential(60 * 60)));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()));

        let refreshed = manager.refresh().await.unwrap();
        let stored = store.load().unwrap().unwrap();

        assert_eq!(stored, refreshed);
        assert_eq!(stored.refresh_token, "new-refresh");
        assert_eq!(stored.client_id.as_deref(), Some("4242"));
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_store_untouched() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"message":"Bad Request","errors":[{"code":"invalid"}]}"#)
            .create_async()
            .await;

        let original = credential(60);
        let store = Arc::new(MemoryTokenStore::with_credential(&original));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()));

        let err = manager.ensure_valid(false).await.unwrap_err();
        assert!(matches!(err, SyncError::TokenRefresh { status: 400, .. }));
        assert_eq!(store.load().unwrap(), Some(original));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_client_credentials_fallback() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "client_id".into(),
                "from-config".into(),
            ))
            .with_status(200)
            .with_body(refreshed_body())
            .expect(1)
            .create_async()
            .await;

        let mut bare = credential(60);
        bare.client_id = None;
        bare.client_secret = None;
        let store = Arc::new(MemoryTokenStore::with_credential(&bare));
        let manager = manager(store.clone(), format!("{}/oauth/token", server.url()))
            .with_client_credentials(Some(ClientCredentials {
                client_id: "from-config".to_string(),
                client_secret: "config-secret".to_string(),
            }));

        let refreshed = manager.ensure_valid(false).await.unwrap();
        assert_eq!(refreshed.client_id.as_deref(), Some("from-config"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_client_credentials() {
        let mut bare = credential(60);
        bare.client_id = None;
        let store = Arc::new(MemoryTokenStore::with_credential(&bare));
        let manager = manager(store, "http://unused".to_string());

        match manager.ensure_valid(false).await {
            Err(SyncError::MalformedCredential { missing }) => {
                assert_eq!(missing, vec!["client_id"]);
            }
            other => panic!("expected malformed credential, got {other:?}"),
        }
    }
}
