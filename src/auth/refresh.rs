// Token refresh logic

use anyhow::Context;
use chrono::Utc;
use reqwest::StatusCode;

use super::types::{ClientCredentials, Credential, RefreshResponse, TokenData};
use crate::error::{Result, SyncError};
use crate::http_client::{RetryOn, StravaHttpClient};

/// Default Strava token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://www.strava.com/oauth/token";

/// Lifetime assumed when the response carries neither expires_at nor expires_in
const FALLBACK_EXPIRES_IN: i64 = 3600;

/// Exchange the refresh token for a new access token
///
/// Network failures are retried by the HTTP client; any non-200 answer is a
/// logical auth failure and is returned immediately as `TokenRefresh`.
pub async fn refresh_token(
    http: &StravaHttpClient,
    token_url: &str,
    credential: &Credential,
    client: &ClientCredentials,
) -> Result<TokenData> {
    tracing::info!("Refreshing Strava access token...");
    tracing::debug!(
        "Token refresh request: url={}, client_id={}",
        token_url,
        client.client_id
    );

    let form = [
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
        ("grant_type", "refresh_token"),
        ("refresh_token", credential.refresh_token.as_str()),
    ];

    let request = http
        .client()
        .post(token_url)
        .form(&form)
        .build()
        .context("Failed to build token refresh request")?;

    let response = http.send(request, RetryOn::NetworkOnly).await?;

    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            "Token refresh failed: status={}, body={}",
            status,
            body
        );

        // Try to surface OAuth error details
        if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&body) {
            if let Some(message) = error_json.get("message").and_then(|v| v.as_str()) {
                tracing::error!("Token endpoint message: {}", message);
            }
        }

        return Err(SyncError::TokenRefresh {
            status: status.as_u16(),
            body,
        });
    }

    let data: RefreshResponse = response
        .json()
        .await
        .context("Failed to parse token refresh response")?;

    if data.access_token.is_empty() {
        return Err(SyncError::Internal(anyhow::anyhow!(
            "Token refresh response does not contain access_token"
        )));
    }

    let expires_at = data.expires_at.unwrap_or_else(|| {
        Utc::now().timestamp() + data.expires_in.unwrap_or(FALLBACK_EXPIRES_IN)
    });

    tracing::info!(
        "Token refreshed, expires: {}",
        chrono::DateTime::from_timestamp(expires_at, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| expires_at.to_string())
    );

    Ok(TokenData {
        access_token: data.access_token,
        refresh_token: data.refresh_token,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn credential() -> Credential {
        Credential {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at: 0,
            client_id: None,
            client_secret: None,
        }
    }

    fn client_credentials() -> ClientCredentials {
        ClientCredentials {
            client_id: "4242".to_string(),
            client_secret: "s3cret".to_string(),
        }
    }

    fn http() -> StravaHttpClient {
        StravaHttpClient::new(5, 5, 3, 0).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_posts_grant_and_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("client_id".into(), "4242".into()),
                Matcher::UrlEncoded("client_secret".into(), "s3cret".into()),
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "old-refresh".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"token_type":"Bearer","access_token":"new-access","refresh_token":"new-refresh","expires_at":1900000000,"expires_in":21600}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/oauth/token", server.url());
        let data = refresh_token(&http(), &url, &credential(), &client_credentials())
            .await
            .unwrap();

        assert_eq!(data.access_token, "new-access");
        assert_eq!(data.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(data.expires_at, 1_900_000_000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_falls_back_to_expires_in() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a","expires_in":600}"#)
            .create_async()
            .await;

        let url = format!("{}/oauth/token", server.url());
        let before = Utc::now().timestamp();
        let data = refresh_token(&http(), &url, &credential(), &client_credentials())
            .await
            .unwrap();

        assert!(data.expires_at >= before + 600);
        assert!(data.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_non_200_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .with_body(r#"{"message":"Authorization Error"}"#)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/oauth/token", server.url());
        let err = refresh_token(&http(), &url, &credential(), &client_credentials())
            .await
            .unwrap_err();

        match err {
            SyncError::TokenRefresh { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("Authorization Error"));
            }
            other => panic!("expected TokenRefresh, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/oauth/token", server.url());
        let err = refresh_token(&http(), &url, &credential(), &client_credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::TokenRefresh { status: 503, .. }));
        mock.assert_async().await;
    }
}
