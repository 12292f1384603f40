// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Complete credential set for the Strava API
///
/// `expires_at` is unix-epoch seconds exactly as returned by the last
/// successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl Credential {
    /// Expiry as a UTC datetime
    pub fn expires_at_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.expires_at, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns the Authorization header value
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Apply a successful refresh response, keeping the client credentials used
    pub fn refreshed(&self, data: TokenData, client: &ClientCredentials) -> Credential {
        Credential {
            access_token: data.access_token,
            refresh_token: data
                .refresh_token
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_at: data.expires_at,
            client_id: Some(client.client_id.clone()),
            client_secret: Some(client.client_secret.clone()),
        }
    }
}

/// Lenient on-disk shape of a credential
///
/// Every field is optional so that a partially written or hand-edited entry
/// produces a `MalformedCredential` naming the absent fields instead of a
/// generic parse failure. `expires_at` and `client_id` tolerate numbers or
/// strings.
#[derive(Debug, Default, Deserialize)]
pub struct StoredCredential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<Value>,
    pub client_id: Option<Value>,
    pub client_secret: Option<String>,
}

impl StoredCredential {
    /// True for `{}` and entries where every field is null
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.expires_at.is_none()
            && self.client_id.is_none()
            && self.client_secret.is_none()
    }
}

impl TryFrom<StoredCredential> for Credential {
    type Error = SyncError;

    fn try_from(stored: StoredCredential) -> Result<Self> {
        let expires_at = stored.expires_at.as_ref().and_then(parse_epoch);

        let mut missing = Vec::new();
        if stored.access_token.is_none() {
            missing.push("access_token");
        }
        if stored.refresh_token.is_none() {
            missing.push("refresh_token");
        }
        if expires_at.is_none() {
            missing.push("expires_at");
        }

        match (stored.access_token, stored.refresh_token, expires_at) {
            (Some(access_token), Some(refresh_token), Some(expires_at)) => Ok(Credential {
                access_token,
                refresh_token,
                expires_at,
                client_id: stored.client_id.as_ref().and_then(value_to_string),
                client_secret: stored.client_secret,
            }),
            _ => Err(SyncError::malformed(missing)),
        }
    }
}

/// Parse epoch seconds from a JSON number or a numeric string ("1700000000.0")
fn parse_epoch(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// OAuth application credentials used for the refresh grant
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Snapshot of a credential's usability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenStatus {
    /// Access token not yet past its actual expiry
    pub valid: bool,
    pub expires_at: DateTime<Utc>,
    /// Time remaining until actual expiry, clamped at zero
    pub expires_in: std::time::Duration,
    /// Inside the buffer window (or already expired)
    pub expiring_soon: bool,
    pub buffer_minutes: i64,
}

impl TokenStatus {
    /// Evaluate a credential against a buffer window at a given instant
    pub fn evaluate(credential: &Credential, buffer: Duration, now: DateTime<Utc>) -> Self {
        let now_ts = now.timestamp();
        let refresh_at = credential
            .expires_at
            .saturating_sub(buffer.num_seconds());
        let remaining = credential.expires_at.saturating_sub(now_ts).max(0);

        Self {
            valid: now_ts < credential.expires_at,
            expires_at: credential.expires_at_datetime(),
            expires_in: std::time::Duration::from_secs(remaining as u64),
            expiring_soon: now_ts >= refresh_at,
            buffer_minutes: buffer.num_minutes(),
        }
    }
}

/// Token data from a refresh response
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

/// Strava OAuth refresh response
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub expires_in: Option<i64>,
    #[allow(dead_code)]
    pub token_type: Option<String>,
}
