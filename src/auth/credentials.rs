// Credential persistence
// A single credential is stored as JSON under a fixed key

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::types::{Credential, StoredCredential};
use crate::error::{Result, SyncError};

/// Default key the credential is stored under
pub const DEFAULT_TOKEN_KEY: &str = "strava-auth-token";

/// Persistence for the current credential set
///
/// `load` distinguishes "nothing stored" (`Ok(None)`) from a broken store
/// (`Err`). `save` must replace the previous value atomically.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;

    fn save(&self, credential: &Credential) -> Result<()>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Parse a stored JSON entry
///
/// Blank strings and `{}` count as "nothing stored".
pub fn parse_credential(key: &str, json: &str) -> Result<Option<Credential>> {
    if json.trim().is_empty() {
        tracing::warn!("Credential entry '{}' is empty", key);
        return Ok(None);
    }

    let stored: StoredCredential = serde_json::from_str(json).map_err(|e| {
        SyncError::store(format!("Invalid JSON in credential entry '{}': {}", key, e))
    })?;

    if stored.is_empty() {
        tracing::warn!("Credential entry '{}' holds no fields", key);
        return Ok(None);
    }

    Credential::try_from(stored).map(Some)
}

/// Key-value credential store backed by a SQLite `auth_kv` table
pub struct SqliteTokenStore {
    path: PathBuf,
    key: String,
}

impl SqliteTokenStore {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    SyncError::store(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(&self.path).map_err(|e| {
            SyncError::store(format!(
                "Failed to open SQLite database {}: {}",
                self.path.display(),
                e
            ))
        })?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS auth_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| SyncError::store(format!("Failed to prepare auth_kv table: {}", e)))?;

        Ok(conn)
    }
}

impl TokenStore for SqliteTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            tracing::debug!("Token database {} does not exist", self.path.display());
            return Ok(None);
        }

        let conn = self.open()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [&self.key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::store(format!("Failed to read credential: {}", e)))?;

        match value {
            Some(json) => parse_credential(&self.key, &json),
            None => Ok(None),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string(credential)?;
        let conn = self.open()?;

        // Single upsert statement: readers see either the old or the new value
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![self.key, json],
        )
        .map_err(|e| SyncError::store(format!("Failed to write credential: {}", e)))?;

        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}#{}", self.path.display(), self.key)
    }
}

/// JSON file credential store
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path).map_err(|e| {
            SyncError::store(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        parse_credential(&self.path.display().to_string(), &json)
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SyncError::store(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(credential)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // Unique temp file in the same directory, renamed over the target
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| {
            SyncError::store(format!("Failed to create temp file in {}: {}", dir.display(), e))
        })?;
        temp.write_all(json.as_bytes()).map_err(|e| {
            SyncError::store(format!("Failed to write {}: {}", temp.path().display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600)).map_err(|e| {
                SyncError::store(format!("Failed to set permissions: {}", e))
            })?;
        }

        temp.persist(&self.path).map_err(|e| {
            SyncError::store(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;

        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// In-memory store holding the serialized form, for tests
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct MemoryTokenStore {
    value: std::sync::Mutex<Option<String>>,
    saves: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryTokenStore {
    pub fn with_credential(credential: &Credential) -> Self {
        let store = Self::default();
        *store.value.lock().unwrap() = Some(serde_json::to_string(credential).unwrap());
        store
    }

    pub fn with_raw(json: &str) -> Self {
        let store = Self::default();
        *store.value.lock().unwrap() = Some(json.to_string());
        store
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        match self.value.lock().unwrap().as_deref() {
            Some(json) => parse_credential("memory", json),
            None => Ok(None),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string(credential)?;
        *self.value.lock().unwrap() = Some(json);
        self.saves
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
