use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Password};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::{
    ClientCredentials, Credential, FileTokenStore, SqliteTokenStore, TokenStore,
    DEFAULT_REFRESH_BUFFER_MINUTES, DEFAULT_TOKEN_KEY, DEFAULT_TOKEN_URL,
};
use crate::extractor::{DEFAULT_API_BASE_URL, DEFAULT_MAX_PAGES};
use crate::loader::{validate_table_name, ConflictPolicy};
use crate::models::MAX_PER_PAGE;
use crate::pipeline::SyncWindow;

/// Strava activity sync - incremental ETL into SQLite
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Strava API client id (used when the stored credential has none)
    #[arg(long, env = "STRAVA_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Strava API client secret (used when the stored credential has none)
    #[arg(long, env = "STRAVA_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Strava API base URL
    #[arg(long, env = "STRAVA_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    /// OAuth token endpoint
    #[arg(long, env = "STRAVA_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    /// Credential store backend (sqlite, file)
    #[arg(long, env = "TOKEN_STORE", default_value = "sqlite")]
    pub token_store: String,

    /// Credential store location (defaults to the database for sqlite)
    #[arg(long, env = "TOKEN_STORE_PATH")]
    pub token_store_path: Option<String>,

    /// Key of the credential in the sqlite store
    #[arg(long, env = "TOKEN_KEY", default_value = DEFAULT_TOKEN_KEY)]
    pub token_key: String,

    /// Refresh the token this many minutes before it expires
    #[arg(long, env = "TOKEN_REFRESH_BUFFER_MINUTES", default_value_t = DEFAULT_REFRESH_BUFFER_MINUTES)]
    pub refresh_buffer_minutes: i64,

    /// Activities per page (1-200)
    #[arg(long, env = "ACTIVITIES_PER_PAGE", default_value = "100")]
    pub per_page: u32,

    /// SQLite database holding the activity table
    #[arg(short = 'd', long, env = "DATABASE_PATH", default_value = "strava.db")]
    pub database_path: String,

    /// Destination table
    #[arg(short = 't', long, env = "TABLE_NAME", default_value = "activities")]
    pub table_name: String,

    /// Behaviour when the table exists (append, replace, fail)
    #[arg(long, env = "IF_EXISTS", default_value = "append")]
    pub if_exists: String,

    /// Rows per insert transaction
    #[arg(long, env = "LOAD_CHUNK_SIZE", default_value = "1000")]
    pub chunk_size: usize,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub http_connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    /// Fixed delay between HTTP retries in milliseconds
    #[arg(long, env = "HTTP_RETRY_DELAY_MS", default_value = "2000")]
    pub http_retry_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sync the last 7 days (default)
    Daily,
    /// Sync every activity
    Full,
    /// Sync an explicit date range
    Sync {
        /// Only activities after this date (YYYY-MM-DD)
        #[arg(long)]
        after: Option<String>,

        /// Only activities before this date (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,

        /// Maximum pages to fetch
        #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
        max_pages: u32,
    },
    /// Show the stored token's expiry
    TokenStatus,
    /// Refresh the stored token if it is close to expiry
    RefreshToken {
        /// Refresh even if the token is still fresh
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenStoreKind {
    Sqlite,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub command: Command,

    // Strava API
    pub client: Option<ClientCredentials>,
    pub api_base_url: String,
    pub token_url: String,
    pub per_page: u32,

    // Credential store
    pub token_store: TokenStoreKind,
    pub token_store_path: PathBuf,
    pub token_key: String,
    pub refresh_buffer_minutes: i64,

    // Destination
    pub database_path: PathBuf,
    pub table_name: String,
    pub if_exists: ConflictPolicy,
    pub chunk_size: usize,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,
    pub http_retry_delay_ms: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed arguments into a configuration
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let database_path = expand_tilde(&args.database_path);
        let token_store = parse_token_store_kind(&args.token_store)?;

        let token_store_path = match (&args.token_store_path, &token_store) {
            (Some(path), _) => expand_tilde(path),
            (None, TokenStoreKind::Sqlite) => database_path.clone(),
            (None, TokenStoreKind::File) => default_token_file(),
        };

        let client = match (args.client_id, args.client_secret) {
            (Some(client_id), Some(client_secret))
                if !client_id.is_empty() && !client_secret.is_empty() =>
            {
                Some(ClientCredentials {
                    client_id,
                    client_secret,
                })
            }
            _ => None,
        };

        let if_exists = args
            .if_exists
            .parse::<ConflictPolicy>()
            .context("Invalid IF_EXISTS")?;

        Ok(Config {
            command: args.command.unwrap_or(Command::Daily),

            client,
            api_base_url: args.api_base_url,
            token_url: args.token_url,
            per_page: args.per_page,

            token_store,
            token_store_path,
            token_key: args.token_key,
            refresh_buffer_minutes: args.refresh_buffer_minutes,

            database_path,
            table_name: args.table_name,
            if_exists,
            chunk_size: args.chunk_size,

            http_connect_timeout: args.http_connect_timeout,
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,
            http_retry_delay_ms: args.http_retry_delay_ms,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.per_page == 0 || self.per_page > MAX_PER_PAGE {
            anyhow::bail!(
                "ACTIVITIES_PER_PAGE must be between 1 and {}, got {}",
                MAX_PER_PAGE,
                self.per_page
            );
        }

        if self.chunk_size == 0 {
            anyhow::bail!("LOAD_CHUNK_SIZE must be greater than zero");
        }

        if self.refresh_buffer_minutes < 0 {
            anyhow::bail!("TOKEN_REFRESH_BUFFER_MINUTES cannot be negative");
        }

        validate_table_name(&self.table_name)?;

        if let Command::Sync { max_pages: 0, .. } = self.command {
            anyhow::bail!("--max-pages must be greater than zero");
        }

        Ok(())
    }

    /// Window for sync commands; `None` for token-only commands
    pub fn window(&self) -> Option<SyncWindow> {
        match &self.command {
            Command::Daily => Some(SyncWindow::Daily),
            Command::Full => Some(SyncWindow::Full),
            Command::Sync {
                after,
                before,
                max_pages,
            } => Some(SyncWindow::Custom {
                after: after.clone(),
                before: before.clone(),
                max_pages: *max_pages,
            }),
            Command::TokenStatus | Command::RefreshToken { .. } => None,
        }
    }

    /// Build the configured credential store
    pub fn build_token_store(&self) -> Arc<dyn TokenStore> {
        match self.token_store {
            TokenStoreKind::Sqlite => Arc::new(SqliteTokenStore::new(
                self.token_store_path.clone(),
                self.token_key.clone(),
            )),
            TokenStoreKind::File => Arc::new(FileTokenStore::new(self.token_store_path.clone())),
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_token_file() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("strava-sync").join("token.json"))
        .unwrap_or_else(|| PathBuf::from("strava_token.json"))
}

/// Parse credential store backend from string
fn parse_token_store_kind(s: &str) -> Result<TokenStoreKind> {
    match s.to_lowercase().as_str() {
        "sqlite" | "db" => Ok(TokenStoreKind::Sqlite),
        "file" | "json" => Ok(TokenStoreKind::File),
        other => anyhow::bail!("Unknown TOKEN_STORE '{}' (expected sqlite or file)", other),
    }
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}


// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and missing required values)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();

    let has_client_id = std::env::var("STRAVA_CLIENT_ID").is_ok();
    let has_client_secret = std::env::var("STRAVA_CLIENT_SECRET").is_ok();

    !env_file_exists && (!has_client_id || !has_client_secret) && std::io::stdin().is_terminal()
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("Strava Sync - First Time Setup");
    println!();
    println!("No configuration found. Create an API application at");
    println!("https://www.strava.com/settings/api to get a client id and secret.");
    println!();

    let client_id: String = Input::new()
        .with_prompt("Strava client id (STRAVA_CLIENT_ID)")
        .interact_text()
        .context("Failed to read STRAVA_CLIENT_ID")?;

    let client_secret: String = Password::new()
        .with_prompt("Strava client secret (STRAVA_CLIENT_SECRET)")
        .interact()
        .context("Failed to read STRAVA_CLIENT_SECRET")?;

    if client_id.trim().is_empty() || client_secret.is_empty() {
        anyhow::bail!("Client id and secret cannot be empty");
    }

    println!();
    let database_path: String = Input::new()
        .with_prompt("SQLite database path (DATABASE_PATH)")
        .default("strava.db".to_string())
        .interact_text()
        .context("Failed to read DATABASE_PATH")?;

    println!();
    println!("Paste the refresh token from the OAuth authorization exchange");
    println!("(scope activity:read_all), or leave empty if a token is already stored.");
    let refresh_token: String = Password::new()
        .with_prompt("Refresh token")
        .allow_empty_password(true)
        .interact()
        .context("Failed to read refresh token")?;

    let config = InteractiveConfig {
        client_id: client_id.trim().to_string(),
        client_secret,
        database_path,
        refresh_token: Some(refresh_token.trim().to_string()).filter(|t| !t.is_empty()),
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();
    println!("Setup complete! Starting sync...");
    println!();

    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub client_id: String,
    pub client_secret: String,
    pub database_path: String,
    pub refresh_token: Option<String>,
}

impl InteractiveConfig {
    /// Credential that forces a refresh on first use
    pub fn seed_credential(&self) -> Option<Credential> {
        self.refresh_token.as_ref().map(|refresh_token| Credential {
            access_token: "pending-refresh".to_string(),
            refresh_token: refresh_token.clone(),
            expires_at: 0,
            client_id: Some(self.client_id.clone()),
            client_secret: Some(self.client_secret.clone()),
        })
    }
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# Strava Sync Configuration
# Generated by interactive setup

# Strava API application (required)
STRAVA_CLIENT_ID={}
STRAVA_CLIENT_SECRET={}

# Destination database
DATABASE_PATH={}
TABLE_NAME=activities
IF_EXISTS=append

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.client_id, config.client_secret, config.database_path,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
