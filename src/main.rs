use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use strava_sync::auth::AuthManager;
use strava_sync::config::{self, Command, Config, LogFormat};
use strava_sync::extractor::{PaginatedExtractor, StravaApiClient};
use strava_sync::http_client::StravaHttpClient;
use strava_sync::loader::{IncrementalLoader, SqliteDestination};
use strava_sync::pipeline::SyncPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing required values)
    let setup = if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("STRAVA_CLIENT_ID", &interactive_config.client_id);
        std::env::set_var("STRAVA_CLIENT_SECRET", &interactive_config.client_secret);
        std::env::set_var("DATABASE_PATH", &interactive_config.database_path);
        Some(interactive_config)
    } else {
        None
    };

    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config);

    tracing::info!("Strava sync v{} starting...", env!("CARGO_PKG_VERSION"));
    tracing::debug!(
        "Database: {}, table: {}, policy: {}",
        config.database_path.display(),
        config.table_name,
        config.if_exists
    );

    let http = StravaHttpClient::new(
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
        config.http_retry_delay_ms,
    )?;

    let store = config.build_token_store();
    if let Some(seed) = setup.as_ref().and_then(|s| s.seed_credential()) {
        if !matches!(store.load(), Ok(Some(_))) {
            store
                .save(&seed)
                .context("Failed to seed credential store")?;
            tracing::info!("Seeded credential store at {}", store.describe());
        }
    }

    let auth = Arc::new(
        AuthManager::new(
            store,
            http.clone(),
            config.token_url.clone(),
            config.refresh_buffer_minutes,
        )
        .with_client_credentials(config.client.clone()),
    );
    tracing::info!("Using credential store {}", auth.store_description());

    match config.command {
        Command::TokenStatus => {
            let status = auth.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        Command::RefreshToken { force } => {
            let credential = auth.ensure_valid(force).await?;
            let status = auth.status_of(&credential);
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        _ => {}
    }

    let Some(window) = config.window() else {
        return Ok(());
    };

    let api = Arc::new(StravaApiClient::new(http, config.api_base_url.clone()));
    let extractor = PaginatedExtractor::new(api).with_per_page(config.per_page);
    let destination = Arc::new(SqliteDestination::new(config.database_path.clone()));
    let loader =
        IncrementalLoader::new(destination, config.if_exists).with_chunk_size(config.chunk_size);
    let pipeline = SyncPipeline::new(auth, extractor, loader, config.table_name.clone());

    // Stop between stages on Ctrl+C / SIGTERM
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = pipeline.run(&window, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize logging with the configured level and format
fn init_tracing(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, cancelling sync...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, cancelling sync...");
        },
    }
}
