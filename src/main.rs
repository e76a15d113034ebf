use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use weibo_backup::config::Config;
use weibo_backup::db::Database;
use weibo_backup::pipeline::{EventSink, Pipeline};

/// Exit code when the run finished but a phase stopped early (anti-bot
/// exhaustion, cancellation). The archive is consistent and a later run
/// will pick up where this one left off.
const EXIT_STOPPED_EARLY: i32 = 2;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(stopped_early) => {
            if stopped_early {
                std::process::exit(EXIT_STOPPED_EARLY);
            }
        }
        Err(e) => {
            error!("Fatal error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<bool> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting weibo-backup");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(user_id = %config.user_id, "Configuration loaded");

    // Ensure data directories exist
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory: {}",
                config.storage_dir.display()
            )
        })?;
    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized");

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .gzip(true)
        .build()
        .context("Failed to build HTTP client")?;

    let events = EventSink::from_config(config.events_path.as_deref());

    // A shutdown signal cancels the run between units of work; the store is
    // checkpointed, so nothing is lost.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, finishing current step");
        signal_cancel.cancel();
    });

    let pipeline = Pipeline::new(config, db, client, events, cancel);
    let summary = pipeline.run().await?;

    info!(
        new_posts = summary.new_posts,
        enriched = summary.enriched,
        marked_missing = summary.marked_missing,
        images = summary.images_downloaded,
        videos = summary.videos_downloaded,
        stopped_early = summary.stopped_early,
        "Run finished"
    );

    Ok(summary.stopped_early)
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,weibo_backup=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        // Pretty-printed logging for development
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
