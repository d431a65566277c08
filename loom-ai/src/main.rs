//! loom-ai - AI generation service for Storyloom
//!
//! Serves text suggestions, expansions, canon diffs, merge proposals and
//! scene images over HTTP, with a background image job queue.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use loom_common::config::{default_config_path, load_or_default, RootFolderInitializer, RootFolderResolver};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loom_ai::config::{resolve_provider_api_key, MODULE_NAME};
use loom_ai::provider::{GeminiProvider, ModelProvider};
use loom_ai::AppState;

/// Command-line arguments for loom-ai
#[derive(Parser, Debug)]
#[command(name = "loom-ai")]
#[command(about = "AI generation service for Storyloom story graphs")]
#[command(version)]
struct Args {
    /// Root folder holding the database and generated media
    #[arg(short, long, env = "LOOM_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Socket address to listen on, overriding [server] bind
    #[arg(short, long, env = "LOOM_AI_BIND")]
    bind: Option<SocketAddr>,

    /// TOML config file
    #[arg(short, long, env = "LOOM_AI_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(|| default_config_path(MODULE_NAME));
    let config = load_or_default(config_path.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins over the TOML level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting {} v{} ({})", MODULE_NAME, env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    if let Some(path) = &config_path {
        info!("Config path: {}", path.display());
    }

    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli_arg(args.root_folder.clone())
        .with_toml_config(&config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db_path = initializer.database_path();
    let db_pool = loom_common::db::init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    info!("Database: {}", db_path.display());

    let api_key = resolve_provider_api_key(&config);
    let provider = GeminiProvider::new(&config.provider, api_key).context("Failed to build provider client")?;
    let provider_configured = provider.is_configured();
    let provider: Arc<dyn ModelProvider> = Arc::new(provider);

    let bind = match args.bind {
        Some(addr) => addr,
        None => config
            .server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid [server] bind address: {}", config.server.bind))?,
    };

    let state = AppState::new(
        db_pool,
        initializer.media_path(),
        config,
        provider,
        provider_configured,
    );

    let cancel = CancellationToken::new();
    let handles = state
        .spawn_background(cancel.clone())
        .await
        .context("Failed to start background tasks")?;

    let app = loom_ai::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping background tasks");
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
