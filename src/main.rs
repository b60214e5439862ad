use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_relay::{
    api,
    config::{Config, StorageBackend},
    object_store as obj,
    progress::ProgressReporter,
    telegram::{Bot, BotApi},
    transfer::{JobRegistry, Relay},
    AppState,
};

/// How long in-flight jobs get to clean up after cancellation on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-relay starting");

    // Load configuration
    let config = Config::load()?;
    info!(
        max_file_size = config.transfer.max_file_size,
        download_dir = %config.transfer.download_dir.display(),
        "Loaded configuration"
    );

    // Initialize object store backend
    let object_store: Arc<dyn obj::ObjectStore> = match config.storage.backend {
        StorageBackend::Local => {
            let store = obj::LocalStore::new(&config.storage.local_storage_path)?;
            info!(
                "Using local storage backend at: {}",
                config.storage.local_storage_path
            );
            Arc::new(store)
        }
        StorageBackend::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 settings missing for the s3 backend"))?;
            let store = obj::S3Store::new(
                &s3.bucket,
                &obj::S3StoreConfig {
                    access_key_id: s3.access_key.expose(),
                    secret_access_key: s3.secret_key.expose(),
                    region: &s3.region,
                    endpoint_url: Some(&s3.endpoint),
                    force_path_style: s3.force_path_style,
                },
            );
            info!(
                bucket = %s3.bucket,
                endpoint = %s3.endpoint,
                "Using S3 storage backend"
            );
            Arc::new(store)
        }
    };

    // Wire the relay
    let api_client = BotApi::new(&config.telegram.api_url, config.telegram.bot_token.expose())?;
    let notifier = Arc::new(api_client.clone());
    let reporter = Arc::new(ProgressReporter::new(
        notifier.clone(),
        config.transfer.progress_interval,
    ));
    let relay = Arc::new(Relay::new(
        config.relay_settings(),
        Arc::new(JobRegistry::new()),
        reporter,
        object_store,
        notifier,
    ));

    // Start the bot
    let shutdown = CancellationToken::new();
    let bot = Bot::new(api_client, Arc::clone(&relay));
    let bot_shutdown = shutdown.clone();
    let bot_handle = tokio::spawn(async move {
        if let Err(e) = bot.run(bot_shutdown.clone()).await {
            tracing::error!(error = %e, "Bot stopped");
            bot_shutdown.cancel();
        }
    });

    // Build and start the HTTP server
    let state = Arc::new(AppState {
        relay: Arc::clone(&relay),
    });
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on: {}", config.bind_address);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {},
                _ = server_shutdown.cancelled() => {},
            }
        })
        .await?;

    // Stop polling, then unwind in-flight transfers
    shutdown.cancel();
    let cancelled = relay.cancel_all();
    if cancelled > 0 {
        info!(jobs = cancelled, "Cancelling in-flight uploads");
    }
    if !relay.drain(DRAIN_TIMEOUT).await {
        tracing::warn!("Timed out waiting for uploads to clean up");
    }
    if let Err(e) = bot_handle.await {
        tracing::error!(error = %e, "Bot task panicked");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
