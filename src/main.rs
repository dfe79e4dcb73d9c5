use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use file_share::config::{Config, StorageBackend};
use file_share::data::{DataStore, GcsStore, LocalStore, StreamStore};
use file_share::lifecycle::Lifecycle;
use file_share::storage::Database;
use file_share::{api, AppState};

/// `LOG_FORMAT=gcp` for Cloud Logging, `json` for plain JSON lines, text otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var("LOG_FORMAT")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "gcp" => registry.with(tracing_stackdriver::layer()).init(),
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(false),
            )
            .init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn open_data_store(config: &Config) -> anyhow::Result<Arc<dyn DataStore>> {
    let storage = &config.storage;
    Ok(match storage.backend {
        StorageBackend::Local => {
            let store = LocalStore::new(&storage.local_storage_path).with_context(|| {
                format!("unable to prepare {}", storage.local_storage_path)
            })?;
            info!(path = %storage.local_storage_path, "Storing files on the local filesystem");
            Arc::new(store)
        }
        StorageBackend::Gcs => {
            let bucket = storage
                .gcs_bucket
                .as_deref()
                .context("GCS_BUCKET is required with the gcs backend")?;
            let store = GcsStore::new(bucket, storage.gcs_credentials_file.as_deref()).await?;
            info!(bucket, "Storing files in Google Cloud Storage");
            Arc::new(store)
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "file-share starting");

    let config = Config::load()?;
    let metadata = Database::open(&config.data_dir)
        .with_context(|| format!("unable to open metadata database in {}", config.data_dir))?;
    info!(data_dir = %config.data_dir, "Metadata database opened");

    let state = Arc::new(AppState {
        data: open_data_store(&config).await?,
        metadata: Arc::new(metadata),
        stream: Arc::new(StreamStore::new()),
        config: config.clone(),
    });

    let sweeper = match config.cleaning_interval_secs {
        0 => {
            info!("Expired upload sweeper disabled");
            None
        }
        secs => Some(tokio::spawn(sweep_expired_uploads(
            Lifecycle::new(Arc::clone(&state)),
            Duration::from_secs(secs),
        ))),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Listening");

    axum::serve(
        listener,
        api::create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("Shutdown complete");
    Ok(())
}

/// Remove expired uploads every `period`.
async fn sweep_expired_uploads(lifecycle: Lifecycle, period: Duration) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        match lifecycle.remove_expired_uploads(chrono::Utc::now()).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Expired uploads removed"),
            Err(e) => error!(error = %e, "Expired upload sweep failed"),
        }
    }
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
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
