//! attendanced: HTTP service that stores check-in snapshots and records.
//!
//! `POST /api/check` accepts a multipart upload, `GET /api/records` lists
//! what has been stored, `GET /api/health` probes the database and
//! `/uploads` serves the stored images back.

pub mod config;
pub mod error;
pub mod routes;
pub mod store;
pub mod uploads;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use config::Config;
use store::{AttendanceStore, SqliteStore, UnavailableStore};
use uploads::UploadDir;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AttendanceStore>,
    pub uploads: Arc<UploadDir>,
}

impl AppState {
    pub fn new(store: Arc<dyn AttendanceStore>, uploads: UploadDir) -> Self {
        Self {
            store,
            uploads: Arc::new(uploads),
        }
    }
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    let uploads = ServeDir::new(state.uploads.path());

    Router::new()
        .route("/", get(routes::root))
        .route("/api/check", post(routes::check))
        .route("/api/records", get(routes::records))
        .route("/api/health", get(routes::health))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the database, falling back to a degraded store that reports every
/// call as unavailable. The service keeps running either way.
pub async fn open_store(config: &Config) -> Arc<dyn AttendanceStore> {
    match SqliteStore::open(&config.db_path, config.db_pool_size, config.db_busy_timeout()).await
    {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(
                path = %config.db_path.display(),
                error = %err,
                "database unavailable; running degraded"
            );
            Arc::new(UnavailableStore::new(err.to_string()))
        }
    }
}

/// Bind and serve until ctrl-c or SIGTERM.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config).await;
    let uploads = UploadDir::create(&config.upload_dir).await?;
    tracing::info!(dir = %uploads.path().display(), "serving uploads");

    let app = build_router(AppState::new(store, uploads), config.max_upload_bytes);

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "attendanced listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("attendanced shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
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
    tracing::info!("shutdown signal received");
}
