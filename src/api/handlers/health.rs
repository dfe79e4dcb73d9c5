use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::response::{ApiError, JSend};
use crate::config::StorageBackend;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub version: &'static str,
    pub storage: &'static str,
    pub max_file_size: u64,
}

/// Liveness probe. Fails when the metadata database cannot be read.
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<HealthResponse>>, ApiError> {
    // Scanning the expiration index up to the epoch reads nothing but the table.
    state
        .metadata
        .get_uploads_to_remove(DateTime::<Utc>::UNIX_EPOCH)
        .map_err(|e| {
            tracing::error!(error = %e, "Metadata database is unavailable");
            ApiError::Error(StatusCode::SERVICE_UNAVAILABLE, "metadata unavailable".into())
        })?;

    Ok(JSend::success(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        storage: match state.config.storage.backend {
            StorageBackend::Local => "local",
            StorageBackend::Gcs => "gcs",
        },
        max_file_size: state.config.limits.max_file_size,
    }))
}
