use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

/// Room left for multipart boundaries and part headers on top of the file size,
/// so that oversized files are caught by ingestion with a proper error.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = usize::try_from(
        state
            .config
            .limits
            .max_file_size
            .saturating_add(MULTIPART_OVERHEAD),
    )
    .unwrap_or(usize::MAX);

    Router::new()
        // Uploads
        .route("/upload", post(handlers::create_upload))
        .route("/upload/:upload_id", get(handlers::get_upload))
        .route("/upload/:upload_id", delete(handlers::remove_upload))
        // Files
        .route(
            "/file/:upload_id",
            post(handlers::add_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/file/:upload_id/:file_id/:file_name",
            post(handlers::add_declared_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/file/:upload_id/:file_id/:file_name", get(handlers::get_file))
        .route(
            "/file/:upload_id/:file_id/:file_name",
            delete(handlers::remove_file),
        )
        .route(
            "/stream/:upload_id/:file_id/:file_name",
            get(handlers::get_stream),
        )
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
