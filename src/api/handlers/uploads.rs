use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use super::files::FileResponse;
use crate::api::context::UploadContext;
use crate::api::response::{ApiError, AppJson, JSend};
use crate::lifecycle::{Lifecycle, NewUpload};
use crate::storage::models::{File, Upload};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub created_at: String,
    pub ttl: i64,
    pub expires_at: Option<String>,
    pub one_shot: bool,
    pub stream: bool,
    pub removable: bool,
    pub protected_by_password: bool,
    pub protected_by_otp: bool,
    pub comments: Option<String>,
    /// Only present in the creation response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_token: Option<String>,
    /// Whether the caller holds the upload token
    pub admin: bool,
    pub files: Vec<FileResponse>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    AppJson(params): AppJson<NewUpload>,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let lifecycle = Lifecycle::new(state);
    let remote_ip = remote.map(|ConnectInfo(addr)| addr.ip().to_string());

    let (upload, files) = lifecycle.create_upload(params, remote_ip)?;
    let token = upload.upload_token.clone();

    let mut response = upload_to_response(upload, files, true);
    response.upload_token = Some(token);
    Ok(JSend::success(response))
}

pub async fn get_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let ctx = UploadContext::resolve(&state, &upload_id, &headers)?;
    let files = ctx.lifecycle.upload_files(&ctx.upload)?;

    Ok(JSend::success(upload_to_response(
        ctx.upload,
        files,
        ctx.access.is_upload_admin(),
    )))
}

pub async fn remove_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JSend<()>>, ApiError> {
    let ctx = UploadContext::resolve(&state, &upload_id, &headers)?;
    ctx.lifecycle.remove_upload(&ctx.upload, ctx.access).await?;

    tracing::debug!(upload_id = %upload_id, "Removed upload");
    Ok(JSend::success(()))
}

// ============================================================================
// Helpers
// ============================================================================

fn upload_to_response(mut upload: Upload, files: Vec<File>, admin: bool) -> UploadResponse {
    upload.sanitize();
    UploadResponse {
        id: upload.id.clone(),
        created_at: upload.created_at.to_rfc3339(),
        ttl: upload.ttl,
        expires_at: upload.expires_at().map(|d| d.to_rfc3339()),
        one_shot: upload.one_shot,
        stream: upload.stream,
        removable: upload.removable,
        protected_by_password: upload.protected_by_password,
        protected_by_otp: upload.protected_by_otp,
        comments: upload.comments,
        upload_token: None,
        admin,
        files: files.into_iter().map(FileResponse::from).collect(),
    }
}
