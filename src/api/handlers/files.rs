use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::context::UploadContext;
use crate::api::response::{ApiError, AppQuery, JSend};
use crate::lifecycle::{FilePart, LifecycleError};
use crate::storage::models::{File, FileStatus};
use crate::AppState;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; img-src 'self'; media-src 'self'; style-src 'unsafe-inline'; sandbox";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub id: String,
    pub name: String,
    pub status: FileStatus,
    pub mime_type: String,
    pub size: u64,
    pub md5: Option<String>,
    pub upload_date: Option<String>,
}

impl From<File> for FileResponse {
    fn from(file: File) -> Self {
        let file = file.sanitize();
        FileResponse {
            id: file.id,
            name: file.name,
            status: file.status,
            mime_type: file.mime_type,
            size: file.size,
            md5: file.md5,
            upload_date: file.upload_date.map(|d| d.to_rfc3339()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FilePath {
    pub upload_id: String,
    pub file_id: String,
    pub file_name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    /// Any non-empty value asks for an attachment
    #[serde(default)]
    pub dl: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Upload a new file into an upload.
/// Route: POST /file/:upload_id
pub async fn add_file(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let ctx = UploadContext::resolve(&state, &upload_id, &headers)?;
    let file = upload_part(&ctx, None, multipart).await?;
    Ok(JSend::success(FileResponse::from(file)))
}

/// Upload the content of a file declared at upload creation.
/// Route: POST /file/:upload_id/:file_id/:file_name
pub async fn add_declared_file(
    State(state): State<Arc<AppState>>,
    Path(params): Path<FilePath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let ctx = UploadContext::resolve(&state, &params.upload_id, &headers)?;
    ctx.lifecycle
        .get_file_record(&ctx.upload, &params.file_id, Some(&params.file_name))?;

    let file = upload_part(&ctx, Some(&params.file_id), multipart).await?;
    Ok(JSend::success(FileResponse::from(file)))
}

/// Download (GET) or probe (HEAD) a file of a regular upload.
/// Route: /file/:upload_id/:file_id/:file_name
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(params): Path<FilePath>,
    AppQuery(query): AppQuery<DownloadParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_file(&state, method, params, query, &headers, false).await
}

/// Download (GET) or probe (HEAD) a file of a stream upload.
/// Route: /stream/:upload_id/:file_id/:file_name
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(params): Path<FilePath>,
    AppQuery(query): AppQuery<DownloadParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_file(&state, method, params, query, &headers, true).await
}

async fn serve_file(
    state: &Arc<AppState>,
    method: Method,
    params: FilePath,
    query: DownloadParams,
    headers: &HeaderMap,
    stream_route: bool,
) -> Result<Response, ApiError> {
    let ctx = UploadContext::resolve(state, &params.upload_id, headers)?;
    if ctx.upload.stream != stream_route {
        return Err(ApiError::not_found(format!(
            "file {} ({}) not found",
            params.file_name, params.file_id
        )));
    }
    let file = ctx
        .lifecycle
        .get_file_record(&ctx.upload, &params.file_id, Some(&params.file_name))?;

    let probe = method == Method::HEAD;
    let download = ctx.lifecycle.get_file(&ctx.upload, &file, probe).await?;

    let body = match download.body {
        Some(reader) => Body::from_stream(ReaderStream::new(reader)),
        None => Body::empty(),
    };

    let mut response = (StatusCode::OK, body).into_response();
    let attachment = query.dl.is_some_and(|dl| !dl.is_empty() && dl != "0");
    set_download_headers(
        response.headers_mut(),
        &download.file,
        attachment,
        ctx.upload.one_shot,
        !ctx.upload.stream,
    );

    tracing::debug!(
        upload_id = %ctx.upload.id,
        file_id = %file.id,
        probe,
        "Serving file"
    );
    Ok(response)
}

/// Route: DELETE /file/:upload_id/:file_id/:file_name
pub async fn remove_file(
    State(state): State<Arc<AppState>>,
    Path(params): Path<FilePath>,
    headers: HeaderMap,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let ctx = UploadContext::resolve(&state, &params.upload_id, &headers)?;
    let file = ctx
        .lifecycle
        .get_file_record(&ctx.upload, &params.file_id, Some(&params.file_name))?;

    let file = ctx
        .lifecycle
        .remove_file(&ctx.upload, &file, ctx.access)
        .await?;
    Ok(JSend::success(FileResponse::from(file)))
}

// ============================================================================
// Helpers
// ============================================================================

/// Feed the `file` part of the form to the lifecycle. Other parts are skipped.
async fn upload_part(
    ctx: &UploadContext,
    file_id: Option<&str>,
    mut multipart: Multipart,
) -> Result<File, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let part = FilePart {
            name: field.file_name().map(|s| s.to_string()),
            body: field,
        };
        let file = ctx
            .lifecycle
            .add_file(&ctx.upload, ctx.access, file_id, part)
            .await?;
        return Ok(file);
    }

    Err(LifecycleError::MissingParameter("file part in multipart form".to_string()).into())
}

/// Content type a browser may safely be given for `mime_type`.
fn served_content_type(mime_type: &str) -> &str {
    if mime_type.contains("html") {
        "text/plain"
    } else if mime_type.is_empty() || mime_type.contains("flash") || mime_type.contains("pdf") {
        "application/octet-stream"
    } else {
        mime_type
    }
}

fn content_disposition(name: &str, attachment: bool) -> HeaderValue {
    let kind = if attachment { "attachment" } else { "inline" };
    let safe: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    HeaderValue::from_str(&format!("{kind}; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn set_download_headers(
    headers: &mut HeaderMap,
    file: &File,
    attachment: bool,
    one_shot: bool,
    known_length: bool,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(served_content_type(&file.mime_type))
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    if known_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size));
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&file.name, attachment),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );

    if one_shot {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    }
}
