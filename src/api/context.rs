use axum::http::{header, HeaderMap};
use std::sync::Arc;

use super::response::ApiError;
use crate::lifecycle::{AccessDecision, Lifecycle};
use crate::storage::models::Upload;
use crate::AppState;

/// Header carrying the upload token.
pub const UPLOAD_TOKEN_HEADER: &str = "x-uploadtoken";

/// Everything a handler needs about the upload a request targets.
pub struct UploadContext {
    pub lifecycle: Lifecycle,
    pub upload: Upload,
    pub access: AccessDecision,
}

impl UploadContext {
    /// Load the upload, decide the caller's rights and check basic credentials
    /// on password protected uploads.
    pub fn resolve(
        state: &Arc<AppState>,
        upload_id: &str,
        headers: &HeaderMap,
    ) -> Result<Self, ApiError> {
        let lifecycle = Lifecycle::new(Arc::clone(state));
        let upload = lifecycle.get_upload(upload_id)?;

        let token = headers
            .get(UPLOAD_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        let access = AccessDecision::for_upload(&upload, token);

        if access.needs_credentials(&upload) {
            let credentials = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Basic "))
                .map(str::trim);
            match credentials {
                Some(payload) if upload.verify_basic_credentials(payload) => {}
                _ => {
                    return Err(ApiError::unauthorized(
                        "please provide valid credentials to access this upload",
                    ))
                }
            }
        }

        Ok(Self {
            lifecycle,
            upload,
            access,
        })
    }
}
