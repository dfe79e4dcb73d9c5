//! JSend reply envelopes and the error type shared by every handler.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ingest::IngestError;
use crate::lifecycle::LifecycleError;

/// Sent along 401 replies so browsers prompt for the upload credentials.
const BASIC_CHALLENGE: &str = "Basic realm=\"file-share\"";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JSendStatus {
    Error,
    Fail,
    Success,
}

/// `{"status": "success", "data": ...}`
#[derive(Debug, Serialize, Deserialize)]
pub struct JSend<T: Serialize> {
    pub data: T,
    pub status: JSendStatus,
}

impl<T: Serialize> JSend<T> {
    pub fn success(data: T) -> Json<JSend<T>> {
        Json(JSend {
            data,
            status: JSendStatus::Success,
        })
    }
}

/// A rejected request.
///
/// `Fail` is the client's fault and is rendered as
/// `{"status": "fail", "data": {"message": ...}}`. `Error` is ours and is
/// rendered as `{"status": "error", "message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    Fail(StatusCode, String),
    Error(StatusCode, String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::UNAUTHORIZED, message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::FORBIDDEN, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::NOT_FOUND, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::CONFLICT, message.into())
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::PAYLOAD_TOO_LARGE, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Error(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Fail(code, _) | ApiError::Error(code, _) => *code,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, body) = match self {
            ApiError::Fail(code, message) => (
                code,
                json!({ "status": JSendStatus::Fail, "data": { "message": message } }),
            ),
            ApiError::Error(code, message) => (
                code,
                json!({ "status": JSendStatus::Error, "message": message }),
            ),
        };

        let mut response = (code, Json(body)).into_response();
        if code == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(BASIC_CHALLENGE),
            );
        }
        response
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::InvalidParameter(_)
            | LifecycleError::MissingParameter(_)
            | LifecycleError::QuotaExceeded(_)
            | LifecycleError::Ingest(IngestError::Read(_)) => ApiError::bad_request(e.to_string()),
            LifecycleError::Forbidden(msg) => ApiError::forbidden(msg),
            LifecycleError::NotFound(msg) => ApiError::not_found(msg),
            LifecycleError::Conflict(msg) => ApiError::conflict(msg),
            LifecycleError::TooBig(_) => ApiError::payload_too_large(e.to_string()),
            LifecycleError::Ingest(_)
            | LifecycleError::Metadata(_)
            | LifecycleError::Data(_)
            | LifecycleError::Internal(_) => {
                tracing::error!(error = %e, "Request failed");
                ApiError::internal(e.to_string())
            }
        }
    }
}

/// `axum::Json` rejecting with a JSend fail reply.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        let rejection = match axum::Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => return Ok(AppJson(value)),
            Err(rejection) => rejection,
        };

        let message = match rejection {
            JsonRejection::JsonDataError(err) => {
                format!("invalid upload parameters: {}", err.body_text())
            }
            JsonRejection::JsonSyntaxError(_) => "malformed JSON body".to_string(),
            JsonRejection::MissingJsonContentType(_) => {
                "expected a Content-Type: application/json body".to_string()
            }
            _ => "unable to read request body".to_string(),
        };
        Err(ApiError::bad_request(message))
    }
}

/// Query string extractor rejecting with a JSend fail reply.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        serde_qs::from_str(parts.uri.query().unwrap_or_default())
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(format!("invalid query parameter: {e}")))
    }
}
