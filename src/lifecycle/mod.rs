//! Upload and file lifecycle.
//!
//! Every status change goes through a metadata transaction that re-reads the
//! latest record, so concurrent requests resolve to a single winner. Data store
//! calls are made outside transactions and never roll back metadata.

mod access;
mod add;
mod create;
mod get;
mod purge;
mod remove;

pub use access::AccessDecision;
pub use add::FilePart;
pub use create::{DeclaredFile, NewUpload};
pub use get::Download;

use std::sync::Arc;

use thiserror::Error;

use crate::data::DataStoreError;
use crate::ingest::IngestError;
use crate::storage::models::{File, TxError, Upload};
use crate::storage::MetadataError;
use crate::AppState;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("file too big (limit is set to {0} bytes)")]
    TooBig(u64),
    #[error("metadata backend error: {0}")]
    Metadata(MetadataError),
    #[error("data backend error: {0}")]
    Data(#[from] DataStoreError),
    #[error("unable to upload file: {0}")]
    Ingest(IngestError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MetadataError> for LifecycleError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::UploadNotFound(id) => {
                LifecycleError::NotFound(format!("upload {id} not found"))
            }
            MetadataError::FileNotFound(id) => {
                LifecycleError::NotFound(format!("file {id} not found"))
            }
            MetadataError::TooManyFiles(limit) => LifecycleError::QuotaExceeded(format!(
                "maximum number of files per upload reached, limit is {limit}"
            )),
            MetadataError::UploadExists(_) | MetadataError::FileExists(_) => {
                LifecycleError::Conflict(e.to_string())
            }
            MetadataError::Rejected(TxError::Conflict(msg)) => LifecycleError::Conflict(msg),
            MetadataError::Rejected(TxError::Gone(msg)) => LifecycleError::NotFound(msg),
            other => LifecycleError::Metadata(other),
        }
    }
}

impl From<IngestError> for LifecycleError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::TooBig { limit } => LifecycleError::TooBig(limit),
            other => LifecycleError::Ingest(other),
        }
    }
}

/// Entry point of every upload and file operation.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<AppState>,
}

impl Lifecycle {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Look up an upload, treating expired ones as absent.
    pub fn get_upload(&self, upload_id: &str) -> Result<Upload, LifecycleError> {
        let upload = self
            .state
            .metadata
            .get_upload(upload_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("upload {upload_id} not found")))?;

        if upload.is_expired(chrono::Utc::now()) {
            return Err(LifecycleError::NotFound(format!(
                "upload {upload_id} has expired"
            )));
        }
        Ok(upload)
    }

    /// Client view of the files of an upload.
    pub fn upload_files(&self, upload: &Upload) -> Result<Vec<File>, LifecycleError> {
        let files = self.state.metadata.get_files(&upload.id)?;
        Ok(files.into_iter().map(File::sanitize).collect())
    }

    /// Look up a file of `upload`. When `name` is given it must match the stored name.
    pub fn get_file_record(
        &self,
        upload: &Upload,
        file_id: &str,
        name: Option<&str>,
    ) -> Result<File, LifecycleError> {
        let file = self
            .state
            .metadata
            .get_file(&upload.id, file_id)?
            .ok_or_else(|| LifecycleError::NotFound(format!("file {file_id} not found")))?;

        match name {
            Some(name) if name != file.name => Err(LifecycleError::NotFound(format!(
                "file {file_id} ({name}) not found"
            ))),
            _ => Ok(file),
        }
    }

    /// Drop the upload record once every file is deleted, then release its
    /// backend resources. Failures are logged.
    pub(crate) async fn remove_upload_if_empty(&self, upload: &Upload) -> bool {
        match self.state.metadata.remove_upload_if_empty(&upload.id) {
            Ok(true) => {
                tracing::info!(upload_id = %upload.id, "Upload is empty, removed");
                let backend = self.state.data_store_for(upload);
                if let Err(e) = backend.remove_upload(upload).await {
                    tracing::warn!(upload_id = %upload.id, error = %e, "Failed to release upload data");
                }
                true
            }
            Ok(false) => false,
            Err(MetadataError::UploadNotFound(_)) => false,
            Err(e) => {
                tracing::warn!(upload_id = %upload.id, error = %e, "Failed to remove empty upload");
                false
            }
        }
    }
}
