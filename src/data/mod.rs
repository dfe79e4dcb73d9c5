mod gcs;
mod local;
mod stream;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use stream::StreamStore;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::storage::models::{BackendDetails, File, Upload};

/// Streaming body handed to or returned by a data store.
pub type DataReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Abstraction over file content backends.
///
/// Bytes are addressed by upload id and [`File::data_key`] only; names,
/// statuses and sizes live in the metadata store. Removing something that is
/// already gone succeeds.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Consume `reader` until EOF and persist its bytes. An error from `reader`
    /// aborts the write. Returns backend bookkeeping to store on the file.
    async fn add_file(
        &self,
        upload: &Upload,
        file: &File,
        reader: DataReader,
    ) -> Result<BackendDetails, DataStoreError>;

    async fn get_file(&self, upload: &Upload, file: &File) -> Result<DataReader, DataStoreError>;

    async fn remove_file(&self, upload: &Upload, file: &File) -> Result<(), DataStoreError>;

    /// Release whatever the backend keeps for the upload as a whole.
    async fn remove_upload(&self, upload: &Upload) -> Result<(), DataStoreError>;
}

/// Ids reach the backends as path or object name segments.
pub(crate) fn check_key(id: &str) -> Result<&str, DataStoreError> {
    if !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(id)
    } else {
        Err(DataStoreError::InvalidKey(id.to_string()))
    }
}

/// `{upload_id}/{data_key}`, the object key shared by all backends.
pub(crate) fn object_key(upload: &Upload, file: &File) -> Result<String, DataStoreError> {
    let data_key = file.data_key();
    Ok(format!("{}/{}", check_key(&upload.id)?, check_key(&data_key)?))
}
