pub mod db;
pub mod models;
mod tables;
mod uploads;

pub use db::{Database, MetadataError};
pub use tables::{EXPIRATIONS, FILES, UPLOADS};

use chrono::{DateTime, Utc};

use models::{File, TxError, Upload};

/// Mutation applied to the latest stored version of a record.
/// Returning an error aborts the transaction without side effects.
pub type Tx<'a, T> = &'a mut dyn FnMut(&mut T) -> Result<(), TxError>;

/// Durable store for upload and file records.
///
/// Every state change goes through one of the `update_*` primitives, which
/// atomically load the latest record, apply the mutation and store the result.
/// A record that disappeared concurrently makes them fail with
/// [`MetadataError::UploadNotFound`] / [`MetadataError::FileNotFound`] instead
/// of calling the mutation. Returned records are copies, never live state.
pub trait MetadataStore: Send + Sync {
    /// Store a new upload together with its declared files. Fails if the id exists.
    fn create_upload(&self, upload: &Upload, files: &[File]) -> Result<(), MetadataError>;

    fn get_upload(&self, id: &str) -> Result<Option<Upload>, MetadataError>;

    fn update_upload(&self, id: &str, tx: Tx<'_, Upload>) -> Result<Upload, MetadataError>;

    /// Remove an upload and all of its file records. Returns false if absent.
    fn remove_upload(&self, id: &str) -> Result<bool, MetadataError>;

    /// Remove the upload only if every one of its files is `deleted`.
    fn remove_upload_if_empty(&self, id: &str) -> Result<bool, MetadataError>;

    /// Ids of uploads whose expiration date is at or before `now`.
    fn get_uploads_to_remove(&self, now: DateTime<Utc>) -> Result<Vec<String>, MetadataError>;

    /// Add a file to an existing upload, enforcing the per-upload file limit.
    fn create_file(&self, file: &File, max_files: usize) -> Result<(), MetadataError>;

    fn get_file(&self, upload_id: &str, file_id: &str) -> Result<Option<File>, MetadataError>;

    fn get_files(&self, upload_id: &str) -> Result<Vec<File>, MetadataError>;

    fn update_file(
        &self,
        upload_id: &str,
        file_id: &str,
        tx: Tx<'_, File>,
    ) -> Result<File, MetadataError>;

    /// Apply `tx` to every file of the upload in a single transaction.
    fn update_files(&self, upload_id: &str, tx: Tx<'_, File>) -> Result<Vec<File>, MetadataError>;
}
