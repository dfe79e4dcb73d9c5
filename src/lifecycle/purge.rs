use tracing::{debug, warn};

use super::{Lifecycle, LifecycleError};
use crate::storage::models::{File, FileStatus, Upload};

impl Lifecycle {
    /// Delete the bytes of a `removed` file and mark it `deleted`, then drop
    /// the upload if nothing live remains.
    ///
    /// The caller must have moved the file to `removed` first. If the data
    /// store fails the file stays `removed` and the error is returned.
    pub async fn purge(&self, upload: &Upload, file: &File) -> Result<(), LifecycleError> {
        let backend = self.state.data_store_for(upload);
        if let Err(e) = backend.remove_file(upload, file).await {
            warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Failed to delete file data");
            return Err(e.into());
        }

        self.state
            .metadata
            .update_file(&upload.id, &file.id, &mut |f| {
                f.transition(FileStatus::Removed, FileStatus::Deleted)
            })?;
        debug!(upload_id = %upload.id, file_id = %file.id, "File deleted");

        self.remove_upload_if_empty(upload).await;
        Ok(())
    }
}
