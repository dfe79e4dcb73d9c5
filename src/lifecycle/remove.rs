use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{AccessDecision, Lifecycle, LifecycleError};
use crate::storage::models::{File, FileStatus, TxError, Upload};

impl Lifecycle {
    /// Remove one file. Removing a file that is already removed or deleted
    /// succeeds without doing anything.
    pub async fn remove_file(
        &self,
        upload: &Upload,
        file: &File,
        access: AccessDecision,
    ) -> Result<File, LifecycleError> {
        if !access.can_remove(upload) {
            return Err(LifecycleError::Forbidden(
                "you are not allowed to remove files from this upload".to_string(),
            ));
        }

        let mut needs_purge = false;
        let updated = self
            .state
            .metadata
            .update_file(&upload.id, &file.id, &mut |f| {
                needs_purge = false;
                match f.status {
                    FileStatus::Removed | FileStatus::Deleted => Ok(()),
                    FileStatus::Uploading => Err(TxError::Conflict(format!(
                        "file {} ({}) is being uploaded",
                        f.name, f.id
                    ))),
                    current @ (FileStatus::Missing | FileStatus::Uploaded) => {
                        needs_purge = true;
                        f.transition(current, FileStatus::Removed)
                    }
                }
            })?;

        if needs_purge {
            info!(upload_id = %upload.id, file_id = %file.id, "File removed");
            if let Err(e) = self.purge(upload, &updated).await {
                warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Purge failed, file stays removed");
            }
        }
        Ok(updated.sanitize())
    }

    /// Remove an upload and everything in it.
    pub async fn remove_upload(
        &self,
        upload: &Upload,
        access: AccessDecision,
    ) -> Result<(), LifecycleError> {
        if !access.can_remove(upload) {
            return Err(LifecycleError::Forbidden(
                "you are not allowed to remove this upload".to_string(),
            ));
        }
        self.discard_upload(upload).await
    }

    /// Mark every live file `removed`, purge them, then drop the upload.
    /// A file whose purge fails keeps the upload alive.
    async fn discard_upload(&self, upload: &Upload) -> Result<(), LifecycleError> {
        let files = self
            .state
            .metadata
            .update_files(&upload.id, &mut |f| match f.status {
                FileStatus::Removed | FileStatus::Deleted => Ok(()),
                current => f.transition(current, FileStatus::Removed),
            })?;

        let mut failures = 0;
        for file in files.iter().filter(|f| f.status == FileStatus::Removed) {
            if let Err(e) = self.purge(upload, file).await {
                warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Purge failed");
                failures += 1;
            }
        }

        // Also covers uploads without any file.
        let removed = self.remove_upload_if_empty(upload).await;
        info!(upload_id = %upload.id, removed, failures, "Upload removal processed");
        Ok(())
    }

    /// Remove every upload expired at `now`. Returns how many were processed.
    pub async fn remove_expired_uploads(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let ids = self.state.metadata.get_uploads_to_remove(now)?;
        let mut processed = 0;

        for id in ids {
            let upload = match self.state.metadata.get_upload(&id) {
                Ok(Some(upload)) => upload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(upload_id = %id, error = %e, "Failed to load expired upload");
                    continue;
                }
            };

            info!(upload_id = %id, "Removing expired upload");
            match self.discard_upload(&upload).await {
                Ok(()) => processed += 1,
                Err(e) => warn!(upload_id = %id, error = %e, "Failed to remove expired upload"),
            }
        }
        Ok(processed)
    }
}
