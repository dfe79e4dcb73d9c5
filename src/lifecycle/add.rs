use std::fmt::Display;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use tracing::{debug, info, warn};

use super::create::check_file_name;
use super::{AccessDecision, Lifecycle, LifecycleError};
use crate::ingest::{ingest, IngestError, Ingested};
use crate::storage::models::{BackendDetails, File, FileStatus, TxError, Upload};

/// The `file` part of an add-file request.
pub struct FilePart<S> {
    /// File name sent by the client
    pub name: Option<String>,
    pub body: S,
}

impl Lifecycle {
    /// Upload the content of a file.
    ///
    /// Without `file_id` a new file is allocated. Otherwise the declared file
    /// must still be `missing`, or `uploading` for longer than the uploading
    /// timeout. A failed transfer leaves the file `uploading`.
    pub async fn add_file<S, E>(
        &self,
        upload: &Upload,
        access: AccessDecision,
        file_id: Option<&str>,
        part: FilePart<S>,
    ) -> Result<File, LifecycleError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        if !access.can_add_files() {
            return Err(LifecycleError::Forbidden(
                "you are not allowed to add files to this upload".to_string(),
            ));
        }

        let name = part.name.unwrap_or_default();
        check_file_name(&name)?;

        let file = match file_id {
            Some(file_id) => {
                let declared = self.get_file_record(upload, file_id, None)?;
                if !declared.name.is_empty() && declared.name != name {
                    return Err(LifecycleError::InvalidParameter(format!(
                        "invalid file name {name}, expected {}",
                        declared.name
                    )));
                }
                declared
            }
            None => {
                let file = File::new(&upload.id, name.clone());
                let max_files = self.state.config.limits.max_file_per_upload;
                self.state.metadata.create_file(&file, max_files)?;
                file
            }
        };

        let started = Utc::now();
        let file = self.begin_upload(upload, &file.id, &name, started)?;

        let max_size = self.state.config.limits.max_file_size;
        let backend = self.state.data_store_for(upload);
        let (reader, pump) = ingest(part.body, max_size, &name);
        let (ingested, stored) = tokio::join!(pump, backend.add_file(upload, &file, reader));

        let (ingested, details) = match (ingested, stored) {
            (Ok(ingested), Ok(details)) => (ingested, details),
            // The store gave up first and the pipe broke under ingestion.
            (Err(IngestError::Relay(_)), Err(e)) | (Ok(_), Err(e)) => {
                warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Data store write failed");
                return Err(self.abort_upload(upload, &file, e.into()).await);
            }
            (Err(e), _) => {
                warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "File ingestion failed");
                return Err(self.abort_upload(upload, &file, e.into()).await);
            }
        };

        let file = match self.finish_upload(upload, &file.id, started, ingested, details) {
            Ok(file) => file,
            Err(e) => {
                // Removed or taken over while transferring: the bytes belong to nobody.
                warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Unable to finalize upload");
                return Err(self.abort_upload(upload, &file, e).await);
            }
        };

        info!(
            upload_id = %upload.id,
            file_id = %file.id,
            size = file.size,
            status = %file.status,
            "File uploaded"
        );

        if upload.stream {
            self.remove_upload_if_empty(upload).await;
        }
        Ok(file.sanitize())
    }

    /// `missing -> uploading`, or restart an abandoned `uploading` file.
    fn begin_upload(
        &self,
        upload: &Upload,
        file_id: &str,
        name: &str,
        started: DateTime<Utc>,
    ) -> Result<File, LifecycleError> {
        let timeout = Duration::seconds(self.state.config.limits.uploading_timeout_secs);

        let file = self.state.metadata.update_file(&upload.id, file_id, &mut |f| {
            if f.is_abandoned(started, timeout) {
                warn!(upload_id = %f.upload_id, file_id = %f.id, "Restarting abandoned upload");
            } else {
                f.transition(FileStatus::Missing, FileStatus::Uploading)
                    .map_err(|_| {
                        TxError::Conflict(format!(
                            "file {} ({}) has already been uploaded or removed",
                            f.name, f.id
                        ))
                    })?;
            }
            f.status = FileStatus::Uploading;
            f.uploading_since = Some(started);
            if f.name.is_empty() {
                f.name = name.to_string();
            }
            Ok(())
        })?;

        debug!(upload_id = %upload.id, file_id = %file.id, "File is uploading");
        Ok(file)
    }

    /// Record the transfer result. Stream files end `deleted` since their only
    /// reader already consumed them.
    fn finish_upload(
        &self,
        upload: &Upload,
        file_id: &str,
        started: DateTime<Utc>,
        ingested: Ingested,
        details: BackendDetails,
    ) -> Result<File, LifecycleError> {
        let stream = upload.stream;
        let mut details = Some(details);

        let file = self.state.metadata.update_file(&upload.id, file_id, &mut |f| {
            if f.uploading_since != Some(started) {
                return Err(TxError::Conflict(format!(
                    "file {} ({}) upload was restarted by another request",
                    f.name, f.id
                )));
            }
            match (stream, f.status) {
                (false, _) => f.transition(FileStatus::Uploading, FileStatus::Uploaded)?,
                // The downloader may have flagged it already.
                (true, FileStatus::Deleted) => {}
                (true, _) => f.transition(FileStatus::Uploading, FileStatus::Deleted)?,
            }
            f.mime_type = ingested.mime_type.clone();
            f.size = ingested.size;
            f.md5 = Some(ingested.md5.clone());
            f.upload_date = Some(Utc::now());
            if let Some(details) = details.take() {
                f.backend_details = details;
            }
            Ok(())
        })?;

        Ok(file)
    }

    /// Best effort removal of the bytes of a failed attempt. A stream file
    /// claimed by a downloader is already `deleted`, its upload may be empty now.
    async fn abort_upload(
        &self,
        upload: &Upload,
        file: &File,
        error: LifecycleError,
    ) -> LifecycleError {
        let backend = self.state.data_store_for(upload);
        if let Err(e) = backend.remove_file(upload, file).await {
            warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Failed to discard partial file");
        }
        if upload.stream {
            self.remove_upload_if_empty(upload).await;
        }
        error
    }
}
