use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use super::{Lifecycle, LifecycleError};
use crate::data::{DataReader, DataStoreError};
use crate::storage::models::{File, FileStatus, TxError, Upload};

/// A file ready to be served. `body` is `None` for metadata probes.
pub struct Download {
    pub file: File,
    pub body: Option<DataReader>,
}

/// Purges a consumed one-shot file once its reader is dropped, whether or not
/// the transfer completed.
struct PurgeOnDrop {
    inner: DataReader,
    job: Option<(Lifecycle, Upload, File)>,
}

impl AsyncRead for PurgeOnDrop {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl Drop for PurgeOnDrop {
    fn drop(&mut self) {
        let Some((lifecycle, upload, file)) = self.job.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lifecycle.purge(&upload, &file).await {
                        warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Purge after download failed");
                    }
                });
            }
            Err(_) => {
                warn!(upload_id = %upload.id, file_id = %file.id, "No runtime left to purge downloaded file");
            }
        }
    }
}

impl Lifecycle {
    /// Serve a file.
    ///
    /// One-shot and stream files are claimed through a metadata transaction
    /// before any byte is read, so only one caller ever gets their content.
    /// Probes (`probe == true`) only check availability and claim nothing.
    pub async fn get_file(
        &self,
        upload: &Upload,
        file: &File,
        probe: bool,
    ) -> Result<Download, LifecycleError> {
        let expected = if upload.stream {
            FileStatus::Uploading
        } else {
            FileStatus::Uploaded
        };
        if file.status != expected {
            return Err(LifecycleError::NotFound(format!(
                "file {} ({}) is not available",
                file.name, file.id
            )));
        }

        if probe {
            return Ok(Download {
                file: file.clone().sanitize(),
                body: None,
            });
        }

        let backend = self.state.data_store_for(upload);
        if !upload.one_shot && !upload.stream {
            let body = backend
                .get_file(upload, file)
                .await
                .map_err(|e| not_found_or(e, file))?;
            return Ok(Download {
                file: file.clone().sanitize(),
                body: Some(body),
            });
        }

        let claimed = self.claim(upload, file, expected)?;

        if upload.stream {
            return match backend.get_file(upload, file).await {
                Ok(body) => Ok(Download {
                    file: claimed.sanitize(),
                    body: Some(body),
                }),
                Err(e) => {
                    // Nobody can read it anymore, release the uploader.
                    if let Err(cancel) = backend.remove_file(upload, file).await {
                        warn!(upload_id = %upload.id, file_id = %file.id, error = %cancel, "Failed to cancel stream");
                    }
                    Err(not_found_or(e, file))
                }
            };
        }

        match backend.get_file(upload, file).await {
            Ok(inner) => Ok(Download {
                file: claimed.clone().sanitize(),
                body: Some(Box::pin(PurgeOnDrop {
                    inner,
                    job: Some((self.clone(), upload.clone(), claimed)),
                })),
            }),
            Err(e) => {
                warn!(upload_id = %upload.id, file_id = %file.id, error = %e, "Failed to read one-shot file");
                if let Err(purge) = self.purge(upload, &claimed).await {
                    warn!(upload_id = %upload.id, file_id = %file.id, error = %purge, "Purge failed");
                }
                Err(not_found_or(e, file))
            }
        }
    }

    /// `uploaded -> removed` (one-shot) or `uploading -> deleted` (stream).
    /// Exactly one concurrent caller wins.
    fn claim(
        &self,
        upload: &Upload,
        file: &File,
        expected: FileStatus,
    ) -> Result<File, LifecycleError> {
        let next = if upload.stream {
            FileStatus::Deleted
        } else {
            FileStatus::Removed
        };

        let claimed = self
            .state
            .metadata
            .update_file(&upload.id, &file.id, &mut |f| {
                if f.status != expected {
                    return Err(TxError::Gone(format!(
                        "file {} ({}) has already been downloaded",
                        f.name, f.id
                    )));
                }
                f.transition(expected, next)
            })
            .inspect_err(|e| {
                debug!(upload_id = %upload.id, file_id = %file.id, error = %e, "Lost download race");
            })?;

        debug!(upload_id = %upload.id, file_id = %file.id, status = %claimed.status, "File claimed");
        Ok(claimed)
    }
}

fn not_found_or(e: DataStoreError, file: &File) -> LifecycleError {
    match e {
        DataStoreError::NotFound(_) => LifecycleError::NotFound(format!(
            "file {} ({}) not found",
            file.name, file.id
        )),
        other => LifecycleError::Data(other),
    }
}
