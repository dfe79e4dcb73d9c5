use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{check_key, DataReader, DataStore, DataStoreError};
use crate::storage::models::{BackendDetails, File, Upload};

/// Local filesystem data store. Files live at `{base}/{upload_id}/{data_key}`.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, DataStoreError> {
        Ok(self.base_path.join(check_key(upload_id)?))
    }

    fn file_path(&self, upload: &Upload, file: &File) -> Result<PathBuf, DataStoreError> {
        Ok(self.upload_dir(&upload.id)?.join(check_key(&file.data_key())?))
    }

    async fn write(&self, path: &Path, mut reader: DataReader) -> std::io::Result<()> {
        let mut out = tokio::fs::File::create(path).await?;
        tokio::io::copy(&mut reader, &mut out).await?;
        out.flush().await?;
        out.sync_all().await
    }
}

#[async_trait]
impl DataStore for LocalStore {
    async fn add_file(
        &self,
        upload: &Upload,
        file: &File,
        reader: DataReader,
    ) -> Result<BackendDetails, DataStoreError> {
        let dir = self.upload_dir(&upload.id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.file_path(upload, file)?;

        if let Err(e) = self.write(&path, reader).await {
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %cleanup, "Failed to remove partial file");
            }
            return Err(e.into());
        }

        let mut details = BackendDetails::new();
        details.insert(
            "path".to_string(),
            serde_json::Value::String(path.display().to_string()),
        );
        Ok(details)
    }

    async fn get_file(&self, upload: &Upload, file: &File) -> Result<DataReader, DataStoreError> {
        let path = self.file_path(upload, file)?;
        match tokio::fs::File::open(&path).await {
            Ok(f) => Ok(Box::pin(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(DataStoreError::NotFound(format!("{}/{}", upload.id, file.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, upload: &Upload, file: &File) -> Result<(), DataStoreError> {
        let path = self.file_path(upload, file)?;
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn remove_upload(&self, upload: &Upload) -> Result<(), DataStoreError> {
        let dir = self.upload_dir(&upload.id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
