use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio_util::io::ReaderStream;

use super::{check_key, object_key, DataReader, DataStore, DataStoreError};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::storage::models::{BackendDetails, File, Upload};

struct Pending {
    generation: u64,
    reader: PipeReader,
    taken: oneshot::Sender<()>,
}

/// How long a downloader waits for the uploader to show up.
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Relays an uploader's bytes straight to a single downloader. Nothing is stored.
///
/// `add_file` registers a pipe under the file's key and blocks until a
/// downloader has taken it and every byte went through. `get_file` takes the
/// pipe out of the registry, so each stream can be read exactly once.
pub struct StreamStore {
    pending: Mutex<HashMap<String, Pending>>,
    registered: Notify,
    generations: AtomicU64,
    handoff_timeout: Duration,
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::with_handoff_timeout(HANDOFF_TIMEOUT)
    }
}

/// Unregisters a pipe when the uploading side goes away.
struct Registration<'a> {
    store: &'a StreamStore,
    key: String,
    generation: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.store.pending.lock() {
            if pending.get(&self.key).map(|p| p.generation) == Some(self.generation) {
                pending.remove(&self.key);
            }
        }
    }
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handoff_timeout(handoff_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            registered: Notify::new(),
            generations: AtomicU64::new(0),
            handoff_timeout,
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<String, Pending>>, DataStoreError> {
        self.pending
            .lock()
            .map_err(|_| DataStoreError::Backend("stream registry poisoned".to_string()))
    }

    /// Whether an uploader is currently waiting for a downloader on this file.
    pub fn is_waiting(&self, upload: &Upload, file: &File) -> bool {
        match (object_key(upload, file), self.registry()) {
            (Ok(key), Ok(pending)) => pending.contains_key(&key),
            _ => false,
        }
    }
}

async fn relay(reader: DataReader, writer: PipeWriter) -> std::io::Result<()> {
    let mut chunks = ReaderStream::new(reader);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => writer.send(chunk).await?,
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                writer.fail(e);
                return Err(std::io::Error::new(kind, message));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DataStore for StreamStore {
    async fn add_file(
        &self,
        upload: &Upload,
        file: &File,
        reader: DataReader,
    ) -> Result<BackendDetails, DataStoreError> {
        let key = object_key(upload, file)?;
        let (writer, downstream) = pipe(1);
        let (taken_tx, taken_rx) = oneshot::channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.registry()?;
            if pending.contains_key(&key) {
                return Err(DataStoreError::Backend(format!("{key} is already streaming")));
            }
            pending.insert(
                key.clone(),
                Pending {
                    generation,
                    reader: downstream,
                    taken: taken_tx,
                },
            );
        }
        self.registered.notify_waiters();
        let _registration = Registration {
            store: self,
            key: key.clone(),
            generation,
        };

        relay(reader, writer).await?;
        taken_rx.await.map_err(|_| {
            DataStoreError::Backend(format!("{key} was cancelled before being downloaded"))
        })?;

        tracing::debug!(key = %key, "Stream delivered");
        Ok(BackendDetails::new())
    }

    async fn get_file(&self, upload: &Upload, file: &File) -> Result<DataReader, DataStoreError> {
        let key = object_key(upload, file)?;
        let deadline = tokio::time::Instant::now() + self.handoff_timeout;

        // The downloader may win the metadata race before the uploader registers.
        loop {
            let registered = self.registered.notified();
            let taken = self.registry()?.remove(&key);
            if let Some(pending) = taken {
                // The uploader may be gone already, the pipe then reports it.
                let _ = pending.taken.send(());
                return Ok(Box::pin(pending.reader));
            }
            if tokio::time::timeout_at(deadline, registered).await.is_err() {
                return Err(DataStoreError::NotFound(key));
            }
        }
    }

    async fn remove_file(&self, upload: &Upload, file: &File) -> Result<(), DataStoreError> {
        let key = object_key(upload, file)?;
        self.registry()?.remove(&key);
        Ok(())
    }

    async fn remove_upload(&self, upload: &Upload) -> Result<(), DataStoreError> {
        let prefix = format!("{}/", check_key(&upload.id)?);
        self.registry()?.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
