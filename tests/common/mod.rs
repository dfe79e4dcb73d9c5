#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncReadExt;

use file_share::config::{Config, StorageConfig};
use file_share::data::{DataReader, DataStore, DataStoreError, LocalStore, StreamStore};
use file_share::lifecycle::{FilePart, Lifecycle};
use file_share::storage::models::{BackendDetails, File, Upload};
use file_share::storage::Database;
use file_share::AppState;

/// Counts calls to `remove_file` on top of a local store. Writes can be made
/// to fail without reading anything.
pub struct CountingStore {
    inner: LocalStore,
    pub removals: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl CountingStore {
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataStore for CountingStore {
    async fn add_file(
        &self,
        upload: &Upload,
        file: &File,
        reader: DataReader,
    ) -> Result<BackendDetails, DataStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            drop(reader);
            return Err(DataStoreError::Backend("disk full".to_string()));
        }
        self.inner.add_file(upload, file, reader).await
    }

    async fn get_file(&self, upload: &Upload, file: &File) -> Result<DataReader, DataStoreError> {
        self.inner.get_file(upload, file).await
    }

    async fn remove_file(&self, upload: &Upload, file: &File) -> Result<(), DataStoreError> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_file(upload, file).await
    }

    async fn remove_upload(&self, upload: &Upload) -> Result<(), DataStoreError> {
        self.inner.remove_upload(upload).await
    }
}

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub lifecycle: Lifecycle,
    pub store: Arc<CountingStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let files_dir = dir.path().join("files");

        let mut config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            storage: StorageConfig {
                local_storage_path: files_dir.to_string_lossy().to_string(),
                ..StorageConfig::default()
            },
            cleaning_interval_secs: 0,
            ..Config::default()
        };
        config.limits.max_file_size = 1024 * 1024;
        tweak(&mut config);

        let store = Arc::new(CountingStore {
            inner: LocalStore::new(&files_dir).unwrap(),
            removals: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        });
        let state = Arc::new(AppState {
            config,
            metadata: Arc::new(Database::open(&data_dir).unwrap()),
            data: Arc::clone(&store) as Arc<dyn DataStore>,
            stream: Arc::new(StreamStore::with_handoff_timeout(Duration::from_secs(2))),
        });

        Self {
            dir,
            lifecycle: Lifecycle::new(state),
            store,
        }
    }

    pub fn files_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("files")
    }
}

pub fn body(data: &[u8]) -> impl Stream<Item = Result<Bytes, io::Error>> {
    futures::stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
}

pub fn part(name: &str, data: &[u8]) -> FilePart<impl Stream<Item = Result<Bytes, io::Error>>> {
    FilePart {
        name: Some(name.to_string()),
        body: body(data),
    }
}

pub async fn read_all(mut reader: DataReader) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}
