//! Shared test helpers for in-crate tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, StorageConfig};
use crate::data::{LocalStore, StreamStore};
use crate::storage::Database;
use crate::AppState;

/// Create a test AppState with a temporary database and local data store.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(temp_dir, |_| {})
}

/// Same as [`test_state`], with a chance to adjust the configuration first.
pub fn test_state_with(
    temp_dir: &tempfile::TempDir,
    tweak: impl FnOnce(&mut Config),
) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let files_dir = temp_dir.path().join("files");

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
    config.limits.max_file_size = 10 * 1024 * 1024; // 10MB for tests
    tweak(&mut config);

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let data = LocalStore::new(&files_dir).expect("Failed to create test data store");
    let stream = StreamStore::with_handoff_timeout(Duration::from_secs(2));

    Arc::new(AppState {
        config,
        metadata: Arc::new(db),
        data: Arc::new(data),
        stream: Arc::new(stream),
    })
}
