//! file-share - A temporary file sharing service
//!
//! Clients group files into uploads that carry an access policy:
//! - Expiration after a TTL, enforced by a periodic sweeper
//! - One-shot files, deleted after the first download
//! - Stream uploads, relayed from uploader to downloader without storage
//! - Removable uploads and password protection
//!
//! Metadata lives in a redb embedded database, file content in a swappable
//! data store (local filesystem or GCS).

pub mod api;
pub mod config;
pub mod data;
pub mod ingest;
pub mod lifecycle;
pub mod pipe;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use data::DataStore;
use storage::models::Upload;
use storage::MetadataStore;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub metadata: Arc<dyn MetadataStore>,
    /// Backend holding the content of regular uploads
    pub data: Arc<dyn DataStore>,
    /// Backend relaying stream uploads
    pub stream: Arc<dyn DataStore>,
}

impl AppState {
    /// Data store responsible for the files of `upload`.
    pub fn data_store_for(&self, upload: &Upload) -> &Arc<dyn DataStore> {
        if upload.stream {
            &self.stream
        } else {
            &self.data
        }
    }
}
