use redb::{Database as RedbDatabase, ReadTransaction, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::TxError;
use super::tables::*;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("upload {0} already exists")]
    UploadExists(String),
    #[error("upload {0} not found")]
    UploadNotFound(String),
    #[error("file {0} already exists")]
    FileExists(String),
    #[error("file {0} not found")]
    FileNotFound(String),
    #[error("maximum number of files per upload reached, limit is {0}")]
    TooManyFiles(usize),
    #[error("transaction rejected: {0}")]
    Rejected(#[from] TxError),
    #[error("metadata commit failed: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("metadata database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("unable to open metadata database: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("corrupted metadata record: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("metadata I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to encode metadata record: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("metadata storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("metadata table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("metadata transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
}

/// redb errors are large, keep `MetadataError` small by boxing them.
macro_rules! boxed_redb_errors {
    ($($source:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<redb::$source> for MetadataError {
                fn from(e: redb::$source) -> Self {
                    MetadataError::$variant(Box::new(e))
                }
            }
        )*
    };
}

boxed_redb_errors! {
    CommitError => Commit,
    DatabaseError => RedbDatabase,
    Error => Redb,
    StorageError => Storage,
    TableError => Table,
    TransactionError => Transaction,
}

/// redb-backed metadata store.
///
/// redb serializes write transactions, so every load-mutate-store sequence
/// performed inside one write transaction is atomic with respect to all others.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, MetadataError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("file-share.redb");
        let db = Arc::new(RedbDatabase::create(db_path)?);

        // Create missing tables up front so read transactions never fail on them.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(UPLOADS)?;
            let _ = write_txn.open_table(FILES)?;
            let _ = write_txn.open_table(EXPIRATIONS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Begin a read transaction
    pub fn begin_read(&self) -> Result<ReadTransaction, MetadataError> {
        Ok(self.db.begin_read()?)
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> Result<WriteTransaction, MetadataError> {
        Ok(self.db.begin_write()?)
    }

    /// Commit `write_txn` if `result` is a success, abort it otherwise.
    pub(crate) fn finish<T>(
        write_txn: WriteTransaction,
        result: Result<T, MetadataError>,
    ) -> Result<T, MetadataError> {
        match result {
            Ok(value) => {
                write_txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                write_txn.abort()?;
                Err(e)
            }
        }
    }
}
