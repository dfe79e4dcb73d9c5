use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;

use super::db::{Database, MetadataError};
use super::models::{File, FileStatus, Upload};
use super::tables::*;
use super::{MetadataStore, Tx};

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetadataError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// All files of an upload, in key order.
fn files_in<T>(table: &T, upload_id: &str) -> Result<Vec<File>, MetadataError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let (start, end) = file_range(upload_id);
    let mut files = Vec::new();
    for entry in table.range::<&str>(start.as_str()..end.as_str())? {
        let (_, value) = entry?;
        files.push(decode(value.value())?);
    }
    Ok(files)
}

fn read_upload(txn: &WriteTransaction, id: &str) -> Result<Option<Upload>, MetadataError> {
    let uploads = txn.open_table(UPLOADS)?;
    let upload = uploads.get(id)?.map(|data| decode(data.value())).transpose()?;
    Ok(upload)
}

fn insert_upload(
    txn: &WriteTransaction,
    upload: &Upload,
    files: &[File],
) -> Result<(), MetadataError> {
    if read_upload(txn, &upload.id)?.is_some() {
        return Err(MetadataError::UploadExists(upload.id.clone()));
    }

    {
        let mut uploads = txn.open_table(UPLOADS)?;
        let data = rmp_serde::to_vec_named(upload)?;
        uploads.insert(upload.id.as_str(), data.as_slice())?;
    }

    if let Some(expires) = upload.expires_at() {
        let mut expirations = txn.open_table(EXPIRATIONS)?;
        let key = expiration_key(expires.timestamp(), &upload.id);
        expirations.insert(key.as_str(), upload.id.as_str())?;
    }

    let mut table = txn.open_table(FILES)?;
    for file in files {
        debug_assert_eq!(file.upload_id, upload.id, "file must belong to the upload");
        let data = rmp_serde::to_vec_named(file)?;
        table.insert(file_key(&upload.id, &file.id).as_str(), data.as_slice())?;
    }
    Ok(())
}

fn delete_upload_records(txn: &WriteTransaction, id: &str) -> Result<bool, MetadataError> {
    let upload = match read_upload(txn, id)? {
        Some(upload) => upload,
        None => return Ok(false),
    };

    {
        let mut uploads = txn.open_table(UPLOADS)?;
        uploads.remove(id)?;
    }

    if let Some(expires) = upload.expires_at() {
        let mut expirations = txn.open_table(EXPIRATIONS)?;
        expirations.remove(expiration_key(expires.timestamp(), id).as_str())?;
    }

    let mut table = txn.open_table(FILES)?;
    let keys: Vec<String> = {
        let (start, end) = file_range(id);
        let keys = table
            .range::<&str>(start.as_str()..end.as_str())?
            .map(|r| r.map(|(k, _)| k.value().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        keys
    };
    for key in keys {
        table.remove(key.as_str())?;
    }
    Ok(true)
}

fn apply_upload_tx(
    txn: &WriteTransaction,
    id: &str,
    tx: Tx<'_, Upload>,
) -> Result<Upload, MetadataError> {
    let mut upload =
        read_upload(txn, id)?.ok_or_else(|| MetadataError::UploadNotFound(id.to_string()))?;
    let previous_expiration = upload.expires_at();

    tx(&mut upload)?;
    debug_assert_eq!(upload.id, id, "transaction must not change the upload id");

    {
        let mut uploads = txn.open_table(UPLOADS)?;
        let data = rmp_serde::to_vec_named(&upload)?;
        uploads.insert(id, data.as_slice())?;
    }

    let expiration = upload.expires_at();
    if expiration != previous_expiration {
        let mut expirations = txn.open_table(EXPIRATIONS)?;
        if let Some(old) = previous_expiration {
            expirations.remove(expiration_key(old.timestamp(), id).as_str())?;
        }
        if let Some(new) = expiration {
            expirations.insert(expiration_key(new.timestamp(), id).as_str(), id)?;
        }
    }

    Ok(upload)
}

fn insert_file(txn: &WriteTransaction, file: &File, max_files: usize) -> Result<(), MetadataError> {
    if read_upload(txn, &file.upload_id)?.is_none() {
        return Err(MetadataError::UploadNotFound(file.upload_id.clone()));
    }

    let mut table = txn.open_table(FILES)?;
    let key = file_key(&file.upload_id, &file.id);

    let count = files_in(&table, &file.upload_id)?.len();
    if count >= max_files {
        return Err(MetadataError::TooManyFiles(max_files));
    }
    if table.get(key.as_str())?.is_some() {
        return Err(MetadataError::FileExists(file.id.clone()));
    }

    let data = rmp_serde::to_vec_named(file)?;
    table.insert(key.as_str(), data.as_slice())?;
    Ok(())
}

fn apply_file_tx(
    txn: &WriteTransaction,
    upload_id: &str,
    file_id: &str,
    tx: Tx<'_, File>,
) -> Result<File, MetadataError> {
    let mut table = txn.open_table(FILES)?;
    let key = file_key(upload_id, file_id);

    let current: Option<File> = table
        .get(key.as_str())?
        .map(|data| decode(data.value()))
        .transpose()?;
    let mut file = current.ok_or_else(|| MetadataError::FileNotFound(file_id.to_string()))?;

    tx(&mut file)?;
    debug_assert_eq!(file.id, file_id, "transaction must not change the file id");

    let data = rmp_serde::to_vec_named(&file)?;
    table.insert(key.as_str(), data.as_slice())?;
    Ok(file)
}

fn apply_files_tx(
    txn: &WriteTransaction,
    upload_id: &str,
    tx: Tx<'_, File>,
) -> Result<Vec<File>, MetadataError> {
    if read_upload(txn, upload_id)?.is_none() {
        return Err(MetadataError::UploadNotFound(upload_id.to_string()));
    }

    let mut table = txn.open_table(FILES)?;
    let mut files = files_in(&table, upload_id)?;
    for file in files.iter_mut() {
        tx(file)?;
    }
    for file in &files {
        let data = rmp_serde::to_vec_named(file)?;
        table.insert(file_key(upload_id, &file.id).as_str(), data.as_slice())?;
    }
    Ok(files)
}

fn remove_if_empty(txn: &WriteTransaction, id: &str) -> Result<bool, MetadataError> {
    let all_deleted = {
        let table = txn.open_table(FILES)?;
        let files = files_in(&table, id)?;
        files.iter().all(|f| f.status == FileStatus::Deleted)
    };
    if !all_deleted {
        return Ok(false);
    }
    delete_upload_records(txn, id)
}

impl MetadataStore for Database {
    fn create_upload(&self, upload: &Upload, files: &[File]) -> Result<(), MetadataError> {
        debug_assert!(!upload.id.is_empty(), "upload id must not be empty");

        let write_txn = self.begin_write()?;
        let result = insert_upload(&write_txn, upload, files);
        Database::finish(write_txn, result)
    }

    fn get_upload(&self, id: &str) -> Result<Option<Upload>, MetadataError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(UPLOADS)?;

        let upload = table.get(id)?.map(|data| decode(data.value())).transpose()?;
        Ok(upload)
    }

    fn update_upload(&self, id: &str, tx: Tx<'_, Upload>) -> Result<Upload, MetadataError> {
        let write_txn = self.begin_write()?;
        let result = apply_upload_tx(&write_txn, id, tx);
        Database::finish(write_txn, result)
    }

    fn remove_upload(&self, id: &str) -> Result<bool, MetadataError> {
        let write_txn = self.begin_write()?;
        let result = delete_upload_records(&write_txn, id);
        Database::finish(write_txn, result)
    }

    fn remove_upload_if_empty(&self, id: &str) -> Result<bool, MetadataError> {
        let write_txn = self.begin_write()?;
        let result = remove_if_empty(&write_txn, id);
        Database::finish(write_txn, result)
    }

    fn get_uploads_to_remove(&self, now: DateTime<Utc>) -> Result<Vec<String>, MetadataError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(EXPIRATIONS)?;

        let bound = expiration_bound(now.timestamp());
        let mut ids = Vec::new();
        for entry in table.range::<&str>(..bound.as_str())? {
            let (_, value) = entry?;
            ids.push(value.value().to_string());
        }
        Ok(ids)
    }

    fn create_file(&self, file: &File, max_files: usize) -> Result<(), MetadataError> {
        debug_assert!(!file.id.is_empty(), "file id must not be empty");

        let write_txn = self.begin_write()?;
        let result = insert_file(&write_txn, file, max_files);
        Database::finish(write_txn, result)
    }

    fn get_file(&self, upload_id: &str, file_id: &str) -> Result<Option<File>, MetadataError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let file = table
            .get(file_key(upload_id, file_id).as_str())?
            .map(|data| decode(data.value()))
            .transpose()?;
        Ok(file)
    }

    fn get_files(&self, upload_id: &str) -> Result<Vec<File>, MetadataError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;
        files_in(&table, upload_id)
    }

    fn update_file(
        &self,
        upload_id: &str,
        file_id: &str,
        tx: Tx<'_, File>,
    ) -> Result<File, MetadataError> {
        let write_txn = self.begin_write()?;
        let result = apply_file_tx(&write_txn, upload_id, file_id, tx);
        Database::finish(write_txn, result)
    }

    fn update_files(&self, upload_id: &str, tx: Tx<'_, File>) -> Result<Vec<File>, MetadataError> {
        let write_txn = self.begin_write()?;
        let result = apply_files_tx(&write_txn, upload_id, tx);
        Database::finish(write_txn, result)
    }
}
