use redb::TableDefinition;

/// Upload records: upload id -> Upload (msgpack)
pub const UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("uploads");

/// File records: "{upload_id}/{file_id}" -> File (msgpack).
/// Files of one upload are contiguous and found with a prefix range scan.
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Expiration index: "{expire_timestamp:020}/{upload_id}" -> upload id
pub const EXPIRATIONS: TableDefinition<&str, &str> = TableDefinition::new("expirations");

pub(crate) fn file_key(upload_id: &str, file_id: &str) -> String {
    format!("{upload_id}/{file_id}")
}

/// Half-open key range covering every file of an upload.
pub(crate) fn file_range(upload_id: &str) -> (String, String) {
    // '0' is the byte right after '/'
    (format!("{upload_id}/"), format!("{upload_id}0"))
}

pub(crate) fn expiration_key(timestamp: i64, upload_id: &str) -> String {
    format!("{timestamp:020}/{upload_id}")
}

/// Exclusive upper bound matching every expiration at or before `timestamp`.
pub(crate) fn expiration_bound(timestamp: i64) -> String {
    format!("{timestamp:020}0")
}
