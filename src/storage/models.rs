use std::collections::HashMap;
use std::fmt;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque data-store bookkeeping attached to a file. Never sent to clients.
pub type BackendDetails = HashMap<String, serde_json::Value>;

/// Maximum file name length, in characters.
pub const MAX_FILE_NAME_LENGTH: usize = 1024;

/// Login stored with password protected uploads when the client sends none.
pub const DEFAULT_LOGIN: &str = "share";

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Error returned by a transaction closure to abort the update.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    /// The record is not in the state the caller expected.
    #[error("{0}")]
    Conflict(String),
    /// The record no longer exists or can no longer be served.
    #[error("{0}")]
    Gone(String),
}

/// Lifecycle of a single file.
///
/// ```text
/// missing -> uploading -> uploaded -> removed -> deleted
///                      \-> deleted (stream)
/// ```
///
/// `missing` and `uploading` files may additionally be marked `removed` when
/// their upload is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Missing,
    Uploading,
    Uploaded,
    Removed,
    Deleted,
}

impl FileStatus {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_become(self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Missing, Uploading)
                | (Missing, Removed)
                | (Uploading, Uploaded)
                | (Uploading, Deleted)
                | (Uploading, Removed)
                | (Uploaded, Removed)
                | (Removed, Deleted)
        )
    }

    /// Position in the lifecycle. Status changes never decrease it.
    pub fn rank(self) -> u8 {
        match self {
            FileStatus::Missing => 0,
            FileStatus::Uploading => 1,
            FileStatus::Uploaded => 2,
            FileStatus::Removed => 3,
            FileStatus::Deleted => 4,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::Missing => "missing",
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Removed => "removed",
            FileStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A container of files sharing one access policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Seconds. -1 means the upload never expires.
    pub ttl: i64,
    pub one_shot: bool,
    pub stream: bool,
    pub removable: bool,
    pub protected_by_password: bool,
    #[serde(default)]
    pub login: Option<String>,
    /// hex(md5(base64("login:password")))
    #[serde(default)]
    pub password_hash: Option<String>,
    pub protected_by_otp: bool,
    #[serde(default)]
    pub otp_prefix: Option<String>,
    /// Secret granting admin rights over this upload.
    pub upload_token: String,
    #[serde(default)]
    pub remote_ip: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl Upload {
    /// Build a fresh upload with a random id and upload token.
    pub fn new(ttl: i64) -> Result<Self, ring::error::Unspecified> {
        Ok(Self {
            id: random_id(16)?,
            created_at: Utc::now(),
            ttl,
            one_shot: false,
            stream: false,
            removable: false,
            protected_by_password: false,
            login: None,
            password_hash: None,
            protected_by_otp: false,
            otp_prefix: None,
            upload_token: random_id(32)?,
            remote_ip: None,
            user_id: None,
            token_id: None,
            comments: None,
        })
    }

    /// Expiration date, `None` for uploads that never expire.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl <= 0 {
            return None;
        }
        // Out of range dates are refused at creation.
        Duration::try_seconds(self.ttl).and_then(|ttl| self.created_at.checked_add_signed(ttl))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| now >= expires)
    }

    /// Protect the upload with HTTP basic credentials. Only a hash is kept.
    pub fn set_password(&mut self, login: Option<&str>, password: &str) {
        let login = login
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LOGIN)
            .to_string();
        self.password_hash = Some(credentials_hash(&basic_credentials(&login, password)));
        self.login = Some(login);
        self.protected_by_password = true;
    }

    /// Check the payload of an `Authorization: Basic <payload>` header.
    pub fn verify_basic_credentials(&self, payload: &str) -> bool {
        match &self.password_hash {
            Some(expected) => {
                let actual = credentials_hash(payload);
                // Both sides are fixed-length hex digests.
                actual.len() == expected.len()
                    && actual
                        .bytes()
                        .zip(expected.bytes())
                        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                        == 0
            }
            None => !self.protected_by_password,
        }
    }

    /// Strip everything a non-admin client must not see.
    pub fn sanitize(&mut self) {
        self.remote_ip = None;
        self.login = None;
        self.password_hash = None;
        self.upload_token = String::new();
        self.user_id = None;
        self.token_id = None;
        self.otp_prefix = None;
    }
}

/// A file belonging to an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub upload_id: String,
    pub name: String,
    pub status: FileStatus,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub upload_date: Option<DateTime<Utc>>,
    /// Set when the file enters `uploading`.
    #[serde(default)]
    pub uploading_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backend_details: BackendDetails,
}

impl File {
    /// A new file in status `missing`.
    pub fn new(upload_id: &str, name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            upload_id: upload_id.to_string(),
            name: name.into(),
            status: FileStatus::Missing,
            mime_type: "application/octet-stream".to_string(),
            size: 0,
            md5: None,
            upload_date: None,
            uploading_since: None,
            backend_details: BackendDetails::new(),
        }
    }

    /// Move from `expected` to `next`, refusing anything else.
    pub fn transition(&mut self, expected: FileStatus, next: FileStatus) -> Result<(), TxError> {
        if self.status != expected {
            return Err(TxError::Conflict(format!(
                "file {} ({}) status is {}, expected {}",
                self.name, self.id, self.status, expected
            )));
        }
        if !expected.can_become(next) {
            return Err(TxError::Conflict(format!(
                "file {} ({}) cannot go from {} to {}",
                self.name, self.id, expected, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Whether an `uploading` file has been idle for longer than `timeout`.
    pub fn is_abandoned(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == FileStatus::Uploading
            && self
                .uploading_since
                .map_or(true, |since| now - since >= timeout)
    }

    /// Data store object holding the bytes of the current upload attempt.
    ///
    /// A restarted upload gets a fresh `uploading_since`, hence a fresh object,
    /// so a stale attempt can never overwrite or discard the bytes of the
    /// attempt that replaced it.
    pub fn data_key(&self) -> String {
        match self.uploading_since {
            Some(since) => format!(
                "{}_{}{:09}",
                self.id,
                since.timestamp(),
                since.timestamp_subsec_nanos()
            ),
            None => self.id.clone(),
        }
    }

    /// Drop data-store internals before handing the file to a client.
    pub fn sanitize(mut self) -> Self {
        self.backend_details.clear();
        self
    }
}

/// `base64("login:password")`, the payload of a basic `Authorization` header.
pub fn basic_credentials(login: &str, password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{login}:{password}"))
}

fn credentials_hash(payload: &str) -> String {
    hex::encode(Md5::digest(payload.as_bytes()))
}

/// Random alphanumeric identifier from the system CSPRNG.
pub fn random_id(len: usize) -> Result<String, ring::error::Unspecified> {
    // Largest multiple of the alphabet size that fits in a byte, to avoid modulo bias.
    const LIMIT: u8 = (256 / ID_ALPHABET.len() * ID_ALPHABET.len()) as u8;

    let rng = SystemRandom::new();
    let mut id = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while id.len() < len {
        rng.fill(&mut buf)?;
        for &b in buf.iter().filter(|&&b| b < LIMIT) {
            if id.len() == len {
                break;
            }
            id.push(ID_ALPHABET[b as usize % ID_ALPHABET.len()] as char);
        }
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_shape() {
        let id = random_id(16).unwrap();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, random_id(16).unwrap());
    }

    #[test]
    fn test_transition_requires_expected_status() {
        let mut file = File::new("u", "a.txt");
        assert!(file
            .transition(FileStatus::Missing, FileStatus::Uploading)
            .is_ok());
        assert_eq!(file.status, FileStatus::Uploading);

        let err = file
            .transition(FileStatus::Missing, FileStatus::Uploading)
            .unwrap_err();
        assert!(matches!(err, TxError::Conflict(_)));
        assert_eq!(file.status, FileStatus::Uploading);
    }

    #[test]
    fn test_transitions_never_go_backward() {
        let all = [
            FileStatus::Missing,
            FileStatus::Uploading,
            FileStatus::Uploaded,
            FileStatus::Removed,
            FileStatus::Deleted,
        ];
        for from in all {
            for to in all {
                if from.can_become(to) {
                    assert!(to.rank() > from.rank(), "{from} -> {to} goes backward");
                }
            }
            assert!(!FileStatus::Deleted.can_become(from));
        }
    }

    #[test]
    fn test_uploaded_cannot_be_uploaded_again() {
        let mut file = File::new("u", "a.txt");
        file.status = FileStatus::Uploaded;
        assert!(file
            .transition(FileStatus::Uploaded, FileStatus::Uploading)
            .is_err());
    }

    #[test]
    fn test_upload_expiry() {
        let mut upload = Upload::new(60).unwrap();
        let created = upload.created_at;
        assert!(!upload.is_expired(created));
        assert!(!upload.is_expired(created + Duration::seconds(59)));
        assert!(upload.is_expired(created + Duration::seconds(60)));

        upload.ttl = -1;
        assert!(upload.expires_at().is_none());
        assert!(!upload.is_expired(created + Duration::days(10_000)));

        upload.ttl = i64::MAX;
        assert!(upload.expires_at().is_none());
        assert!(!upload.is_expired(created));
    }

    #[test]
    fn test_password_is_stored_hashed() {
        let mut upload = Upload::new(60).unwrap();
        upload.set_password(None, "secret");

        assert!(upload.protected_by_password);
        assert_eq!(upload.login.as_deref(), Some(DEFAULT_LOGIN));
        let hash = upload.password_hash.clone().unwrap();
        assert!(!hash.contains("secret"));
        assert_eq!(hash.len(), 32);

        assert!(upload.verify_basic_credentials(&basic_credentials(DEFAULT_LOGIN, "secret")));
        assert!(!upload.verify_basic_credentials(&basic_credentials(DEFAULT_LOGIN, "wrong")));
        assert!(!upload.verify_basic_credentials(&basic_credentials("other", "secret")));
    }

    #[test]
    fn test_sanitize_strips_private_fields() {
        let mut upload = Upload::new(60).unwrap();
        upload.remote_ip = Some("10.0.0.1".to_string());
        upload.user_id = Some("user".to_string());
        upload.set_password(Some("me"), "pw");
        upload.sanitize();

        assert!(upload.remote_ip.is_none());
        assert!(upload.password_hash.is_none());
        assert!(upload.login.is_none());
        assert!(upload.upload_token.is_empty());
        assert!(upload.user_id.is_none());
        assert!(upload.protected_by_password);

        let mut file = File::new(&upload.id, "a.txt");
        file.backend_details
            .insert("path".to_string(), serde_json::json!("/tmp/x"));
        assert!(file.sanitize().backend_details.is_empty());
    }

    #[test]
    fn test_abandoned_uploading_file() {
        let now = Utc::now();
        let mut file = File::new("u", "a.txt");
        assert!(!file.is_abandoned(now, Duration::seconds(60)));

        file.status = FileStatus::Uploading;
        file.uploading_since = Some(now - Duration::seconds(30));
        assert!(!file.is_abandoned(now, Duration::seconds(60)));
        assert!(file.is_abandoned(now, Duration::seconds(30)));
    }
}
