use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use futures::TryStreamExt;
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::io::{ReaderStream, StreamReader};

use super::{check_key, object_key, DataReader, DataStore, DataStoreError};
use crate::storage::models::{BackendDetails, File, Upload};

const STORAGE_API: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Tokens are renewed this long before Google says they expire.
const TOKEN_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

enum TokenSource {
    ServiceAccount(ServiceAccountKey),
    /// Credentials of the GCE/GKE/Cloud Run instance.
    MetadataServer,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    renew_at: Instant,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectItem {
    name: String,
}

/// Google Cloud Storage data store. Objects are named `{upload_id}/{data_key}`
/// and streamed in both directions, never buffered whole.
pub struct GcsStore {
    bucket: String,
    client: Client,
    source: TokenSource,
    token: RwLock<Option<CachedToken>>,
}

impl GcsStore {
    /// Without `credentials_file` the metadata server provides tokens.
    /// A first token is fetched so bad credentials fail at startup.
    pub async fn new(bucket: &str, credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let source = match credentials_file {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                TokenSource::ServiceAccount(serde_json::from_str(&raw)?)
            }
            None => TokenSource::MetadataServer,
        };

        let store = Self {
            bucket: bucket.to_string(),
            client: Client::builder().build()?,
            source,
            token: RwLock::new(None),
        };
        store.token().await?;
        Ok(store)
    }

    async fn token(&self) -> Result<String, DataStoreError> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() < cached.renew_at {
                return Ok(cached.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another request may have renewed it meanwhile.
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.renew_at {
                return Ok(cached.value.clone());
            }
        }

        let fresh = self
            .fetch_token()
            .await
            .map_err(|e| DataStoreError::Backend(format!("GCS token refresh failed: {e}")))?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_MARGIN);
        *slot = Some(CachedToken {
            value: fresh.access_token.clone(),
            renew_at: Instant::now() + lifetime,
        });
        tracing::debug!(valid_for = ?lifetime, "GCS access token renewed");
        Ok(fresh.access_token)
    }

    async fn fetch_token(&self) -> Result<TokenResponse, anyhow::Error> {
        let request = match &self.source {
            TokenSource::ServiceAccount(key) => {
                let assertion = signed_assertion(key)?;
                self.client.post(&key.token_uri).form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
            }
            TokenSource::MetadataServer => self
                .client
                .get(METADATA_TOKEN_URL)
                .header("Metadata-Flavor", "Google"),
        };

        Ok(request.send().await?.error_for_status()?.json().await?)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{STORAGE_API}/storage/v1/b/{}/o/{}",
            self.bucket,
            encode_object_name(key)
        )
    }

    async fn delete_object(&self, key: &str) -> Result<(), DataStoreError> {
        let resp = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(transport)?;

        // Already gone.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(failure("delete", resp).await);
        }
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, DataStoreError> {
        let url = format!("{STORAGE_API}/storage/v1/b/{}/o", self.bucket);
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("prefix", prefix.to_string()),
                ("fields", "items(name),nextPageToken".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let resp = self
                .client
                .get(&url)
                .bearer_auth(self.token().await?)
                .query(&query)
                .send()
                .await
                .map_err(transport)?;
            if !resp.status().is_success() {
                return Err(failure("list", resp).await);
            }

            let page: ObjectList = resp.json().await.map_err(transport)?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(names),
            }
        }
    }
}

#[async_trait]
impl DataStore for GcsStore {
    async fn add_file(
        &self,
        upload: &Upload,
        file: &File,
        reader: DataReader,
    ) -> Result<BackendDetails, DataStoreError> {
        let key = object_key(upload, file)?;
        let url = format!("{STORAGE_API}/upload/storage/v1/b/{}/o", self.bucket);

        let resp = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", key.as_str())])
            .bearer_auth(self.token().await?)
            .header("Content-Type", "application/octet-stream")
            .body(Body::wrap_stream(ReaderStream::new(reader)))
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(failure("upload", resp).await);
        }

        let mut details = BackendDetails::new();
        details.insert("bucket".to_string(), Value::String(self.bucket.clone()));
        details.insert("object".to_string(), Value::String(key));
        Ok(details)
    }

    async fn get_file(&self, upload: &Upload, file: &File) -> Result<DataReader, DataStoreError> {
        let key = object_key(upload, file)?;

        let resp = self
            .client
            .get(self.object_url(&key))
            .query(&[("alt", "media")])
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(DataStoreError::NotFound(key));
        }
        if !resp.status().is_success() {
            return Err(failure("download", resp).await);
        }

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }

    async fn remove_file(&self, upload: &Upload, file: &File) -> Result<(), DataStoreError> {
        self.delete_object(&object_key(upload, file)?).await
    }

    async fn remove_upload(&self, upload: &Upload) -> Result<(), DataStoreError> {
        let prefix = format!("{}/", check_key(&upload.id)?);
        for name in self.list_objects(&prefix).await? {
            self.delete_object(&name).await?;
        }
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> DataStoreError {
    DataStoreError::Backend(format!("GCS request failed: {e}"))
}

async fn failure(operation: &str, resp: reqwest::Response) -> DataStoreError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    DataStoreError::Backend(format!("GCS {operation} failed ({status}): {body}"))
}

/// Object names go in a single path segment, so `/` must be escaped.
fn encode_object_name(name: &str) -> String {
    name.replace('/', "%2F")
}

/// JWT bearer assertion exchanged for an access token.
fn signed_assertion(key: &ServiceAccountKey) -> Result<String, anyhow::Error> {
    let now = chrono::Utc::now().timestamp();
    let header = json!({ "alg": "RS256", "typ": "JWT" });
    let claims = json!({
        "iss": key.client_email,
        "scope": SCOPE,
        "aud": key.token_uri,
        "iat": now,
        "exp": now + 3600,
    });

    let unsigned = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );
    let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
    Ok(format!("{unsigned}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

/// RSASSA-PKCS1-v1_5 with SHA-256 over `data`, using a PKCS#8 PEM key.
fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    let body: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = STANDARD.decode(body)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("invalid service account key: {e}"))?;
    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("signing failed: {e}"))?;
    Ok(signature)
}
