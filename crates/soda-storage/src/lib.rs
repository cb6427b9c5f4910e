//! Blob storage + HTTP fetch utilities for the complaint ingest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "soda-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Gcs {
        bucket: String,
        service_account_path: Option<PathBuf>,
    },
    Local {
        root: PathBuf,
    },
    Memory,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object path {key:?}: {source}")]
    InvalidPath {
        key: String,
        #[source]
        source: object_store::path::Error,
    },
    #[error("object name {0:?} resolves to an empty key")]
    EmptyKey(String),
    #[error("object uri {uri} does not belong to bucket {bucket}")]
    BucketMismatch { uri: String, bucket: String },
    #[error("{op} {key} failed: {source}")]
    Backend {
        op: &'static str,
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("preparing local storage root {path}: {source}")]
    LocalRoot {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("building storage backend: {0}")]
    Build(#[source] object_store::Error),
}

/// Resolve a configured object name to a key inside `bucket`.
///
/// Accepts a plain key (`complaints/data.parquet`) or a `gs://<bucket>/<key>` URI.
pub fn object_key(raw: &str, bucket: &str) -> Result<ObjectPath, StorageError> {
    let key = match raw.strip_prefix("gs://") {
        Some(rest) => {
            let (uri_bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if uri_bucket != bucket {
                return Err(StorageError::BucketMismatch {
                    uri: raw.to_string(),
                    bucket: bucket.to_string(),
                });
            }
            key
        }
        None => raw,
    };
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(StorageError::EmptyKey(raw.to_string()));
    }
    ObjectPath::parse(key).map_err(|source| StorageError::InvalidPath {
        key: raw.to_string(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: ObjectPath,
    pub sha256: String,
    pub byte_size: usize,
}

/// Whole-object reads and writes against a single bucket.
#[derive(Debug, Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn from_backend(backend: &StorageBackend) -> Result<Self, StorageError> {
        match backend {
            StorageBackend::Gcs {
                bucket,
                service_account_path,
            } => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                if let Some(path) = service_account_path {
                    builder = builder.with_service_account_path(path.to_string_lossy());
                }
                let store = builder.build().map_err(StorageError::Build)?;
                Ok(Self::new(Arc::new(store)))
            }
            StorageBackend::Local { root } => {
                std::fs::create_dir_all(root).map_err(|source| StorageError::LocalRoot {
                    path: root.display().to_string(),
                    source,
                })?;
                let store = LocalFileSystem::new_with_prefix(root).map_err(StorageError::Build)?;
                Ok(Self::new(Arc::new(store)))
            }
            StorageBackend::Memory => Ok(Self::in_memory()),
        }
    }

    /// Read an object in full; `None` when it does not exist.
    pub async fn get(&self, key: &ObjectPath) -> Result<Option<Bytes>, StorageError> {
        let result = match self.store.get(key).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => {
                return Err(StorageError::Backend {
                    op: "get",
                    key: key.to_string(),
                    source,
                })
            }
        };
        let bytes = result.bytes().await.map_err(|source| StorageError::Backend {
            op: "read",
            key: key.to_string(),
            source,
        })?;
        debug!(%key, bytes = bytes.len(), "read object");
        Ok(Some(bytes))
    }

    /// Replace an object in a single put; readers see either the old or the new bytes.
    pub async fn put(&self, key: &ObjectPath, bytes: Bytes) -> Result<StoredObject, StorageError> {
        let sha256 = sha256_hex(&bytes);
        let byte_size = bytes.len();
        self.store
            .put(key, PutPayload::from(bytes))
            .await
            .map_err(|source| StorageError::Backend {
                op: "put",
                key: key.to_string(),
                source,
            })?;
        debug!(%key, bytes = byte_size, %sha256, "wrote object");
        Ok(StoredObject {
            key: key.clone(),
            sha256,
            byte_size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Sent on every request; values are marked sensitive so they stay out of debug output.
    pub default_headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let mut value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` parameters, retrying transient failures per the backoff policy.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retry(url, query).instrument(span).await
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, status = status.as_u16(), ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, error = %err, ?delay, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
            }),
        }
    }
}
