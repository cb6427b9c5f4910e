//! Environment-driven ingest configuration, validated eagerly.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use object_store::path::Path as ObjectPath;
use soda_source::{SocrataConfig, DEFAULT_DELTA_LIMIT};
use soda_storage::{object_key, BackoffPolicy, StorageBackend};
use thiserror::Error;

/// Variables every run needs; all of them are reported when several are absent.
pub const REQUIRED_VARS: [&str; 7] = [
    "DOMAIN",
    "DATASET",
    "APP_TOKEN",
    "PROJECT_NAME",
    "BUCKET_NAME",
    "METADATA_NAME",
    "DATA_PATH",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// How fetched rows are combined with the stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Skip fetched rows whose `unique_key` is already stored.
    #[default]
    Dedup,
    /// Prepend every fetched row, even when already stored.
    Append,
}

impl FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dedup" => Ok(Self::Dedup),
            "append" => Ok(Self::Append),
            other => Err(format!("expected dedup or append, got {other}")),
        }
    }
}

#[derive(Clone)]
pub struct IngestConfig {
    pub domain: String,
    pub dataset: String,
    pub app_token: String,
    pub project_name: String,
    pub bucket_name: String,
    pub metadata_name: String,
    pub data_path: String,
    pub storage: StorageBackend,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub fetch_limit: usize,
    pub merge_mode: MergeMode,
    pub ingest_cron: String,
    metadata_key: ObjectPath,
    snapshot_key: ObjectPath,
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("domain", &self.domain)
            .field("dataset", &self.dataset)
            .field("app_token", &"<redacted>")
            .field("project_name", &self.project_name)
            .field("bucket_name", &self.bucket_name)
            .field("metadata_name", &self.metadata_name)
            .field("data_path", &self.data_path)
            .field("storage", &self.storage)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("fetch_limit", &self.fetch_limit)
            .field("merge_mode", &self.merge_mode)
            .field("ingest_cron", &self.ingest_cron)
            .finish()
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<&'static str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &str| get(key).unwrap_or_default();

        let bucket_name = required("BUCKET_NAME");
        let metadata_name = required("METADATA_NAME");
        let data_path = required("DATA_PATH");

        let metadata_key =
            object_key(&metadata_name, &bucket_name).map_err(|err| ConfigError::Invalid {
                var: "METADATA_NAME",
                value: metadata_name.clone(),
                reason: err.to_string(),
            })?;
        let snapshot_key =
            object_key(&data_path, &bucket_name).map_err(|err| ConfigError::Invalid {
                var: "DATA_PATH",
                value: data_path.clone(),
                reason: err.to_string(),
            })?;

        let storage = match get("STORAGE_BACKEND").as_deref().unwrap_or("gcs") {
            "gcs" => StorageBackend::Gcs {
                bucket: bucket_name.clone(),
                service_account_path: get("GOOGLE_SERVICE_ACCOUNT_PATH").map(PathBuf::from),
            },
            "local" => StorageBackend::Local {
                root: get("LOCAL_STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data"))
                    .join(&bucket_name),
            },
            "memory" => StorageBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected gcs, local or memory".to_string(),
                })
            }
        };

        let http_timeout_secs = parse_or("HTTP_TIMEOUT_SECS", get("HTTP_TIMEOUT_SECS"), 60u64)?;
        let fetch_limit = parse_or("FETCH_LIMIT", get("FETCH_LIMIT"), DEFAULT_DELTA_LIMIT)?;
        if fetch_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "FETCH_LIMIT",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let merge_mode = parse_or("MERGE_MODE", get("MERGE_MODE"), MergeMode::default())?;

        Ok(Self {
            domain: required("DOMAIN"),
            dataset: required("DATASET"),
            app_token: required("APP_TOKEN"),
            project_name: required("PROJECT_NAME"),
            bucket_name,
            metadata_name,
            data_path,
            storage,
            http_timeout_secs,
            user_agent: get("SODA_USER_AGENT").unwrap_or_else(|| "soda-ingest/0.1".to_string()),
            fetch_limit,
            merge_mode,
            ingest_cron: get("INGEST_CRON").unwrap_or_else(|| "0 */15 * * * *".to_string()),
            metadata_key,
            snapshot_key,
        })
    }

    pub fn metadata_key(&self) -> &ObjectPath {
        &self.metadata_key
    }

    pub fn snapshot_key(&self) -> &ObjectPath {
        &self.snapshot_key
    }

    pub fn socrata(&self) -> SocrataConfig {
        SocrataConfig {
            domain: self.domain.clone(),
            dataset: self.dataset.clone(),
            app_token: self.app_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn parse_or<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}
