//! Incremental ingest pipeline: watermark check, delta fetch, snapshot merge, watermark advance.

pub mod config;
pub mod snapshot;

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use soda_core::{
    format_floating_timestamp, normalize_batch, truncate_to_seconds, Complaint, FreshnessState,
    RecordError, Watermark,
};
use soda_source::{ComplaintSource, SocrataClient, SourceError};
use soda_storage::{BlobStore, StorageError};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, IngestConfig, MergeMode, REQUIRED_VARS};
pub use snapshot::{decode_snapshot, encode_snapshot, merge_snapshot, MergedSnapshot, SnapshotError};

pub const CRATE_NAME: &str = "soda-sync";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("watermark object {key} does not exist")]
    WatermarkMissing { key: String },
    #[error("watermark object {key}: {source}")]
    Watermark {
        key: String,
        #[source]
        source: RecordError,
    },
    #[error("watermark object {key} already exists; pass force to overwrite")]
    AlreadyInitialized { key: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("snapshot object {key}: {source}")]
    Snapshot {
        key: String,
        #[source]
        source: SnapshotError,
    },
}

/// What one invocation observed and changed.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: FreshnessState,
    pub remote_latest: Option<NaiveDateTime>,
    pub fetched: usize,
    pub appended: usize,
    pub skipped_duplicates: usize,
    pub truncated: bool,
    pub snapshot_rows: Option<usize>,
    pub snapshot_sha256: Option<String>,
    pub watermark: Watermark,
    pub watermark_written: bool,
}

impl IngestOutcome {
    /// Console line in the `Data Added: <ts>` / `No New Data: <ts>` form.
    pub fn status_line(&self) -> String {
        let stamp = format_floating_timestamp(truncate_to_seconds(self.finished_at.naive_utc()));
        if self.watermark_written {
            format!("Data Added: {stamp}")
        } else {
            format!("No New Data: {stamp}")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub metadata_key: String,
    pub snapshot_key: String,
    pub watermark: Option<Watermark>,
    pub snapshot_rows: Option<usize>,
    pub newest_in_snapshot: Option<NaiveDateTime>,
}

pub struct IngestPipeline {
    config: IngestConfig,
    source: Box<dyn ComplaintSource>,
    store: BlobStore,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let source = SocrataClient::new(config.socrata()).context("building socrata client")?;
        let store = BlobStore::from_backend(&config.storage).context("opening blob storage")?;
        Ok(Self::with_parts(config, Box::new(source), store))
    }

    pub fn with_parts(config: IngestConfig, source: Box<dyn ComplaintSource>, store: BlobStore) -> Self {
        Self {
            config,
            source,
            store,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<IngestOutcome, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest_run",
            %run_id,
            source = %self.source.describe(),
            project = %self.config.project_name,
            bucket = %self.config.bucket_name,
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<IngestOutcome, IngestError> {
        let started_at = Utc::now();
        let watermark = self.load_watermark().await?;
        let last_date = watermark.last_date().map_err(|source| self.watermark_error(source))?;

        let Some(remote_latest) = self.source.latest_created_date(run_id).await? else {
            warn!("no qualifying records at source; treating as no new data");
            return Ok(unchanged(run_id, started_at, FreshnessState::Fresh, None, watermark));
        };

        let state = watermark
            .freshness(remote_latest)
            .map_err(|source| self.watermark_error(source))?;
        if state == FreshnessState::Fresh {
            info!(last_date = %watermark.last_date, "no new data");
            return Ok(unchanged(run_id, started_at, state, Some(remote_latest), watermark));
        }

        let raw = self
            .source
            .fetch_since(run_id, last_date, self.config.fetch_limit)
            .await?;
        let fetched = raw.len();
        let truncated = fetched >= self.config.fetch_limit;
        if truncated {
            warn!(
                limit = self.config.fetch_limit,
                "delta window hit the fetch limit; older records in the window were not fetched"
            );
        }

        let fresh = normalize_batch(raw)?;
        let Some(newest) = fresh.first().map(|c| c.created_date) else {
            warn!(%remote_latest, "latest probe changed but delta fetch returned no rows");
            return Ok(unchanged(run_id, started_at, state, Some(remote_latest), watermark));
        };

        let existing = self.load_snapshot().await?.unwrap_or_default();
        let merged = merge_snapshot(fresh, existing, self.config.merge_mode);
        if merged.skipped_duplicates > 0 {
            warn!(
                skipped = merged.skipped_duplicates,
                "fetched rows already present in snapshot were skipped"
            );
        }

        let snapshot_rows = merged.rows.len();
        let snapshot_sha256 = if merged.appended > 0 {
            let bytes = encode_snapshot(&merged.rows).map_err(|source| self.snapshot_error(source))?;
            let stored = self.store.put(self.config.snapshot_key(), bytes).await?;
            info!(
                appended = merged.appended,
                rows = snapshot_rows,
                bytes = stored.byte_size,
                "snapshot written"
            );
            Some(stored.sha256)
        } else {
            None
        };

        let finished_at = Utc::now();
        let next = Watermark::new(newest, finished_at.naive_utc());
        self.store_watermark(&next).await?;
        info!(last_date = %next.last_date, last_pull = %next.last_pull, "watermark advanced");

        Ok(IngestOutcome {
            run_id,
            started_at,
            finished_at,
            state,
            remote_latest: Some(remote_latest),
            fetched,
            appended: merged.appended,
            skipped_duplicates: merged.skipped_duplicates,
            truncated,
            snapshot_rows: Some(snapshot_rows),
            snapshot_sha256,
            watermark: next,
            watermark_written: true,
        })
    }

    pub async fn load_watermark(&self) -> Result<Watermark, IngestError> {
        let key = self.config.metadata_key();
        let bytes = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| IngestError::WatermarkMissing {
                key: key.to_string(),
            })?;
        Watermark::from_json_slice(&bytes).map_err(|source| self.watermark_error(source))
    }

    /// Full snapshot contents; `None` when the object has not been created yet.
    pub async fn load_snapshot(&self) -> Result<Option<Vec<Complaint>>, IngestError> {
        let key = self.config.snapshot_key();
        match self.store.get(key).await? {
            Some(bytes) => decode_snapshot(bytes)
                .map(Some)
                .map_err(|source| self.snapshot_error(source)),
            None => {
                warn!(%key, "snapshot object missing; starting from an empty table");
                Ok(None)
            }
        }
    }

    async fn store_watermark(&self, watermark: &Watermark) -> Result<(), IngestError> {
        let bytes = watermark
            .to_json_vec()
            .map_err(|source| self.watermark_error(source))?;
        self.store
            .put(self.config.metadata_key(), Bytes::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusReport, IngestError> {
        let metadata_key = self.config.metadata_key();
        let watermark = match self.store.get(metadata_key).await? {
            Some(bytes) => Some(
                Watermark::from_json_slice(&bytes).map_err(|source| self.watermark_error(source))?,
            ),
            None => None,
        };
        let snapshot = self.load_snapshot().await?;
        Ok(StatusReport {
            metadata_key: metadata_key.to_string(),
            snapshot_key: self.config.snapshot_key().to_string(),
            watermark,
            snapshot_rows: snapshot.as_ref().map(Vec::len),
            newest_in_snapshot: snapshot
                .as_ref()
                .and_then(|rows| rows.iter().map(|c| c.created_date).max()),
        })
    }

    /// Write a starting watermark, plus an empty snapshot when none exists.
    pub async fn bootstrap(&self, last_date: NaiveDateTime, force: bool) -> Result<Watermark, IngestError> {
        let metadata_key = self.config.metadata_key();
        if !force && self.store.get(metadata_key).await?.is_some() {
            return Err(IngestError::AlreadyInitialized {
                key: metadata_key.to_string(),
            });
        }

        let snapshot_key = self.config.snapshot_key();
        if self.store.get(snapshot_key).await?.is_none() {
            let bytes = encode_snapshot(&[]).map_err(|source| self.snapshot_error(source))?;
            self.store.put(snapshot_key, bytes).await?;
            info!(%snapshot_key, "created empty snapshot");
        }

        let watermark = Watermark::new(last_date, Utc::now().naive_utc());
        self.store_watermark(&watermark).await?;
        info!(%metadata_key, last_date = %watermark.last_date, "watermark initialized");
        Ok(watermark)
    }

    fn watermark_error(&self, source: RecordError) -> IngestError {
        IngestError::Watermark {
            key: self.config.metadata_key().to_string(),
            source,
        }
    }

    fn snapshot_error(&self, source: SnapshotError) -> IngestError {
        IngestError::Snapshot {
            key: self.config.snapshot_key().to_string(),
            source,
        }
    }
}

fn unchanged(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    state: FreshnessState,
    remote_latest: Option<NaiveDateTime>,
    watermark: Watermark,
) -> IngestOutcome {
    IngestOutcome {
        run_id,
        started_at,
        finished_at: Utc::now(),
        state,
        remote_latest,
        fetched: 0,
        appended: 0,
        skipped_duplicates: 0,
        truncated: false,
        snapshot_rows: None,
        snapshot_sha256: None,
        watermark,
        watermark_written: false,
    }
}

/// Cron-driven runner; a failed run is logged and the schedule continues.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().ingest_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(outcome) => info!(
                    run_id = %outcome.run_id,
                    state = outcome.state.as_str(),
                    appended = outcome.appended,
                    "{}",
                    outcome.status_line()
                ),
                Err(err) => error!(error = %err, "scheduled ingest run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
