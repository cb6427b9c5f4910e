//! Open-data source contract + the Socrata (SODA) implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use soda_core::{format_floating_timestamp, parse_floating_timestamp, RawComplaint, RecordError};
use soda_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "soda-source";

pub const COMPLAINT_TYPE: &str = "Dead Animal";
pub const DEFAULT_DELTA_LIMIT: usize = 20_000;

/// Fields that must be present for a complaint to qualify.
pub const NON_NULL_FIELDS: [&str; 4] = ["incident_zip", "community_board", "latitude", "longitude"];

/// Columns selected by the delta fetch, in snapshot order.
pub const SNAPSHOT_FIELDS: [&str; 7] = [
    "unique_key",
    "created_date",
    "descriptor",
    "incident_zip",
    "community_board",
    "latitude",
    "longitude",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Minimal SoQL builder covering SELECT / WHERE (conjunction) / ORDER BY / LIMIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoqlQuery {
    select: Vec<String>,
    conditions: Vec<String>,
    order_by: Vec<(String, SortDirection)>,
    limit: Option<usize>,
}

impl SoqlQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn and_where(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl fmt::Display for SoqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.select.is_empty() {
            write!(f, "SELECT *")?;
        } else {
            write!(f, "SELECT {}", self.select.join(", "))?;
        }
        if !self.conditions.is_empty() {
            write!(f, " WHERE {}", self.conditions.join(" AND "))?;
        }
        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(|(field, dir)| match dir {
                    SortDirection::Asc => format!("{field} ASC"),
                    SortDirection::Desc => format!("{field} DESC"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " ORDER BY {order}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

/// Single-quote a SoQL string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn qualifying(query: SoqlQuery) -> SoqlQuery {
    let query = query.and_where(format!("complaint_type = {}", quote_literal(COMPLAINT_TYPE)));
    NON_NULL_FIELDS
        .iter()
        .fold(query, |q, field| q.and_where(format!("{field} IS NOT NULL")))
}

fn newest_first(query: SoqlQuery) -> SoqlQuery {
    query
        .order_by("created_date", SortDirection::Desc)
        .order_by("unique_key", SortDirection::Desc)
}

/// Probe for the `created_date` of the newest qualifying complaint.
pub fn latest_timestamp_query() -> SoqlQuery {
    newest_first(qualifying(SoqlQuery::new().select(["created_date"]))).limit(1)
}

/// Bounded fetch of qualifying complaints created strictly after `after`.
pub fn delta_query(after: NaiveDateTime, limit: usize) -> SoqlQuery {
    let query = SoqlQuery::new().select(SNAPSHOT_FIELDS).and_where(format!(
        "created_date > {}",
        quote_literal(&format_floating_timestamp(after))
    ));
    newest_first(qualifying(query)).limit(limit)
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[async_trait]
pub trait ComplaintSource: Send + Sync {
    fn describe(&self) -> String;

    /// `created_date` of the newest qualifying complaint, `None` when nothing qualifies.
    async fn latest_created_date(&self, run_id: Uuid) -> Result<Option<NaiveDateTime>, SourceError>;

    /// Qualifying complaints newer than `after`, newest first, at most `limit` rows.
    async fn fetch_since(
        &self,
        run_id: Uuid,
        after: NaiveDateTime,
        limit: usize,
    ) -> Result<Vec<RawComplaint>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SocrataConfig {
    pub domain: String,
    pub dataset: String,
    pub app_token: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct SocrataClient {
    http: HttpFetcher,
    resource_url: String,
}

#[derive(Debug, Deserialize)]
struct LatestRow {
    created_date: String,
}

impl SocrataClient {
    pub fn new(config: SocrataConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent.clone()),
            backoff: config.backoff,
            default_headers: vec![("X-App-Token".to_string(), config.app_token.clone())],
        })?;
        Ok(Self {
            http,
            resource_url: resource_url(&config.domain, &config.dataset),
        })
    }

    async fn query<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        query: &SoqlQuery,
    ) -> Result<Vec<T>, SourceError> {
        let soql = query.to_string();
        debug!(%run_id, %soql, "running soql query");
        let resp = self
            .http
            .fetch_bytes(run_id, &self.resource_url, &[("$query", soql.as_str())])
            .await?;
        serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
            url: resp.final_url,
            source,
        })
    }
}

/// `https://{domain}/resource/{dataset}.json`; a domain that already carries a scheme is kept as is.
pub fn resource_url(domain: &str, dataset: &str) -> String {
    let base = domain.trim().trim_end_matches('/');
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{base}")
    };
    format!("{base}/resource/{}.json", dataset.trim())
}

#[async_trait]
impl ComplaintSource for SocrataClient {
    fn describe(&self) -> String {
        self.resource_url.clone()
    }

    async fn latest_created_date(&self, run_id: Uuid) -> Result<Option<NaiveDateTime>, SourceError> {
        let rows: Vec<LatestRow> = self.query(run_id, &latest_timestamp_query()).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(parse_floating_timestamp(&row.created_date)?))
    }

    async fn fetch_since(
        &self,
        run_id: Uuid,
        after: NaiveDateTime,
        limit: usize,
    ) -> Result<Vec<RawComplaint>, SourceError> {
        let rows: Vec<RawComplaint> = self.query(run_id, &delta_query(after, limit)).await?;
        info!(%run_id, rows = rows.len(), limit, "fetched delta window");
        Ok(rows)
    }
}
