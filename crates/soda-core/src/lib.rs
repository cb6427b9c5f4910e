//! Core domain model for the complaint ingest: watermark, complaint records, timestamps.

use chrono::{DateTime, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "soda-core";

/// Socrata floating timestamps carry no zone; fractional seconds are optional.
const FLOATING_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const FLOATING_FORMAT_SPACED: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("record {unique_key}: cannot cast {field} value {value:?}")]
    Field {
        unique_key: String,
        field: &'static str,
        value: String,
    },
    #[error("malformed watermark: {0}")]
    Watermark(#[from] serde_json::Error),
}

/// Parse an ISO-8601 timestamp without zone (`2024-01-02T10:00:00.000`).
///
/// A trailing `Z` or offset is accepted and converted to its UTC wall time.
pub fn parse_floating_timestamp(value: &str) -> Result<NaiveDateTime, RecordError> {
    let trimmed = value.trim();
    let source = match NaiveDateTime::parse_from_str(trimmed, FLOATING_FORMAT) {
        Ok(ts) => return Ok(ts),
        Err(err) => err,
    };
    if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, FLOATING_FORMAT_SPACED) {
        return Ok(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.naive_utc());
    }
    Err(RecordError::Timestamp {
        value: value.to_string(),
        source,
    })
}

/// Render a timestamp the way the watermark stores it; fractional digits only when non-zero.
pub fn format_floating_timestamp(ts: NaiveDateTime) -> String {
    ts.format(FLOATING_FORMAT).to_string()
}

/// Wall-clock time truncated to whole seconds, as recorded in `last_pull`.
pub fn truncate_to_seconds(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Persisted fetch marker: newest ingested `created_date` and time of the last successful pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_date: String,
    pub last_pull: String,
}

impl Watermark {
    pub fn new(last_date: NaiveDateTime, last_pull: NaiveDateTime) -> Self {
        Self {
            last_date: format_floating_timestamp(last_date),
            last_pull: format_floating_timestamp(truncate_to_seconds(last_pull)),
        }
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn last_date(&self) -> Result<NaiveDateTime, RecordError> {
        parse_floating_timestamp(&self.last_date)
    }

    /// Compare the stored `last_date` with the newest qualifying remote timestamp.
    ///
    /// Equality is decided on parsed instants, so `10:00:00` and `10:00:00.000` match.
    pub fn freshness(&self, remote_latest: NaiveDateTime) -> Result<FreshnessState, RecordError> {
        if self.last_date()? == remote_latest {
            Ok(FreshnessState::Fresh)
        } else {
            Ok(FreshnessState::Stale)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessState {
    Fresh,
    Stale,
}

impl FreshnessState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
        }
    }
}

/// Complaint row as returned by the open-data API; every value arrives as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawComplaint {
    pub unique_key: String,
    pub created_date: String,
    #[serde(default)]
    pub descriptor: Option<String>,
    pub incident_zip: String,
    pub community_board: String,
    pub latitude: String,
    pub longitude: String,
}

/// Typed complaint row as stored in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complaint {
    pub unique_key: String,
    pub created_date: NaiveDateTime,
    pub descriptor: Option<String>,
    pub incident_zip: String,
    pub community_board: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl TryFrom<RawComplaint> for Complaint {
    type Error = RecordError;

    fn try_from(raw: RawComplaint) -> Result<Self, Self::Error> {
        let created_date =
            parse_floating_timestamp(&raw.created_date).map_err(|_| RecordError::Field {
                unique_key: raw.unique_key.clone(),
                field: "created_date",
                value: raw.created_date.clone(),
            })?;
        let latitude = parse_coordinate(&raw.unique_key, "latitude", &raw.latitude)?;
        let longitude = parse_coordinate(&raw.unique_key, "longitude", &raw.longitude)?;
        Ok(Self {
            unique_key: raw.unique_key,
            created_date,
            descriptor: raw.descriptor,
            incident_zip: raw.incident_zip,
            community_board: raw.community_board,
            latitude,
            longitude,
        })
    }
}

fn parse_coordinate(unique_key: &str, field: &'static str, value: &str) -> Result<f64, RecordError> {
    value.trim().parse::<f64>().map_err(|_| RecordError::Field {
        unique_key: unique_key.to_string(),
        field,
        value: value.to_string(),
    })
}

/// Cast a fetched batch, preserving order.
pub fn normalize_batch(raw: Vec<RawComplaint>) -> Result<Vec<Complaint>, RecordError> {
    raw.into_iter().map(Complaint::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn raw(key: &str, lat: &str, lon: &str) -> RawComplaint {
        RawComplaint {
            unique_key: key.to_string(),
            created_date: "2024-01-02T10:00:00.000".to_string(),
            descriptor: Some("Cat".to_string()),
            incident_zip: "11201".to_string(),
            community_board: "02 BROOKLYN".to_string(),
            latitude: lat.to_string(),
            longitude: lon.to_string(),
        }
    }

    #[test]
    fn floating_timestamps_parse_with_and_without_fraction() {
        let expected = ts(2024, 1, 2, 10, 0, 0);
        assert_eq!(parse_floating_timestamp("2024-01-02T10:00:00").unwrap(), expected);
        assert_eq!(parse_floating_timestamp("2024-01-02T10:00:00.000").unwrap(), expected);
        assert_eq!(parse_floating_timestamp("2024-01-02 10:00:00").unwrap(), expected);
        assert_eq!(parse_floating_timestamp("2024-01-02T10:00:00Z").unwrap(), expected);
        assert!(parse_floating_timestamp("yesterday").is_err());
    }

    #[test]
    fn formatting_drops_zero_fraction() {
        assert_eq!(format_floating_timestamp(ts(2024, 1, 2, 10, 0, 0)), "2024-01-02T10:00:00");
        let with_millis = parse_floating_timestamp("2024-01-02T10:00:00.250").unwrap();
        assert_eq!(format_floating_timestamp(with_millis), "2024-01-02T10:00:00.250");
    }

    #[test]
    fn watermark_parses_and_compares_on_instants() {
        let wm = Watermark::from_json_slice(
            br#"{"last_date": "2024-01-01T00:00:00", "last_pull": "2024-01-01T00:05:00"}"#,
        )
        .unwrap();
        assert_eq!(
            wm.freshness(parse_floating_timestamp("2024-01-01T00:00:00.000").unwrap()).unwrap(),
            FreshnessState::Fresh
        );
        assert_eq!(
            wm.freshness(ts(2024, 1, 2, 10, 0, 0)).unwrap(),
            FreshnessState::Stale
        );
    }

    #[test]
    fn microsecond_padded_watermark_matches_millisecond_remote() {
        let wm = Watermark::from_json_slice(
            br#"{"last_date": "2024-01-02T10:00:00.250000", "last_pull": "2024-01-02T10:05:00"}"#,
        )
        .unwrap();
        let remote = parse_floating_timestamp("2024-01-02T10:00:00.250").unwrap();
        assert_eq!(wm.freshness(remote).unwrap(), FreshnessState::Fresh);

        let rewritten = Watermark::new(wm.last_date().unwrap(), ts(2024, 1, 2, 10, 5, 0));
        assert_eq!(rewritten.last_date, "2024-01-02T10:00:00.250");
        assert_eq!(rewritten.freshness(remote).unwrap(), FreshnessState::Fresh);
    }

    #[test]
    fn malformed_watermark_is_rejected() {
        let err = Watermark::from_json_slice(b"{\"last_pull\": \"x\"}").unwrap_err();
        assert!(matches!(err, RecordError::Watermark(_)));
        assert!(Watermark::from_json_slice(b"not json").is_err());
    }

    #[test]
    fn new_watermark_truncates_pull_time() {
        let pulled = parse_floating_timestamp("2024-01-02T10:05:07.891").unwrap();
        let wm = Watermark::new(ts(2024, 1, 2, 10, 0, 0), pulled);
        assert_eq!(wm.last_date, "2024-01-02T10:00:00");
        assert_eq!(wm.last_pull, "2024-01-02T10:05:07");
        let round_trip = Watermark::from_json_slice(&wm.to_json_vec().unwrap()).unwrap();
        assert_eq!(round_trip, wm);
    }

    #[test]
    fn coordinates_are_cast_to_floats() {
        let complaint = Complaint::try_from(raw("X1", "40.7", "-73.9")).unwrap();
        assert_eq!(complaint.latitude, 40.7);
        assert_eq!(complaint.longitude, -73.9);
        assert_eq!(complaint.created_date, ts(2024, 1, 2, 10, 0, 0));
    }

    #[test]
    fn bad_coordinate_names_record_and_field() {
        let err = Complaint::try_from(raw("X2", "north", "-73.9")).unwrap_err();
        match err {
            RecordError::Field { unique_key, field, value } => {
                assert_eq!(unique_key, "X2");
                assert_eq!(field, "latitude");
                assert_eq!(value, "north");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_descriptor_deserializes_as_none() {
        let raw: RawComplaint = serde_json::from_str(
            r#"{"unique_key":"X3","created_date":"2024-01-02T10:00:00.000","incident_zip":"10001",
                "community_board":"05 MANHATTAN","latitude":"40.75","longitude":"-73.99"}"#,
        )
        .unwrap();
        assert_eq!(raw.descriptor, None);
        let batch = normalize_batch(vec![raw]).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
