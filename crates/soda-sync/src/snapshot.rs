//! Parquet encoding of the complaint snapshot and the prepend merge.
//!
//! The written schema is fixed; reads are lenient about timestamp units, large
//! string columns and extra columns so files produced by other tools load.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, Float32Array, Float64Array, LargeStringArray, RecordBatch, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use soda_core::Complaint;
use thiserror::Error;

use crate::config::MergeMode;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("column {column}: {reason}")]
    Column { column: &'static str, reason: String },
}

pub fn snapshot_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("unique_key", DataType::Utf8, false),
        ArrowField::new(
            "created_date",
            DataType::Timestamp(TimeUnit::Nanosecond, None),
            false,
        ),
        ArrowField::new("descriptor", DataType::Utf8, true),
        ArrowField::new("incident_zip", DataType::Utf8, false),
        ArrowField::new("community_board", DataType::Utf8, false),
        ArrowField::new("latitude", DataType::Float64, false),
        ArrowField::new("longitude", DataType::Float64, false),
    ]))
}

pub fn encode_snapshot(rows: &[Complaint]) -> Result<Bytes, SnapshotError> {
    let created = rows
        .iter()
        .map(|c| {
            c.created_date
                .and_utc()
                .timestamp_nanos_opt()
                .ok_or_else(|| SnapshotError::Column {
                    column: "created_date",
                    reason: format!("{} is outside the nanosecond range", c.created_date),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let unique_keys = StringArray::from(
        rows.iter()
            .map(|c| Some(c.unique_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let descriptors = StringArray::from(
        rows.iter()
            .map(|c| c.descriptor.as_deref())
            .collect::<Vec<_>>(),
    );
    let zips = StringArray::from(
        rows.iter()
            .map(|c| Some(c.incident_zip.as_str()))
            .collect::<Vec<_>>(),
    );
    let boards = StringArray::from(
        rows.iter()
            .map(|c| Some(c.community_board.as_str()))
            .collect::<Vec<_>>(),
    );
    let latitudes = Float64Array::from(rows.iter().map(|c| c.latitude).collect::<Vec<_>>());
    let longitudes = Float64Array::from(rows.iter().map(|c| c.longitude).collect::<Vec<_>>());

    let schema = snapshot_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(unique_keys),
            Arc::new(TimestampNanosecondArray::from(created)),
            Arc::new(descriptors),
            Arc::new(zips),
            Arc::new(boards),
            Arc::new(latitudes),
            Arc::new(longitudes),
        ],
    )?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(buf))
}

pub fn decode_snapshot(bytes: Bytes) -> Result<Vec<Complaint>, SnapshotError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        decode_batch(&batch?, &mut rows)?;
    }
    Ok(rows)
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<Complaint>) -> Result<(), SnapshotError> {
    let unique_keys = strings(batch, "unique_key")?;
    let created = timestamps(batch, "created_date")?;
    let descriptors = strings(batch, "descriptor")?;
    let zips = strings(batch, "incident_zip")?;
    let boards = strings(batch, "community_board")?;
    let latitudes = floats(batch, "latitude")?;
    let longitudes = floats(batch, "longitude")?;

    out.reserve(batch.num_rows());
    for i in 0..batch.num_rows() {
        out.push(Complaint {
            unique_key: required("unique_key", i, unique_keys[i].clone())?,
            created_date: required("created_date", i, created[i])?,
            descriptor: descriptors[i].clone(),
            incident_zip: required("incident_zip", i, zips[i].clone())?,
            community_board: required("community_board", i, boards[i].clone())?,
            latitude: required("latitude", i, latitudes[i])?,
            longitude: required("longitude", i, longitudes[i])?,
        });
    }
    Ok(())
}

fn required<T>(column: &'static str, row: usize, value: Option<T>) -> Result<T, SnapshotError> {
    value.ok_or_else(|| SnapshotError::Column {
        column,
        reason: format!("null at row {row}"),
    })
}

fn column<'a>(batch: &'a RecordBatch, name: &'static str) -> Result<&'a ArrayRef, SnapshotError> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| SnapshotError::Column {
            column: name,
            reason: "missing".to_string(),
        })?;
    Ok(batch.column(idx))
}

fn unsupported(name: &'static str, data_type: &DataType) -> SnapshotError {
    SnapshotError::Column {
        column: name,
        reason: format!("unsupported type {data_type}"),
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &'static str) -> Result<&'a T, SnapshotError> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| unsupported(name, array.data_type()))
}

fn strings(batch: &RecordBatch, name: &'static str) -> Result<Vec<Option<String>>, SnapshotError> {
    let array = column(batch, name)?;
    match array.data_type() {
        DataType::Utf8 => Ok(downcast::<StringArray>(array, name)?
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()),
        DataType::LargeUtf8 => Ok(downcast::<LargeStringArray>(array, name)?
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()),
        other => Err(unsupported(name, other)),
    }
}

fn floats(batch: &RecordBatch, name: &'static str) -> Result<Vec<Option<f64>>, SnapshotError> {
    let array = column(batch, name)?;
    match array.data_type() {
        DataType::Float64 => Ok(downcast::<Float64Array>(array, name)?.iter().collect()),
        DataType::Float32 => Ok(downcast::<Float32Array>(array, name)?
            .iter()
            .map(|v| v.map(f64::from))
            .collect()),
        other => Err(unsupported(name, other)),
    }
}

fn timestamps(
    batch: &RecordBatch,
    name: &'static str,
) -> Result<Vec<Option<NaiveDateTime>>, SnapshotError> {
    let array = column(batch, name)?;
    let (raw, unit): (Vec<Option<i64>>, TimeUnit) = match array.data_type() {
        DataType::Timestamp(TimeUnit::Nanosecond, _) => (
            downcast::<TimestampNanosecondArray>(array, name)?.iter().collect(),
            TimeUnit::Nanosecond,
        ),
        DataType::Timestamp(TimeUnit::Microsecond, _) => (
            downcast::<TimestampMicrosecondArray>(array, name)?.iter().collect(),
            TimeUnit::Microsecond,
        ),
        DataType::Timestamp(TimeUnit::Millisecond, _) => (
            downcast::<TimestampMillisecondArray>(array, name)?.iter().collect(),
            TimeUnit::Millisecond,
        ),
        DataType::Timestamp(TimeUnit::Second, _) => (
            downcast::<TimestampSecondArray>(array, name)?.iter().collect(),
            TimeUnit::Second,
        ),
        other => return Err(unsupported(name, other)),
    };

    raw.into_iter()
        .map(|value| {
            value
                .map(|v| {
                    let converted = match unit {
                        TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(v)),
                        TimeUnit::Microsecond => DateTime::from_timestamp_micros(v),
                        TimeUnit::Millisecond => DateTime::from_timestamp_millis(v),
                        TimeUnit::Second => DateTime::from_timestamp(v, 0),
                    };
                    converted
                        .map(|dt| dt.naive_utc())
                        .ok_or_else(|| SnapshotError::Column {
                            column: name,
                            reason: format!("timestamp {v} out of range"),
                        })
                })
                .transpose()
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct MergedSnapshot {
    pub rows: Vec<Complaint>,
    pub appended: usize,
    pub skipped_duplicates: usize,
}

/// Prepend `fresh` (newest first) to `existing`.
///
/// In `Dedup` mode a fetched row is dropped when its `unique_key` is already stored
/// or appeared earlier in the same batch; stored rows are never rewritten.
pub fn merge_snapshot(fresh: Vec<Complaint>, existing: Vec<Complaint>, mode: MergeMode) -> MergedSnapshot {
    let fetched = fresh.len();
    let kept: Vec<Complaint> = match mode {
        MergeMode::Append => fresh,
        MergeMode::Dedup => {
            let mut seen: HashSet<String> =
                existing.iter().map(|c| c.unique_key.clone()).collect();
            fresh
                .into_iter()
                .filter(|c| seen.insert(c.unique_key.clone()))
                .collect()
        }
    };

    let appended = kept.len();
    let mut rows = kept;
    rows.extend(existing);
    MergedSnapshot {
        rows,
        appended,
        skipped_duplicates: fetched - appended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Int64Array;
    use chrono::NaiveDate;
    use soda_core::truncate_to_seconds;

    fn complaint(key: &str, day: u32, descriptor: Option<&str>) -> Complaint {
        Complaint {
            unique_key: key.to_string(),
            created_date: NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_milli_opt(10, 0, 0, 250)
                .unwrap(),
            descriptor: descriptor.map(str::to_string),
            incident_zip: "11201".to_string(),
            community_board: "02 BROOKLYN".to_string(),
            latitude: 40.7,
            longitude: -73.9,
        }
    }

    #[test]
    fn encoded_snapshot_decodes_to_same_rows() {
        let rows = vec![
            complaint("B", 3, Some("Deer")),
            complaint("A", 2, None),
        ];
        let decoded = decode_snapshot(encode_snapshot(&rows).expect("encode")).expect("decode");
        assert_eq!(decoded, rows);
    }

    #[test]
    fn empty_snapshot_is_valid_parquet() {
        let decoded = decode_snapshot(encode_snapshot(&[]).expect("encode")).expect("decode");
        assert!(decoded.is_empty());
    }

    #[test]
    fn foreign_layout_with_microseconds_and_index_column_loads() {
        let schema = Arc::new(Schema::new(vec![
            ArrowField::new("unique_key", DataType::LargeUtf8, true),
            ArrowField::new(
                "created_date",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            ArrowField::new("descriptor", DataType::Utf8, true),
            ArrowField::new("incident_zip", DataType::Utf8, true),
            ArrowField::new("community_board", DataType::Utf8, true),
            ArrowField::new("latitude", DataType::Float64, true),
            ArrowField::new("longitude", DataType::Float64, true),
            ArrowField::new("__index_level_0__", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(LargeStringArray::from(vec!["K1"])),
                Arc::new(TimestampMicrosecondArray::from(vec![1_704_189_600_000_000i64])),
                Arc::new(StringArray::from(vec![Some("Cat")])),
                Arc::new(StringArray::from(vec!["10001"])),
                Arc::new(StringArray::from(vec!["05 MANHATTAN"])),
                Arc::new(Float64Array::from(vec![40.75])),
                Arc::new(Float64Array::from(vec![-73.99])),
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )
        .unwrap();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let decoded = decode_snapshot(Bytes::from(buf)).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].unique_key, "K1");
        assert_eq!(
            decoded[0].created_date,
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap()
        );
    }

    fn single_row_with_created(created: ArrayRef) -> Bytes {
        let schema = Arc::new(Schema::new(vec![
            ArrowField::new("unique_key", DataType::Utf8, false),
            ArrowField::new("created_date", created.data_type().clone(), true),
            ArrowField::new("descriptor", DataType::Utf8, true),
            ArrowField::new("incident_zip", DataType::Utf8, false),
            ArrowField::new("community_board", DataType::Utf8, false),
            ArrowField::new("latitude", DataType::Float64, false),
            ArrowField::new("longitude", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["K1"])),
                created,
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(StringArray::from(vec!["10001"])),
                Arc::new(StringArray::from(vec!["05 MANHATTAN"])),
                Arc::new(Float64Array::from(vec![40.75])),
                Arc::new(Float64Array::from(vec![-73.99])),
            ],
        )
        .unwrap();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn second_and_millisecond_timestamps_decode_to_same_instant() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_milli_opt(10, 0, 0, 250)
            .unwrap();

        let millis = single_row_with_created(Arc::new(TimestampMillisecondArray::from(vec![
            1_704_189_600_250i64,
        ])));
        let decoded = decode_snapshot(millis).expect("decode millis");
        assert_eq!(decoded[0].created_date, expected);

        let seconds = single_row_with_created(Arc::new(TimestampSecondArray::from(vec![
            1_704_189_600i64,
        ])));
        let decoded = decode_snapshot(seconds).expect("decode seconds");
        assert_eq!(decoded[0].created_date, truncate_to_seconds(expected));
        assert_eq!(decoded[0].descriptor, None);
    }

    #[test]
    fn non_timestamp_created_date_is_rejected() {
        let bytes = single_row_with_created(Arc::new(Int64Array::from(vec![0i64])));
        match decode_snapshot(bytes) {
            Err(SnapshotError::Column { column, .. }) => assert_eq!(column, "created_date"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_column_is_reported_by_name() {
        let schema = Arc::new(Schema::new(vec![ArrowField::new(
            "unique_key",
            DataType::Utf8,
            false,
        )]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(StringArray::from(vec!["K1"]))])
                .unwrap();
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        match decode_snapshot(Bytes::from(buf)) {
            Err(SnapshotError::Column { column, .. }) => assert_eq!(column, "created_date"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn append_mode_keeps_duplicates() {
        let merged = merge_snapshot(
            vec![complaint("A", 2, None)],
            vec![complaint("A", 2, None)],
            MergeMode::Append,
        );
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(merged.appended, 1);
        assert_eq!(merged.skipped_duplicates, 0);
    }

    #[test]
    fn dedup_mode_prepends_only_unseen_keys() {
        let merged = merge_snapshot(
            vec![
                complaint("C", 4, None),
                complaint("B", 3, None),
                complaint("C", 4, None),
            ],
            vec![complaint("B", 3, None), complaint("A", 2, None)],
            MergeMode::Dedup,
        );
        let keys: Vec<_> = merged.rows.iter().map(|c| c.unique_key.as_str()).collect();
        assert_eq!(keys, vec!["C", "B", "A"]);
        assert_eq!(merged.appended, 1);
        assert_eq!(merged.skipped_duplicates, 2);
    }
}
