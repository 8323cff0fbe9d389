//! Parquet persistence of the run ledger.
//!
//! The whole ledger is written as one Parquet file on every checkpoint,
//! replacing the previous snapshot. Parameter columns are typed by inference
//! over all rows; composite values were already stringified by the job spec.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder, TimestampMicrosecondArray,
    TimestampMicrosecondBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;

use super::row::{JobStatus, LedgerRow};
use super::table::Ledger;
use crate::error::LedgerError;
use crate::jobs::LEDGER_COLUMNS;

const TIMEZONE: &str = "UTC";

/// A ledger row as loaded back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub slot: usize,
    pub function: String,
    pub status: JobStatus,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub params: BTreeMap<String, Value>,
}

impl LedgerRecord {
    /// Returns whether the row holds a final outcome.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
}

/// Picks the narrowest Arrow type that holds every non-null value.
fn infer_kind<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> ColumnKind {
    let present: Vec<&Value> = values.flatten().filter(|v| !v.is_null()).collect();
    if present.is_empty() {
        ColumnKind::Text
    } else if present.iter().all(|v| v.is_i64()) {
        ColumnKind::Int
    } else if present.iter().all(|v| v.is_number()) {
        ColumnKind::Float
    } else if present.iter().all(|v| v.is_boolean()) {
        ColumnKind::Bool
    } else {
        ColumnKind::Text
    }
}

/// Parameter names that would shadow a ledger column are written with a prefix.
fn column_name(param: &str) -> String {
    if LEDGER_COLUMNS.contains(&param) {
        format!("param_{}", param)
    } else {
        param.to_string()
    }
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(TIMEZONE.into()))
}

/// Converts ledger rows into a single Arrow record batch.
pub fn rows_to_record_batch(rows: &[LedgerRow]) -> Result<RecordBatch, LedgerError> {
    let param_names: BTreeSet<&String> = rows.iter().flat_map(|r| r.params.keys()).collect();

    let mut fields = vec![Field::new("slot", DataType::UInt64, false)];
    let mut columns: Vec<ArrayRef> = Vec::new();

    let mut slot = UInt64Builder::new();
    for row in rows {
        slot.append_value(row.slot as u64);
    }
    columns.push(Arc::new(slot.finish()));

    for name in param_names {
        let values = || rows.iter().map(|r| r.params.get(name.as_str()));
        let kind = infer_kind(values());
        let column: ArrayRef = match kind {
            ColumnKind::Int => {
                let mut builder = Int64Builder::new();
                for value in values() {
                    builder.append_option(value.and_then(Value::as_i64));
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Float => {
                let mut builder = Float64Builder::new();
                for value in values() {
                    builder.append_option(value.and_then(Value::as_f64));
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Bool => {
                let mut builder = BooleanBuilder::new();
                for value in values() {
                    builder.append_option(value.and_then(Value::as_bool));
                }
                Arc::new(builder.finish())
            }
            ColumnKind::Text => {
                let mut builder = StringBuilder::new();
                for value in values() {
                    match value {
                        None | Some(Value::Null) => builder.append_null(),
                        Some(Value::String(s)) => builder.append_value(s),
                        Some(other) => builder.append_value(other.to_string()),
                    }
                }
                Arc::new(builder.finish())
            }
        };
        fields.push(Field::new(column_name(name), column.data_type().clone(), true));
        columns.push(column);
    }

    let mut function = StringBuilder::new();
    let mut status = StringBuilder::new();
    let mut start = TimestampMicrosecondBuilder::new().with_timezone(TIMEZONE);
    let mut stop = TimestampMicrosecondBuilder::new().with_timezone(TIMEZONE);
    let mut duration = Float64Builder::new();

    for row in rows {
        function.append_value(&row.function);
        status.append_value(row.status.to_string());
        start.append_option(row.start.map(|t| t.timestamp_micros()));
        stop.append_option(row.stop.map(|t| t.timestamp_micros()));
        duration.append_option(row.duration);
    }

    fields.push(Field::new("function", DataType::Utf8, false));
    fields.push(Field::new("status", DataType::Utf8, false));
    fields.push(Field::new("start", timestamp_type(), true));
    fields.push(Field::new("stop", timestamp_type(), true));
    fields.push(Field::new("duration", DataType::Float64, true));
    columns.push(Arc::new(function.finish()));
    columns.push(Arc::new(status.finish()));
    columns.push(Arc::new(start.finish()));
    columns.push(Arc::new(stop.finish()));
    columns.push(Arc::new(duration.finish()));

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Writes the ledger to `path`, atomically replacing any previous snapshot.
pub fn write_ledger(ledger: &Ledger, path: &Path) -> Result<(), LedgerError> {
    let batch = rows_to_record_batch(ledger.rows())?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path(path);
    let file = std::fs::File::create(&tmp_path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    std::fs::rename(&tmp_path, path)?;

    tracing::debug!(
        path = %path.display(),
        rows = ledger.len(),
        "Ledger written"
    );

    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Loads a persisted ledger.
///
/// Rows are only meaningful once their status is terminal.
pub fn read_ledger(path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    let file = std::fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        records.extend(records_from_batch(&batch)?);
    }
    Ok(records)
}

fn records_from_batch(batch: &RecordBatch) -> Result<Vec<LedgerRecord>, LedgerError> {
    let num_rows = batch.num_rows();

    let slots = typed_column::<UInt64Array>(batch, "slot")?;
    let functions = typed_column::<StringArray>(batch, "function")?;
    let statuses = typed_column::<StringArray>(batch, "status")?;
    let starts = typed_column::<TimestampMicrosecondArray>(batch, "start")?;
    let stops = typed_column::<TimestampMicrosecondArray>(batch, "stop")?;
    let durations = typed_column::<Float64Array>(batch, "duration")?;

    let schema = batch.schema();
    let param_columns: Vec<(&str, &ArrayRef)> = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, column)| (field.name().as_str(), column))
        .filter(|(name, _)| !LEDGER_COLUMNS.contains(name))
        .collect();

    let timestamp = |array: &TimestampMicrosecondArray, i: usize| {
        if array.is_null(i) {
            None
        } else {
            DateTime::<Utc>::from_timestamp_micros(array.value(i))
        }
    };

    let mut records = Vec::with_capacity(num_rows);
    for i in 0..num_rows {
        let status = statuses
            .value(i)
            .parse::<JobStatus>()
            .map_err(LedgerError::Malformed)?;

        let mut params = BTreeMap::new();
        for &(name, column) in &param_columns {
            let name = name
                .strip_prefix("param_")
                .filter(|n| LEDGER_COLUMNS.contains(n))
                .unwrap_or(name);
            if let Some(value) = param_value(column, i) {
                params.insert(name.to_string(), value);
            }
        }

        records.push(LedgerRecord {
            slot: slots.value(i) as usize,
            function: functions.value(i).to_string(),
            status,
            start: timestamp(starts, i),
            stop: timestamp(stops, i),
            duration: (!durations.is_null(i)).then(|| durations.value(i)),
            params,
        });
    }

    Ok(records)
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, LedgerError> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| LedgerError::Malformed(format!("missing or mistyped column '{}'", name)))
}

fn param_value(column: &ArrayRef, i: usize) -> Option<Value> {
    if column.is_null(i) {
        return None;
    }
    let any = column.as_any();
    if let Some(array) = any.downcast_ref::<Int64Array>() {
        Some(Value::from(array.value(i)))
    } else if let Some(array) = any.downcast_ref::<Float64Array>() {
        Some(Value::from(array.value(i)))
    } else if let Some(array) = any.downcast_ref::<BooleanArray>() {
        Some(Value::from(array.value(i)))
    } else {
        any.downcast_ref::<StringArray>()
            .map(|array| Value::from(array.value(i)))
    }
}
