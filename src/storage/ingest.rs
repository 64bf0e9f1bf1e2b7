//! Upload validation and parsing of raw bytes into an Arrow table.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use csv::ReaderBuilder;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime};

use crate::config::LimitsSection;
use crate::error::{DataslotError, Result};

const UNIX_EPOCH_JULIAN_DAY: i32 = 2_440_588;

/// Cells treated as missing when parsing CSV.
const NA_VALUES: &[&str] = &["", "NA", "N/A", "n/a", "NULL", "null", "NaN", "nan", "None"];

const DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const DATETIME: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DATETIME_FRACTION: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");

/// Accepted upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Comma-separated text with a header row.
    Csv,
    /// Apache Parquet.
    Parquet,
}

impl SourceFormat {
    /// Derives the format from a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".csv") {
            Some(SourceFormat::Csv)
        } else if lower.ends_with(".parquet") {
            Some(SourceFormat::Parquet)
        } else {
            None
        }
    }

    /// Name under which the raw upload bytes are kept.
    pub fn raw_file_name(self) -> &'static str {
        match self {
            SourceFormat::Csv => "source.csv",
            SourceFormat::Parquet => "source.parquet",
        }
    }
}

/// Upload that passed shape validation.
#[derive(Debug, Clone)]
pub struct ValidatedUpload<'a> {
    /// Sanitized file name shown to users.
    pub display_name: String,
    /// Parsed format.
    pub format: SourceFormat,
    /// Raw bytes.
    pub bytes: &'a [u8],
}

/// Reduces a client-supplied file name to its final path component.
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    let last = trimmed
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(trimmed)
        .trim();
    if last.is_empty() || last == "." || last == ".." {
        "upload".to_string()
    } else {
        last.to_string()
    }
}

/// Rejects uploads whose declared size exceeds the soft ceiling, before the
/// body is read.
pub fn check_declared_size(declared: Option<u64>, limits: &LimitsSection) -> Result<()> {
    match declared {
        Some(size) if size > limits.soft_max_upload_bytes => Err(DataslotError::FileTooLarge {
            size,
            max: limits.soft_max_upload_bytes,
            hard: false,
        }),
        _ => Ok(()),
    }
}

/// Validates the extension, emptiness, and hard size ceiling of an upload.
pub fn validate_upload<'a>(
    file_name: &str,
    bytes: &'a [u8],
    limits: &LimitsSection,
) -> Result<ValidatedUpload<'a>> {
    let display_name = sanitize_file_name(file_name);
    let format = SourceFormat::from_file_name(&display_name).ok_or_else(|| {
        DataslotError::BadExtension {
            name: display_name.clone(),
        }
    })?;
    if bytes.is_empty() {
        return Err(DataslotError::EmptyFile);
    }
    let size = bytes.len() as u64;
    if size > limits.max_upload_bytes {
        return Err(DataslotError::FileTooLarge {
            size,
            max: limits.max_upload_bytes,
            hard: true,
        });
    }
    Ok(ValidatedUpload {
        display_name,
        format,
        bytes,
    })
}

/// Parses raw bytes into a single record batch.
pub fn parse_table(format: SourceFormat, bytes: &[u8]) -> Result<RecordBatch> {
    let batch = match format {
        SourceFormat::Csv => parse_csv(bytes)?,
        SourceFormat::Parquet => parse_parquet(bytes)?,
    };
    if batch.num_columns() == 0 {
        return Err(DataslotError::Parse("no columns to parse from file".into()));
    }
    let mut seen = HashSet::new();
    for field in batch.schema().fields() {
        if !seen.insert(field.name().as_str()) {
            return Err(DataslotError::Parse(format!(
                "duplicate column name '{}'",
                field.name()
            )));
        }
    }
    Ok(batch)
}

fn parse_parquet(bytes: &[u8]) -> Result<RecordBatch> {
    let data = Bytes::copy_from_slice(bytes);
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|err| DataslotError::Parse(err.to_string()))?;
    let schema = builder.schema().clone();
    let reader = builder
        .build()
        .map_err(|err| DataslotError::Parse(err.to_string()))?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| DataslotError::Parse(err.to_string()))?;
    concat_batches(&schema, &batches).map_err(|err| DataslotError::Parse(err.to_string()))
}

fn parse_csv(bytes: &[u8]) -> Result<RecordBatch> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| DataslotError::Parse(err.to_string()))?
        .clone();
    let names = column_names(headers.iter());
    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); names.len()];
    for record in reader.records() {
        let record = record.map_err(|err| DataslotError::Parse(err.to_string()))?;
        for (column, field) in cells.iter_mut().zip(record.iter()) {
            column.push(if NA_VALUES.contains(&field) {
                None
            } else {
                Some(field.to_string())
            });
        }
    }

    let mut fields = Vec::with_capacity(names.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(names.len());
    for (name, values) in names.into_iter().zip(cells) {
        let array = build_column(values);
        fields.push(Field::new(name, array.data_type().clone(), true));
        arrays.push(array);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|err| DataslotError::Parse(err.to_string()))
}

/// Disambiguates header names: blanks become `Unnamed: <i>`, repeats get
/// `.1`, `.2`, … suffixes.
fn column_names<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for (idx, raw) in headers.enumerate() {
        let base = if raw.trim().is_empty() {
            format!("Unnamed: {idx}")
        } else {
            raw.to_string()
        };
        let mut candidate = base.clone();
        let mut n = 1;
        while names.contains(&candidate) {
            candidate = format!("{base}.{n}");
            n += 1;
        }
        names.push(candidate);
    }
    names
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inferred {
    Int,
    Float,
    Bool,
    Date,
    Timestamp,
    Text,
}

fn infer(values: &[Option<String>]) -> Inferred {
    let mut present = values.iter().flatten().peekable();
    if present.peek().is_none() {
        return Inferred::Text;
    }
    let present: Vec<&String> = present.collect();
    let all = |check: fn(&str) -> bool| present.iter().all(|v| check(v));
    if all(|v| v.parse::<i64>().is_ok()) {
        Inferred::Int
    } else if all(|v| v.parse::<f64>().is_ok()) {
        Inferred::Float
    } else if all(|v| parse_bool(v).is_some()) {
        Inferred::Bool
    } else if all(|v| Date::parse(v, DATE).is_ok()) {
        Inferred::Date
    } else if all(|v| parse_datetime(v).is_some()) {
        Inferred::Timestamp
    } else {
        Inferred::Text
    }
}

fn build_column(values: Vec<Option<String>>) -> ArrayRef {
    match infer(&values) {
        Inferred::Int => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| v.as_deref().and_then(|v| v.parse::<i64>().ok()))
                .collect::<Vec<_>>(),
        )),
        Inferred::Float => Arc::new(Float64Array::from(
            values
                .iter()
                .map(|v| v.as_deref().and_then(|v| v.parse::<f64>().ok()))
                .collect::<Vec<_>>(),
        )),
        Inferred::Bool => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| v.as_deref().and_then(parse_bool))
                .collect::<Vec<_>>(),
        )),
        Inferred::Date => Arc::new(Date32Array::from(
            values
                .iter()
                .map(|v| {
                    v.as_deref()
                        .and_then(|v| Date::parse(v, DATE).ok())
                        .map(|d| d.to_julian_day() - UNIX_EPOCH_JULIAN_DAY)
                })
                .collect::<Vec<_>>(),
        )),
        Inferred::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            values
                .iter()
                .map(|v| {
                    v.as_deref().and_then(parse_datetime).and_then(|dt| {
                        i64::try_from(dt.assume_utc().unix_timestamp_nanos() / 1_000).ok()
                    })
                })
                .collect::<Vec<_>>(),
        )),
        Inferred::Text => Arc::new(StringArray::from(values)),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn parse_datetime(value: &str) -> Option<PrimitiveDateTime> {
    let normalized = match value.as_bytes().get(10) {
        Some(b' ') => format!("{}T{}", &value[..10], &value[11..]),
        _ => value.to_string(),
    };
    PrimitiveDateTime::parse(&normalized, DATETIME)
        .or_else(|_| PrimitiveDateTime::parse(&normalized, DATETIME_FRACTION))
        .ok()
}
