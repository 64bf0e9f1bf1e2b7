//! Conversion of engine-native scalars into JSON-safe cells.
//!
//! Storage and engine layers produce [`RawValue`]s; everything that leaves the
//! crate goes through [`encode`], which maps them onto the closed [`Cell`] set.
//! The mapping is total: values it does not understand degrade to their string
//! form instead of failing the request.

mod batch;
mod sql;

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time, UtcOffset};

pub use self::batch::{raw_value, record_batch_rows};
pub use self::sql::{from_sql, to_sql};

/// Scalar as produced by the columnar reader or the query engine, before
/// encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Missing value.
    Null,
    /// Temporal value that could not be represented ("not a time").
    NotATime,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point, possibly NaN or infinite.
    Float(f64),
    /// Fixed-point decimal: `digits * 10^-scale`.
    Decimal {
        /// Unscaled digits.
        digits: i128,
        /// Number of fractional digits (may be negative).
        scale: i8,
    },
    /// UTF-8 text.
    Text(String),
    /// Binary blob.
    Bytes(Vec<u8>),
    /// Calendar date.
    Date(Date),
    /// Time of day.
    Time(Time),
    /// Date and time, optionally anchored to an offset.
    Timestamp {
        /// Wall-clock value in `offset` (or naive when `offset` is `None`).
        value: PrimitiveDateTime,
        /// Offset of the source column, if any.
        offset: Option<UtcOffset>,
    },
    /// Anything else, already rendered as text by the producer.
    Other(String),
}

/// JSON-safe cell: the only shapes that appear in result grids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    /// JSON `null`.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// Integer that fits in `i64`.
    Int(i64),
    /// Integer above `i64::MAX`.
    UInt(u64),
    /// Finite float.
    Float(f64),
    /// String.
    Text(String),
}

impl Cell {
    /// True when the cell is one of the JSON-safe shapes (floats finite).
    pub fn is_json_safe(&self) -> bool {
        match self {
            Cell::Float(v) => v.is_finite(),
            _ => true,
        }
    }
}

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
const MICROS_FORMAT: &[FormatItem<'static>] = format_description!(".[subsecond digits:6]");
const NANOS_FORMAT: &[FormatItem<'static>] = format_description!(".[subsecond digits:9]");
const OFFSET_FORMAT: &[FormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// Encodes a raw scalar into its JSON-safe form.
pub fn encode(value: RawValue) -> Cell {
    match value {
        RawValue::Null | RawValue::NotATime => Cell::Null,
        RawValue::Bool(v) => Cell::Bool(v),
        RawValue::Int(v) => Cell::Int(v),
        RawValue::UInt(v) => match i64::try_from(v) {
            Ok(v) => Cell::Int(v),
            Err(_) => Cell::UInt(v),
        },
        RawValue::Float(v) => float_cell(v),
        RawValue::Decimal { digits, scale } => {
            let value = digits as f64 / 10f64.powi(i32::from(scale));
            if value.is_finite() {
                Cell::Float(value)
            } else {
                Cell::Text(decimal_string(digits, scale))
            }
        }
        RawValue::Text(v) | RawValue::Other(v) => Cell::Text(v),
        RawValue::Bytes(v) => Cell::Text(String::from_utf8_lossy(&v).into_owned()),
        RawValue::Date(d) => Cell::Text(iso_date(d)),
        RawValue::Time(t) => Cell::Text(iso_time(t)),
        RawValue::Timestamp { value, offset } => Cell::Text(iso_timestamp(value, offset)),
    }
}

/// Encodes a full row.
pub fn encode_row(row: Vec<RawValue>) -> Vec<Cell> {
    row.into_iter().map(encode).collect()
}

fn float_cell(v: f64) -> Cell {
    if v.is_finite() {
        Cell::Float(v)
    } else {
        Cell::Null
    }
}

/// Renders a date as `YYYY-MM-DD`.
pub fn iso_date(date: Date) -> String {
    date.format(DATE_FORMAT)
        .unwrap_or_else(|_| date.to_string())
}

/// Renders a time of day as `HH:MM:SS[.ffffff]`.
pub fn iso_time(time: Time) -> String {
    let mut out = time
        .format(TIME_FORMAT)
        .unwrap_or_else(|_| time.to_string());
    let nanos = time.nanosecond();
    if nanos != 0 {
        let fraction = if nanos % 1_000 == 0 {
            time.format(MICROS_FORMAT)
        } else {
            time.format(NANOS_FORMAT)
        };
        if let Ok(fraction) = fraction {
            out.push_str(&fraction);
        }
    }
    out
}

/// Renders a timestamp as ISO-8601 (`YYYY-MM-DDTHH:MM:SS[.ffffff][+HH:MM]`).
pub fn iso_timestamp(value: PrimitiveDateTime, offset: Option<UtcOffset>) -> String {
    let mut out = format!("{}T{}", iso_date(value.date()), iso_time(value.time()));
    if let Some(offset) = offset {
        match offset.format(OFFSET_FORMAT) {
            Ok(text) => out.push_str(&text),
            Err(_) => out.push_str(&offset.to_string()),
        }
    }
    out
}

fn decimal_string(digits: i128, scale: i8) -> String {
    if scale <= 0 {
        let mut out = digits.to_string();
        if digits != 0 {
            out.extend(std::iter::repeat('0').take(usize::from(scale.unsigned_abs())));
        }
        return out;
    }
    let scale = usize::from(scale.unsigned_abs());
    let sign = if digits < 0 { "-" } else { "" };
    let magnitude = digits.unsigned_abs().to_string();
    let padded = format!("{magnitude:0>width$}", width = scale + 1);
    let (whole, fraction) = padded.split_at(padded.len() - scale);
    format!("{sign}{whole}.{fraction}")
}
