//! Conversions between raw values and SQLite storage classes.

use rusqlite::types::{Value, ValueRef};

use super::{iso_date, iso_time, iso_timestamp, RawValue};

/// Reads a SQLite value as returned by a result row.
pub fn from_sql(value: ValueRef<'_>) -> RawValue {
    match value {
        ValueRef::Null => RawValue::Null,
        ValueRef::Integer(v) => RawValue::Int(v),
        ValueRef::Real(v) => RawValue::Float(v),
        ValueRef::Text(bytes) => RawValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => RawValue::Bytes(bytes.to_vec()),
    }
}

/// Converts a stored value for insertion into a SQLite table.
///
/// Booleans become 0/1 and temporal values their ISO text, matching what
/// SQLite itself understands for comparisons and date functions.
pub fn to_sql(value: RawValue) -> Value {
    match value {
        RawValue::Null | RawValue::NotATime => Value::Null,
        RawValue::Bool(v) => Value::Integer(i64::from(v)),
        RawValue::Int(v) => Value::Integer(v),
        RawValue::UInt(v) => match i64::try_from(v) {
            Ok(v) => Value::Integer(v),
            Err(_) => Value::Real(v as f64),
        },
        RawValue::Float(v) if v.is_nan() => Value::Null,
        RawValue::Float(v) => Value::Real(v),
        RawValue::Decimal { digits, scale } => {
            Value::Real(digits as f64 / 10f64.powi(i32::from(scale)))
        }
        RawValue::Text(v) | RawValue::Other(v) => Value::Text(v),
        RawValue::Bytes(v) => Value::Blob(v),
        RawValue::Date(d) => Value::Text(iso_date(d)),
        RawValue::Time(t) => Value::Text(iso_time(t)),
        RawValue::Timestamp { value, offset } => Value::Text(iso_timestamp(value, offset)),
    }
}
