//! Arrow array cells as raw engine values.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Decimal128Type, Float32Type, Float64Type, Int16Type,
    Int32Type, Int64Type, Int8Type, Time32MillisecondType, Time32SecondType,
    Time64MicrosecondType, Time64NanosecondType, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use super::RawValue;

const UNIX_EPOCH_JULIAN_DAY: i32 = 2_440_588;
const NANOS_PER_DAY: i64 = 86_400_000_000_000;

/// Extracts the value at `row` of `array` as a [`RawValue`].
///
/// Types without a dedicated mapping are rendered with Arrow's display
/// formatter and surface as [`RawValue::Other`].
pub fn raw_value(array: &dyn Array, row: usize) -> RawValue {
    if array.is_null(row) {
        return RawValue::Null;
    }
    match array.data_type() {
        DataType::Null => RawValue::Null,
        DataType::Boolean => RawValue::Bool(array.as_boolean().value(row)),
        DataType::Int8 => RawValue::Int(i64::from(array.as_primitive::<Int8Type>().value(row))),
        DataType::Int16 => RawValue::Int(i64::from(array.as_primitive::<Int16Type>().value(row))),
        DataType::Int32 => RawValue::Int(i64::from(array.as_primitive::<Int32Type>().value(row))),
        DataType::Int64 => RawValue::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => RawValue::UInt(u64::from(array.as_primitive::<UInt8Type>().value(row))),
        DataType::UInt16 => {
            RawValue::UInt(u64::from(array.as_primitive::<UInt16Type>().value(row)))
        }
        DataType::UInt32 => {
            RawValue::UInt(u64::from(array.as_primitive::<UInt32Type>().value(row)))
        }
        DataType::UInt64 => RawValue::UInt(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 => {
            RawValue::Float(f64::from(array.as_primitive::<Float32Type>().value(row)))
        }
        DataType::Float64 => RawValue::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Decimal128(_, scale) => RawValue::Decimal {
            digits: array.as_primitive::<Decimal128Type>().value(row),
            scale: *scale,
        },
        DataType::Decimal256(_, _) => match array_value_to_string(array, row) {
            Ok(text) => match text.parse::<f64>() {
                Ok(value) if value.is_finite() => RawValue::Float(value),
                _ => RawValue::Other(text),
            },
            Err(err) => RawValue::Other(format!("<{}: {err}>", array.data_type())),
        },
        DataType::Utf8 => RawValue::Text(array.as_string::<i32>().value(row).to_owned()),
        DataType::LargeUtf8 => RawValue::Text(array.as_string::<i64>().value(row).to_owned()),
        DataType::Binary => RawValue::Bytes(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => RawValue::Bytes(array.as_binary::<i64>().value(row).to_vec()),
        DataType::Date32 => date_from_days(array.as_primitive::<Date32Type>().value(row)),
        DataType::Date64 => {
            let millis = array.as_primitive::<Date64Type>().value(row);
            match i32::try_from(millis.div_euclid(86_400_000)) {
                Ok(days) => date_from_days(days),
                Err(_) => RawValue::NotATime,
            }
        }
        DataType::Time32(TimeUnit::Second) => time_from_nanos(
            i64::from(array.as_primitive::<Time32SecondType>().value(row)) * 1_000_000_000,
        ),
        DataType::Time32(TimeUnit::Millisecond) => time_from_nanos(
            i64::from(array.as_primitive::<Time32MillisecondType>().value(row)) * 1_000_000,
        ),
        DataType::Time64(TimeUnit::Microsecond) => time_from_nanos(
            array
                .as_primitive::<Time64MicrosecondType>()
                .value(row)
                .saturating_mul(1_000),
        ),
        DataType::Time64(TimeUnit::Nanosecond) => {
            time_from_nanos(array.as_primitive::<Time64NanosecondType>().value(row))
        }
        DataType::Timestamp(unit, tz) => {
            let nanos = match unit {
                TimeUnit::Second => {
                    i128::from(array.as_primitive::<TimestampSecondType>().value(row))
                        * 1_000_000_000
                }
                TimeUnit::Millisecond => {
                    i128::from(array.as_primitive::<TimestampMillisecondType>().value(row))
                        * 1_000_000
                }
                TimeUnit::Microsecond => {
                    i128::from(array.as_primitive::<TimestampMicrosecondType>().value(row)) * 1_000
                }
                TimeUnit::Nanosecond => {
                    i128::from(array.as_primitive::<TimestampNanosecondType>().value(row))
                }
            };
            timestamp_from_nanos(nanos, tz.as_deref())
        }
        _ => match array_value_to_string(array, row) {
            Ok(text) => RawValue::Other(text),
            Err(err) => RawValue::Other(format!("<{}: {err}>", array.data_type())),
        },
    }
}

/// Materializes every row of `batch` as raw values, columns in schema order.
pub fn record_batch_rows(batch: &RecordBatch) -> Vec<Vec<RawValue>> {
    let columns = batch.columns();
    (0..batch.num_rows())
        .map(|row| {
            columns
                .iter()
                .map(|column| raw_value(column.as_ref(), row))
                .collect()
        })
        .collect()
}

fn date_from_days(days: i32) -> RawValue {
    days.checked_add(UNIX_EPOCH_JULIAN_DAY)
        .and_then(|julian| Date::from_julian_day(julian).ok())
        .map(RawValue::Date)
        .unwrap_or(RawValue::NotATime)
}

fn time_from_nanos(nanos: i64) -> RawValue {
    if !(0..NANOS_PER_DAY).contains(&nanos) {
        return RawValue::NotATime;
    }
    let secs = nanos / 1_000_000_000;
    let sub = (nanos % 1_000_000_000) as u32;
    let hour = (secs / 3_600) as u8;
    let minute = ((secs % 3_600) / 60) as u8;
    let second = (secs % 60) as u8;
    Time::from_hms_nano(hour, minute, second, sub)
        .map(RawValue::Time)
        .unwrap_or(RawValue::NotATime)
}

fn timestamp_from_nanos(nanos: i128, tz: Option<&str>) -> RawValue {
    let Ok(instant) = OffsetDateTime::from_unix_timestamp_nanos(nanos) else {
        return RawValue::NotATime;
    };
    match tz {
        None => RawValue::Timestamp {
            value: PrimitiveDateTime::new(instant.date(), instant.time()),
            offset: None,
        },
        Some(tz) => {
            let offset = parse_fixed_offset(tz).unwrap_or(UtcOffset::UTC);
            let Some(local) = instant.checked_to_offset(offset) else {
                return RawValue::NotATime;
            };
            RawValue::Timestamp {
                value: PrimitiveDateTime::new(local.date(), local.time()),
                offset: Some(offset),
            }
        }
    }
}

/// Parses `Z`, `UTC`, `+HH:MM`, `-HHMM`, or `+HH`; named zones yield `None`.
fn parse_fixed_offset(tz: &str) -> Option<UtcOffset> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("z") || tz.eq_ignore_ascii_case("utc") {
        return Some(UtcOffset::UTC);
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1i8, &tz[1..]),
        b'-' => (-1i8, &tz[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i8>().ok()?, 0),
        4 => (digits[..2].parse::<i8>().ok()?, digits[2..].parse::<i8>().ok()?),
        _ => return None,
    };
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).ok()
}
