//! # Row Values
//!
//! [`RowValue`] is the only shape a cell takes between the remote JSON rows
//! and the Local Store. Conversion is driven by the column's [`RemoteKind`]
//! and never fails: a value that does not fit its kind is kept as TEXT.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::schema::{LocalColumn, RemoteKind, TemporalKind};
use crate::{CANONICAL_DATETIME_FORMAT, CANONICAL_DATE_FORMAT, CANONICAL_TIME_FORMAT};

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Bytes(Vec<u8>),
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

impl RowValue {
    /// Converts a wire value according to the column kind.
    pub fn from_remote(kind: RemoteKind, value: &Value) -> RowValue {
        if value.is_null() {
            return RowValue::Null;
        }

        match kind {
            RemoteKind::Integer => integer_value(value),
            RemoteKind::Float => float_value(value),
            RemoteKind::Boolean => boolean_value(value),
            RemoteKind::Temporal(temporal) => temporal_value(temporal, value),
            RemoteKind::Json => match value {
                Value::String(s) => RowValue::Text(s.clone()),
                other => RowValue::Text(other.to_string()),
            },
            RemoteKind::Bytes => bytes_value(value),
            RemoteKind::Text | RemoteKind::Unknown => text_value(value),
        }
    }

    /// Normalizes to a SQLite storage class. Booleans become 0/1.
    pub fn into_storage(self) -> RowValue {
        match self {
            RowValue::Boolean(b) => RowValue::Integer(i64::from(b)),
            other => other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }

    /// JSON form, used when reporting mirrored rows.
    pub fn to_json(&self) -> Value {
        match self {
            RowValue::Null => Value::Null,
            RowValue::Integer(i) => Value::from(*i),
            RowValue::Real(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            RowValue::Text(s) => Value::String(s.clone()),
            RowValue::Boolean(b) => Value::Bool(*b),
            RowValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
        }
    }
}

fn text_value(value: &Value) -> RowValue {
    match value {
        Value::String(s) => RowValue::Text(s.clone()),
        other => RowValue::Text(other.to_string()),
    }
}

fn integer_value(value: &Value) -> RowValue {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                RowValue::Integer(i)
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0 && fits_i64(*f)) {
                RowValue::Integer(f as i64)
            } else {
                RowValue::Text(n.to_string())
            }
        }
        Value::Bool(b) => RowValue::Integer(i64::from(*b)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(RowValue::Integer)
            .unwrap_or_else(|_| RowValue::Text(s.clone())),
        other => RowValue::Text(other.to_string()),
    }
}

/// `i64::MAX as f64` rounds up to 2^63, so the upper bound is exclusive.
fn fits_i64(f: f64) -> bool {
    f >= i64::MIN as f64 && f < i64::MAX as f64
}

fn float_value(value: &Value) -> RowValue {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(RowValue::Real)
            .unwrap_or_else(|| RowValue::Text(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(RowValue::Real)
            .unwrap_or_else(|_| RowValue::Text(s.clone())),
        other => RowValue::Text(other.to_string()),
    }
}

fn boolean_value(value: &Value) -> RowValue {
    match value {
        Value::Bool(b) => RowValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => RowValue::Boolean(false),
            Some(1) => RowValue::Boolean(true),
            _ => RowValue::Text(n.to_string()),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => RowValue::Boolean(true),
            "false" | "f" | "no" | "n" | "0" => RowValue::Boolean(false),
            _ => RowValue::Text(s.clone()),
        },
        other => RowValue::Text(other.to_string()),
    }
}

fn bytes_value(value: &Value) -> RowValue {
    match value {
        Value::String(s) => BASE64
            .decode(s.trim())
            .map(RowValue::Bytes)
            .unwrap_or_else(|_| RowValue::Text(s.clone())),
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            match bytes {
                Some(bytes) => RowValue::Bytes(bytes),
                None => RowValue::Text(value.to_string()),
            }
        }
        other => RowValue::Text(other.to_string()),
    }
}

fn temporal_value(kind: TemporalKind, value: &Value) -> RowValue {
    let parsed = match value {
        Value::String(s) => parse_temporal(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|dt| Parsed::DateTime(dt.naive_utc())),
        _ => None,
    };

    let Some(parsed) = parsed else {
        return text_value(value);
    };

    let text = match (kind, parsed) {
        (TemporalKind::DateTime, Parsed::DateTime(dt)) => {
            dt.format(CANONICAL_DATETIME_FORMAT).to_string()
        }
        (TemporalKind::DateTime, Parsed::Date(d)) => d
            .and_time(NaiveTime::MIN)
            .format(CANONICAL_DATETIME_FORMAT)
            .to_string(),
        (TemporalKind::Date, Parsed::DateTime(dt)) => dt.date().format(CANONICAL_DATE_FORMAT).to_string(),
        (TemporalKind::Date, Parsed::Date(d)) => d.format(CANONICAL_DATE_FORMAT).to_string(),
        (TemporalKind::Time, Parsed::DateTime(dt)) => dt.time().format(CANONICAL_TIME_FORMAT).to_string(),
        (TemporalKind::Time, Parsed::Time(t)) => t.format(CANONICAL_TIME_FORMAT).to_string(),
        (_, _) => return text_value(value),
    };

    RowValue::Text(text)
}

enum Parsed {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// Offset-carrying inputs are converted to UTC first.
fn parse_temporal(s: &str) -> Option<Parsed> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Parsed::DateTime(dt.with_timezone(&Utc).naive_utc()));
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(Parsed::DateTime(dt.with_timezone(&Utc).naive_utc()));
        }
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Parsed::DateTime(dt));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, CANONICAL_DATE_FORMAT) {
        return Some(Parsed::Date(d));
    }
    for format in TIME_FORMATS {
        if let Ok(t) = NaiveTime::parse_from_str(s, format) {
            return Some(Parsed::Time(t));
        }
    }
    None
}

/// Converts one wire row into values in column order.
///
/// Object rows are matched by column name (missing keys are NULL, unknown
/// keys ignored). Array rows are positional and must match the column count.
pub fn convert_row(columns: &[LocalColumn], row: &Value) -> CoreResult<Vec<RowValue>> {
    match row {
        Value::Object(map) => Ok(columns
            .iter()
            .map(|col| {
                map.get(&col.name)
                    .map(|v| RowValue::from_remote(col.kind, v))
                    .unwrap_or(RowValue::Null)
            })
            .collect()),
        Value::Array(items) => {
            if items.len() != columns.len() {
                return Err(CoreError::RowWidthMismatch {
                    expected: columns.len(),
                    actual: items.len(),
                });
            }
            Ok(columns
                .iter()
                .zip(items)
                .map(|(col, v)| RowValue::from_remote(col.kind, v))
                .collect())
        }
        other => Err(ValidationError::InvalidFormat {
            field: "row".to_string(),
            reason: format!("expected object or array, got {}", json_type_name(other)),
        }
        .into()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
