//! Primitive types, typed values and records.

use crate::{Error, Result, WriteError};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Primitive column types supported by the table model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    /// Days since 1970-01-01
    Date,
    /// Microseconds since 1970-01-01T00:00:00, no zone
    Timestamp,
    String,
    Binary,
}

impl PrimitiveType {
    /// Whether values of this type can be NaN.
    pub fn is_floating_point(&self) -> bool {
        matches!(self, PrimitiveType::Float | PrimitiveType::Double)
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveType::Boolean => "boolean",
            PrimitiveType::Int => "int",
            PrimitiveType::Long => "long",
            PrimitiveType::Float => "float",
            PrimitiveType::Double => "double",
            PrimitiveType::Date => "date",
            PrimitiveType::Timestamp => "timestamp",
            PrimitiveType::String => "string",
            PrimitiveType::Binary => "binary",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for PrimitiveType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" => Ok(PrimitiveType::Boolean),
            "int" | "integer" => Ok(PrimitiveType::Int),
            "long" => Ok(PrimitiveType::Long),
            "float" => Ok(PrimitiveType::Float),
            "double" => Ok(PrimitiveType::Double),
            "date" => Ok(PrimitiveType::Date),
            "timestamp" => Ok(PrimitiveType::Timestamp),
            "string" => Ok(PrimitiveType::String),
            "binary" => Ok(PrimitiveType::Binary),
            other => Err(Error::Metadata(format!("Unknown primitive type: {}", other))),
        }
    }
}

/// A single typed datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(#[serde(with = "float_json")] f32),
    Double(#[serde(with = "double_json")] f64),
    Date(i32),
    Timestamp(i64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    /// The primitive type of this value, `None` for null.
    pub fn primitive_type(&self) -> Option<PrimitiveType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(PrimitiveType::Boolean),
            Value::Int(_) => Some(PrimitiveType::Int),
            Value::Long(_) => Some(PrimitiveType::Long),
            Value::Float(_) => Some(PrimitiveType::Float),
            Value::Double(_) => Some(PrimitiveType::Double),
            Value::Date(_) => Some(PrimitiveType::Date),
            Value::Timestamp(_) => Some(PrimitiveType::Timestamp),
            Value::String(_) => Some(PrimitiveType::String),
            Value::Binary(_) => Some(PrimitiveType::Binary),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_nan(&self) -> bool {
        match self {
            Value::Float(v) => v.is_nan(),
            Value::Double(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Whether this value can be stored in a column of type `ty`.
    pub fn matches_type(&self, ty: PrimitiveType) -> bool {
        self.primitive_type().map_or(true, |t| t == ty)
    }

    /// Compare two values of the same type using the column type's order.
    ///
    /// Strings and binaries compare by unsigned bytes. Returns `None` for
    /// nulls, mismatched types and NaN.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (Value::Binary(a), Value::Binary(b)) => Some(a.as_slice().cmp(b.as_slice())),
            _ => None,
        }
    }

    /// Parse a JSON value into a typed value of `ty`.
    ///
    /// Dates accept `YYYY-MM-DD` strings or day numbers; timestamps accept
    /// ISO-8601 strings or microsecond numbers.
    pub fn from_json(json: &serde_json::Value, ty: PrimitiveType) -> Result<Value> {
        use serde_json::Value as Json;

        let invalid = || {
            Error::Write(WriteError::InvalidRecord(format!(
                "cannot convert {} to {}",
                json, ty
            )))
        };

        if json.is_null() {
            return Ok(Value::Null);
        }

        let value = match (ty, json) {
            (PrimitiveType::Boolean, Json::Bool(b)) => Value::Boolean(*b),
            (PrimitiveType::Int, Json::Number(n)) => {
                let v = n.as_i64().ok_or_else(invalid)?;
                Value::Int(i32::try_from(v).map_err(|_| invalid())?)
            }
            (PrimitiveType::Long, Json::Number(n)) => Value::Long(n.as_i64().ok_or_else(invalid)?),
            (PrimitiveType::Float, Json::Number(n)) => {
                Value::Float(n.as_f64().ok_or_else(invalid)? as f32)
            }
            (PrimitiveType::Double, Json::Number(n)) => {
                Value::Double(n.as_f64().ok_or_else(invalid)?)
            }
            (PrimitiveType::Float, Json::String(s)) => {
                Value::Float(parse_non_finite(s).ok_or_else(invalid)? as f32)
            }
            (PrimitiveType::Double, Json::String(s)) => {
                Value::Double(parse_non_finite(s).ok_or_else(invalid)?)
            }
            (PrimitiveType::Date, Json::Number(n)) => {
                let v = n.as_i64().ok_or_else(invalid)?;
                Value::Date(i32::try_from(v).map_err(|_| invalid())?)
            }
            (PrimitiveType::Date, Json::String(s)) => {
                let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| invalid())?;
                Value::Date(days_from_date(date))
            }
            (PrimitiveType::Timestamp, Json::Number(n)) => {
                Value::Timestamp(n.as_i64().ok_or_else(invalid)?)
            }
            (PrimitiveType::Timestamp, Json::String(s)) => {
                Value::Timestamp(parse_timestamp_micros(s).ok_or_else(invalid)?)
            }
            (PrimitiveType::String, Json::String(s)) => Value::String(s.clone()),
            (PrimitiveType::Binary, Json::String(s)) => Value::Binary(s.as_bytes().to_vec()),
            (PrimitiveType::Binary, Json::Array(items)) => {
                let bytes = items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or_else(invalid)
                    })
                    .collect::<Result<Vec<u8>>>()?;
                Value::Binary(bytes)
            }
            _ => return Err(invalid()),
        };

        Ok(value)
    }

    /// Render the value as JSON, the inverse of [`Value::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Int(v) => Json::from(*v),
            Value::Long(v) => Json::from(*v),
            Value::Float(v) => non_finite_name(*v as f64)
                .map(|name| Json::String(name.into()))
                .unwrap_or_else(|| Json::from(*v)),
            Value::Double(v) => non_finite_name(*v)
                .map(|name| Json::String(name.into()))
                .unwrap_or_else(|| Json::from(*v)),
            Value::Date(_) | Value::Timestamp(_) => Json::String(self.to_string()),
            Value::String(s) => Json::String(s.clone()),
            Value::Binary(b) => Json::from(b.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Date(days) => match date_from_days(*days) {
                Some(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                None => write!(f, "{}", days),
            },
            Value::Timestamp(micros) => match DateTime::from_timestamp_micros(*micros) {
                Some(ts) => write!(f, "{}", ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f")),
                None => write!(f, "{}", micros),
            },
            Value::String(s) => write!(f, "{}", s),
            Value::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// A positional row whose values line up with the schema's fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

pub(crate) fn days_from_date(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

pub(crate) fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(chrono::Duration::days(days as i64))
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|ts| ts.naive_utc())
}

/// JSON has no literal for NaN or the infinities, so they travel as strings.
fn non_finite_name(v: f64) -> Option<&'static str> {
    if v.is_nan() {
        Some("NaN")
    } else if v == f64::INFINITY {
        Some("Infinity")
    } else if v == f64::NEG_INFINITY {
        Some("-Infinity")
    } else {
        None
    }
}

fn parse_non_finite(s: &str) -> Option<f64> {
    match s.to_ascii_lowercase().as_str() {
        "nan" => Some(f64::NAN),
        "infinity" | "+infinity" | "inf" => Some(f64::INFINITY),
        "-infinity" | "-inf" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

mod double_json {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        match super::non_finite_name(*v) {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_f64(*v),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(DoubleVisitor)
    }

    struct DoubleVisitor;

    impl<'de> Visitor<'de> for DoubleVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            super::parse_non_finite(v)
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

mod float_json {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        match super::non_finite_name(*v as f64) {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_f32(*v),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        super::double_json::deserialize(deserializer).map(|v| v as f32)
    }
}

fn parse_timestamp_micros(s: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.timestamp_micros());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|ts| ts.and_utc().timestamp_micros())
}
