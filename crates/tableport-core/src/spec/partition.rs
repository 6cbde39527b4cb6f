//! Partition specs, transforms and partition tuples.

use super::schema::Schema;
use super::values::{date_from_days, timestamp_from_micros, PrimitiveType, Record, Value};
use crate::{Error, Result, WriteError};
use chrono::Datelike;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Partition field ids start here, below are reserved for schema fields.
const PARTITION_FIELD_ID_START: i32 = 1000;

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Transform applied to a source column to derive a partition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    Identity,
    Year,
    Month,
    Day,
    Hour,
    Truncate(u32),
    Void,
}

/// Widest truncate width, so integer widths fit an `i32`.
pub const MAX_TRUNCATE_WIDTH: u32 = i32::MAX as u32;

impl Transform {
    /// Truncate widths must be in `1..=MAX_TRUNCATE_WIDTH`.
    pub fn is_valid(&self) -> bool {
        match self {
            Transform::Truncate(width) => (1..=MAX_TRUNCATE_WIDTH).contains(width),
            _ => true,
        }
    }

    /// Whether the transform can be applied to a column of `source` type.
    pub fn can_transform(&self, source: PrimitiveType) -> bool {
        match self {
            Transform::Identity | Transform::Void => true,
            Transform::Year | Transform::Month | Transform::Day => {
                matches!(source, PrimitiveType::Date | PrimitiveType::Timestamp)
            }
            Transform::Hour => source == PrimitiveType::Timestamp,
            Transform::Truncate(_) => matches!(
                source,
                PrimitiveType::Int
                    | PrimitiveType::Long
                    | PrimitiveType::String
                    | PrimitiveType::Binary
            ),
        }
    }

    /// Type of the partition value produced from a `source` column.
    pub fn result_type(&self, source: PrimitiveType) -> PrimitiveType {
        match self {
            Transform::Identity | Transform::Truncate(_) | Transform::Void => source,
            Transform::Year | Transform::Month | Transform::Hour => PrimitiveType::Int,
            Transform::Day => PrimitiveType::Date,
        }
    }

    /// Apply the transform to a source value. Nulls stay null.
    pub fn apply(&self, value: &Value) -> Result<Value> {
        let unsupported = || {
            Error::Write(WriteError::InvalidPartition(format!(
                "transform {} cannot be applied to {:?}",
                self, value
            )))
        };

        if value.is_null() {
            return Ok(Value::Null);
        }
        if !self.is_valid() {
            return Err(unsupported());
        }

        let result = match (self, value) {
            (Transform::Identity, v) => v.clone(),
            (Transform::Void, _) => Value::Null,
            (Transform::Year, Value::Date(days)) => {
                let date = date_from_days(*days).ok_or_else(unsupported)?;
                Value::Int(date.year() - 1970)
            }
            (Transform::Year, Value::Timestamp(micros)) => {
                let ts = timestamp_from_micros(*micros).ok_or_else(unsupported)?;
                Value::Int(ts.year() - 1970)
            }
            (Transform::Month, Value::Date(days)) => {
                let date = date_from_days(*days).ok_or_else(unsupported)?;
                Value::Int((date.year() - 1970) * 12 + date.month0() as i32)
            }
            (Transform::Month, Value::Timestamp(micros)) => {
                let ts = timestamp_from_micros(*micros).ok_or_else(unsupported)?;
                Value::Int((ts.year() - 1970) * 12 + ts.month0() as i32)
            }
            (Transform::Day, Value::Date(days)) => Value::Date(*days),
            (Transform::Day, Value::Timestamp(micros)) => {
                Value::Date(micros.div_euclid(MICROS_PER_DAY) as i32)
            }
            (Transform::Hour, Value::Timestamp(micros)) => {
                Value::Int(micros.div_euclid(MICROS_PER_HOUR) as i32)
            }
            (Transform::Truncate(width), Value::Int(v)) => {
                let w = i32::try_from(*width).map_err(|_| unsupported())?;
                Value::Int(v.checked_sub(v.rem_euclid(w)).ok_or_else(unsupported)?)
            }
            (Transform::Truncate(width), Value::Long(v)) => {
                let w = i64::from(*width);
                Value::Long(v.checked_sub(v.rem_euclid(w)).ok_or_else(unsupported)?)
            }
            (Transform::Truncate(width), Value::String(s)) => {
                Value::String(s.chars().take(*width as usize).collect())
            }
            (Transform::Truncate(width), Value::Binary(b)) => {
                Value::Binary(b.iter().take(*width as usize).copied().collect())
            }
            _ => return Err(unsupported()),
        };

        Ok(result)
    }

    /// Human-readable form of a transformed value, used in data file paths.
    pub fn to_human_string(&self, value: &Value) -> String {
        match (self, value) {
            (_, Value::Null) => "null".to_string(),
            (Transform::Year, Value::Int(years)) => format!("{:04}", 1970 + years),
            (Transform::Month, Value::Int(months)) => {
                let year = 1970 + months.div_euclid(12);
                let month = months.rem_euclid(12) + 1;
                format!("{:04}-{:02}", year, month)
            }
            (Transform::Hour, Value::Int(hours)) => {
                match timestamp_from_micros(*hours as i64 * MICROS_PER_HOUR) {
                    Some(ts) => ts.format("%Y-%m-%d-%H").to_string(),
                    None => hours.to_string(),
                }
            }
            (_, v) => v.to_string(),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => write!(f, "identity"),
            Transform::Year => write!(f, "year"),
            Transform::Month => write!(f, "month"),
            Transform::Day => write!(f, "day"),
            Transform::Hour => write!(f, "hour"),
            Transform::Truncate(width) => write!(f, "truncate[{}]", width),
            Transform::Void => write!(f, "void"),
        }
    }
}

impl FromStr for Transform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let transform = match s {
            "identity" => Transform::Identity,
            "year" => Transform::Year,
            "month" => Transform::Month,
            "day" => Transform::Day,
            "hour" => Transform::Hour,
            "void" => Transform::Void,
            other => {
                let width = other
                    .strip_prefix("truncate[")
                    .and_then(|rest| rest.strip_suffix(']'))
                    .and_then(|w| w.parse::<u32>().ok())
                    .filter(|w| (1..=MAX_TRUNCATE_WIDTH).contains(w))
                    .ok_or_else(|| Error::Metadata(format!("Unknown transform: {}", other)))?;
                Transform::Truncate(width)
            }
        };
        Ok(transform)
    }
}

impl Serialize for Transform {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Transform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One field of a partition spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionField {
    pub source_id: i32,
    pub field_id: i32,
    pub name: String,
    pub transform: Transform,
}

/// Partition tuple of a data file, one value per partition field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionData {
    values: Vec<Value>,
}

impl PartitionData {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How records of a table are grouped into data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartitionSpec {
    #[serde(default)]
    pub spec_id: i32,
    pub fields: Vec<PartitionField>,
}

impl PartitionSpec {
    pub fn unpartitioned() -> Self {
        Self {
            spec_id: 0,
            fields: Vec::new(),
        }
    }

    pub fn builder(schema: &Schema) -> PartitionSpecBuilder<'_> {
        PartitionSpecBuilder::new(schema)
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.fields.iter().all(|f| f.transform == Transform::Void)
    }

    pub fn last_assigned_field_id(&self) -> i32 {
        self.fields
            .iter()
            .map(|f| f.field_id)
            .max()
            .unwrap_or(PARTITION_FIELD_ID_START - 1)
    }

    /// Check every field references a schema column its transform accepts.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        for field in &self.fields {
            let source = schema.field_by_id(field.source_id).ok_or_else(|| {
                Error::Metadata(format!(
                    "Partition field {} references unknown column {}",
                    field.name, field.source_id
                ))
            })?;
            if !field.transform.is_valid() {
                return Err(Error::Metadata(format!(
                    "Partition field {} has invalid transform {}, width must be 1 to {}",
                    field.name, field.transform, MAX_TRUNCATE_WIDTH
                )));
            }
            if !field.transform.can_transform(source.field_type) {
                return Err(Error::Metadata(format!(
                    "Transform {} cannot be applied to {} column {}",
                    field.transform, source.field_type, source.name
                )));
            }
        }
        Ok(())
    }

    /// Result type of each partition field.
    pub fn partition_type(&self, schema: &Schema) -> Result<Vec<PrimitiveType>> {
        self.fields
            .iter()
            .map(|field| {
                schema
                    .field_by_id(field.source_id)
                    .map(|source| field.transform.result_type(source.field_type))
                    .ok_or_else(|| {
                        Error::Metadata(format!(
                            "Partition field {} references unknown column {}",
                            field.name, field.source_id
                        ))
                    })
            })
            .collect()
    }

    /// Compute the partition tuple of a record, `None` when unpartitioned.
    pub fn partition_for(&self, schema: &Schema, record: &Record) -> Result<Option<PartitionData>> {
        if self.fields.is_empty() {
            return Ok(None);
        }

        let values = self
            .fields
            .iter()
            .map(|field| {
                let index = schema.index_of(field.source_id).ok_or_else(|| {
                    Error::Metadata(format!(
                        "Partition field {} references unknown column {}",
                        field.name, field.source_id
                    ))
                })?;
                let value = record.get(index).unwrap_or(&Value::Null);
                field.transform.apply(value)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(PartitionData::new(values)))
    }

    /// Check a partition tuple matches this spec's arity and result types.
    pub fn validate_partition(
        &self,
        schema: &Schema,
        partition: Option<&PartitionData>,
    ) -> Result<()> {
        match partition {
            None if self.fields.is_empty() => Ok(()),
            None => Err(WriteError::InvalidPartition(format!(
                "spec {} requires {} partition values",
                self.spec_id,
                self.fields.len()
            ))
            .into()),
            Some(data) => {
                let types = self.partition_type(schema)?;
                if data.len() != types.len() {
                    return Err(WriteError::InvalidPartition(format!(
                        "spec {} expects {} partition values, got {}",
                        self.spec_id,
                        types.len(),
                        data.len()
                    ))
                    .into());
                }
                for ((field, ty), value) in self.fields.iter().zip(&types).zip(data.values()) {
                    if !value.matches_type(*ty) {
                        return Err(WriteError::InvalidPartition(format!(
                            "partition field {} expects {}, got {:?}",
                            field.name, ty, value
                        ))
                        .into());
                    }
                }
                Ok(())
            }
        }
    }

    /// Hive-style relative path for a partition tuple, e.g. `day=2024-01-01/region=eu`.
    pub fn partition_to_path(&self, partition: &PartitionData) -> String {
        self.fields
            .iter()
            .zip(partition.values())
            .map(|(field, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(&field.name),
                    urlencoding::encode(&field.transform.to_human_string(value))
                )
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl Default for PartitionSpec {
    fn default() -> Self {
        Self::unpartitioned()
    }
}

/// Builds a partition spec from column names, assigning field ids and names.
pub struct PartitionSpecBuilder<'a> {
    schema: &'a Schema,
    spec_id: i32,
    fields: Vec<PartitionField>,
    error: Option<Error>,
}

impl<'a> PartitionSpecBuilder<'a> {
    fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            spec_id: 0,
            fields: Vec::new(),
            error: None,
        }
    }

    pub fn with_spec_id(mut self, spec_id: i32) -> Self {
        self.spec_id = spec_id;
        self
    }

    pub fn identity(self, column: &str) -> Self {
        self.add(column, Transform::Identity)
    }

    pub fn year(self, column: &str) -> Self {
        self.add(column, Transform::Year)
    }

    pub fn month(self, column: &str) -> Self {
        self.add(column, Transform::Month)
    }

    pub fn day(self, column: &str) -> Self {
        self.add(column, Transform::Day)
    }

    pub fn hour(self, column: &str) -> Self {
        self.add(column, Transform::Hour)
    }

    pub fn truncate(self, column: &str, width: u32) -> Self {
        self.add(column, Transform::Truncate(width))
    }

    /// Add a partition field for `column` with the given transform.
    pub fn add(mut self, column: &str, transform: Transform) -> Self {
        if self.error.is_some() {
            return self;
        }

        let schema = self.schema;
        let Some(source) = schema.field_by_name(column) else {
            self.error = Some(Error::Metadata(format!(
                "Cannot partition by unknown column {}",
                column
            )));
            return self;
        };

        let name = match transform {
            Transform::Identity => source.name.clone(),
            Transform::Year => format!("{}_year", source.name),
            Transform::Month => format!("{}_month", source.name),
            Transform::Day => format!("{}_day", source.name),
            Transform::Hour => format!("{}_hour", source.name),
            Transform::Truncate(_) => format!("{}_trunc", source.name),
            Transform::Void => format!("{}_null", source.name),
        };

        let field_id = PARTITION_FIELD_ID_START + self.fields.len() as i32;
        self.fields.push(PartitionField {
            source_id: source.id,
            field_id,
            name,
            transform,
        });
        self
    }

    pub fn build(self) -> Result<PartitionSpec> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let spec = PartitionSpec {
            spec_id: self.spec_id,
            fields: self.fields,
        };
        spec.validate(self.schema)?;
        Ok(spec)
    }
}
