//! Table schema and sort order.

use super::values::{PrimitiveType, Record, Value};
use crate::{Error, Result, WriteError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named, typed column with a stable field id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedField {
    pub id: i32,
    pub name: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub field_type: PrimitiveType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl NestedField {
    pub fn required(id: i32, name: impl Into<String>, field_type: PrimitiveType) -> Self {
        Self {
            id,
            name: name.into(),
            required: true,
            field_type,
            doc: None,
        }
    }

    pub fn optional(id: i32, name: impl Into<String>, field_type: PrimitiveType) -> Self {
        Self {
            id,
            name: name.into(),
            required: false,
            field_type,
            doc: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

/// Flat table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Schema {
    #[serde(default)]
    pub schema_id: i32,
    pub fields: Vec<NestedField>,
}

impl Schema {
    /// Create a schema, rejecting duplicate field ids or names.
    pub fn new(schema_id: i32, fields: Vec<NestedField>) -> Result<Self> {
        let schema = Self { schema_id, fields };
        schema.validate()?;
        Ok(schema)
    }

    /// Check field ids and names are unique.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for field in &self.fields {
            if !ids.insert(field.id) {
                return Err(Error::Metadata(format!("Duplicate field id {}", field.id)));
            }
            if !names.insert(field.name.as_str()) {
                return Err(Error::Metadata(format!(
                    "Duplicate field name {}",
                    field.name
                )));
            }
        }
        Ok(())
    }

    pub fn field_by_id(&self, id: i32) -> Option<&NestedField> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&NestedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a field within a record.
    pub fn index_of(&self, id: i32) -> Option<usize> {
        self.fields.iter().position(|f| f.id == id)
    }

    pub fn highest_field_id(&self) -> i32 {
        self.fields.iter().map(|f| f.id).max().unwrap_or(0)
    }

    /// Check that a record has one value per field, of the right type, with
    /// no nulls in required fields.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        if record.len() != self.fields.len() {
            return Err(WriteError::InvalidRecord(format!(
                "expected {} values, got {}",
                self.fields.len(),
                record.len()
            ))
            .into());
        }

        for (field, value) in self.fields.iter().zip(record.values()) {
            if value.is_null() && field.required {
                return Err(WriteError::InvalidRecord(format!(
                    "required field {} is null",
                    field.name
                ))
                .into());
            }
            if !value.matches_type(field.field_type) {
                return Err(WriteError::InvalidRecord(format!(
                    "field {} expects {}, got {:?}",
                    field.name, field.field_type, value
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Build a record from a JSON object keyed by field name.
    ///
    /// Missing keys become nulls; unknown keys are rejected.
    pub fn record_from_json(&self, json: &serde_json::Value) -> Result<Record> {
        let object = json.as_object().ok_or_else(|| {
            Error::Write(WriteError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                json
            )))
        })?;

        if let Some(unknown) = object.keys().find(|k| self.field_by_name(k).is_none()) {
            return Err(WriteError::InvalidRecord(format!("unknown field {}", unknown)).into());
        }

        let values = self
            .fields
            .iter()
            .map(|field| match object.get(&field.name) {
                Some(v) => Value::from_json(v, field.field_type),
                None => Ok(Value::Null),
            })
            .collect::<Result<Vec<_>>>()?;

        let record = Record::new(values);
        self.validate_record(&record)?;
        Ok(record)
    }

    /// Render a record as a JSON object keyed by field name.
    pub fn record_to_json(&self, record: &Record) -> serde_json::Value {
        let object = self
            .fields
            .iter()
            .zip(record.values())
            .map(|(field, value)| (field.name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(object)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Null placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NullOrder {
    NullsFirst,
    NullsLast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortField {
    pub source_id: i32,
    pub direction: SortDirection,
    pub null_order: NullOrder,
}

/// Requested write ordering of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SortOrder {
    pub order_id: i32,
    pub fields: Vec<SortField>,
}

impl SortOrder {
    pub fn unsorted() -> Self {
        Self {
            order_id: 0,
            fields: Vec::new(),
        }
    }

    pub fn is_unsorted(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::unsorted()
    }
}
