//! Versioned table metadata documents and table identifiers.

use super::data_file::DataFile;
use super::partition::PartitionSpec;
use super::schema::{Schema, SortOrder};
use super::snapshot::{Snapshot, SnapshotRef, MAIN_BRANCH};
use crate::{CommitError, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

const FORMAT_VERSION: u8 = 2;

/// Qualified table name: namespace segments plus table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdent {
    pub namespace: Vec<String>,
    pub name: String,
}

impl TableIdent {
    pub fn new(namespace: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Parse a dotted name; the last segment is the table name.
    pub fn parse(s: &str) -> Result<Self> {
        let mut segments: Vec<String> = s.split('.').map(str::to_string).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(Error::Config(format!("Invalid table identifier: {:?}", s)));
        }
        let name = segments.pop().unwrap_or_default();
        Ok(Self::new(segments, name))
    }

    /// Identifier of a table addressed directly by its location.
    pub fn from_location(location: &str) -> Self {
        Self::new(Vec::new(), location.trim_end_matches('/'))
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.namespace {
            write!(f, "{}.", segment)?;
        }
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotLogEntry {
    pub snapshot_id: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataLogEntry {
    pub metadata_file: String,
    pub timestamp_ms: i64,
}

/// A table's schema, layout and snapshot history at one metadata version.
///
/// Instances are never modified in place. Commits derive a new document with
/// [`TableMetadata::with_appended_snapshot`] and publish it through a
/// compare-and-swap on the metadata version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    pub format_version: u8,
    pub table_uuid: Uuid,
    pub location: String,
    pub last_sequence_number: i64,
    pub last_updated_ms: i64,
    pub last_column_id: i32,
    pub schemas: Vec<Schema>,
    pub current_schema_id: i32,
    pub partition_specs: Vec<PartitionSpec>,
    pub default_spec_id: i32,
    pub last_partition_id: i32,
    pub sort_orders: Vec<SortOrder>,
    pub default_sort_order_id: i32,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<i64>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
    #[serde(default)]
    pub metadata_log: Vec<MetadataLogEntry>,
    #[serde(default)]
    pub refs: BTreeMap<String, SnapshotRef>,
}

impl TableMetadata {
    /// Metadata for a new, empty table.
    pub fn new(
        location: impl Into<String>,
        schema: Schema,
        partition_spec: PartitionSpec,
        sort_order: SortOrder,
        properties: BTreeMap<String, String>,
    ) -> Result<Self> {
        schema.validate()?;
        partition_spec.validate(&schema)?;
        for field in &sort_order.fields {
            if schema.field_by_id(field.source_id).is_none() {
                return Err(Error::Metadata(format!(
                    "Sort field references unknown column {}",
                    field.source_id
                )));
            }
        }

        Ok(Self {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location: location.into().trim_end_matches('/').to_string(),
            last_sequence_number: 0,
            last_updated_ms: chrono::Utc::now().timestamp_millis(),
            last_column_id: schema.highest_field_id(),
            current_schema_id: schema.schema_id,
            schemas: vec![schema],
            default_spec_id: partition_spec.spec_id,
            last_partition_id: partition_spec.last_assigned_field_id(),
            partition_specs: vec![partition_spec],
            default_sort_order_id: sort_order.order_id,
            sort_orders: vec![sort_order],
            properties,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            metadata_log: Vec::new(),
            refs: BTreeMap::new(),
        })
    }

    pub fn current_schema(&self) -> Result<&Schema> {
        self.schema_by_id(self.current_schema_id).ok_or_else(|| {
            Error::Metadata(format!(
                "Current schema {} not found",
                self.current_schema_id
            ))
        })
    }

    pub fn schema_by_id(&self, schema_id: i32) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.schema_id == schema_id)
    }

    pub fn default_partition_spec(&self) -> Result<&PartitionSpec> {
        self.partition_spec_by_id(self.default_spec_id)
            .ok_or_else(|| {
                Error::Metadata(format!(
                    "Default partition spec {} not found",
                    self.default_spec_id
                ))
            })
    }

    pub fn partition_spec_by_id(&self, spec_id: i32) -> Option<&PartitionSpec> {
        self.partition_specs.iter().find(|s| s.spec_id == spec_id)
    }

    pub fn default_sort_order(&self) -> Option<&SortOrder> {
        self.sort_orders
            .iter()
            .find(|o| o.order_id == self.default_sort_order_id)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn snapshot_by_id(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Snapshot the main branch points to.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id
            .and_then(|id| self.snapshot_by_id(id))
    }

    pub fn snapshot_ref(&self, name: &str) -> Option<&SnapshotRef> {
        self.refs.get(name)
    }

    /// Snapshot a named branch or tag points to.
    pub fn snapshot_for_ref(&self, name: &str) -> Option<&Snapshot> {
        match self.refs.get(name) {
            Some(r) => self.snapshot_by_id(r.snapshot_id),
            None if name == MAIN_BRANCH => self.current_snapshot(),
            None => None,
        }
    }

    /// The snapshot and its ancestors, newest first.
    pub fn ancestors_of(&self, snapshot_id: i64) -> Vec<&Snapshot> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(snapshot_id);
        while let Some(id) = next {
            if !seen.insert(id) {
                break;
            }
            match self.snapshot_by_id(id) {
                Some(snapshot) => {
                    chain.push(snapshot);
                    next = snapshot.parent_snapshot_id;
                }
                None => break,
            }
        }
        chain
    }

    /// History of a branch or tag, newest first.
    pub fn history(&self, ref_name: &str) -> Vec<&Snapshot> {
        self.snapshot_for_ref(ref_name)
            .map(|s| self.ancestors_of(s.snapshot_id))
            .unwrap_or_default()
    }

    /// Check a data file can be registered in this table.
    pub fn validate_data_file(&self, file: &DataFile) -> Result<()> {
        let spec = self.partition_spec_by_id(file.spec_id()).ok_or_else(|| {
            CommitError::Validation(format!(
                "{} uses unknown partition spec {}",
                file.file_path(),
                file.spec_id()
            ))
        })?;
        let schema = self.current_schema()?;
        spec.validate_partition(schema, file.partition())
            .map_err(|e| {
                Error::Commit(CommitError::Validation(format!(
                    "{}: {}",
                    file.file_path(),
                    e
                )))
            })
    }

    /// Derive the next metadata version with `snapshot` committed to `branch`.
    ///
    /// `previous_metadata` is the location of the document this one replaces.
    pub fn with_appended_snapshot(
        &self,
        snapshot: Snapshot,
        branch: &str,
        previous_metadata: Option<&str>,
    ) -> TableMetadata {
        let mut next = self.clone();

        if let Some(location) = previous_metadata {
            next.metadata_log.push(MetadataLogEntry {
                metadata_file: location.to_string(),
                timestamp_ms: self.last_updated_ms,
            });
        }

        next.last_sequence_number = snapshot.sequence_number;
        next.last_updated_ms = snapshot.timestamp_ms;
        next.refs
            .insert(branch.to_string(), SnapshotRef::branch(snapshot.snapshot_id));
        if branch == MAIN_BRANCH {
            next.current_snapshot_id = Some(snapshot.snapshot_id);
            next.snapshot_log.push(SnapshotLogEntry {
                snapshot_id: snapshot.snapshot_id,
                timestamp_ms: snapshot.timestamp_ms,
            });
        }
        next.snapshots.push(snapshot);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::schema::NestedField;
    use crate::spec::snapshot::{Operation, Summary};
    use crate::spec::values::PrimitiveType;

    fn metadata() -> TableMetadata {
        let schema = Schema::new(0, vec![NestedField::required(1, "id", PrimitiveType::Long)])
            .unwrap();
        TableMetadata::new(
            "/warehouse/db/t/",
            schema,
            PartitionSpec::unpartitioned(),
            SortOrder::unsorted(),
            BTreeMap::new(),
        )
        .unwrap()
    }

    fn snapshot(id: i64, parent: Option<i64>, sequence_number: i64) -> Snapshot {
        Snapshot {
            snapshot_id: id,
            parent_snapshot_id: parent,
            sequence_number,
            timestamp_ms: 1_000 + sequence_number,
            manifest_list: format!("/warehouse/db/t/metadata/snap-{}.json", id),
            summary: Summary {
                operation: Operation::Append,
                properties: BTreeMap::new(),
            },
            schema_id: Some(0),
        }
    }

    #[test]
    fn test_table_ident() {
        let ident = TableIdent::parse("db.events").unwrap();
        assert_eq!(ident.namespace, vec!["db".to_string()]);
        assert_eq!(ident.name, "events");
        assert_eq!(ident.to_string(), "db.events");
        assert!(TableIdent::parse("db..events").is_err());
        assert_eq!(TableIdent::from_location("/a/b/").name, "/a/b");
    }

    #[test]
    fn test_new_table_metadata() {
        let metadata = metadata();
        assert_eq!(metadata.location, "/warehouse/db/t");
        assert_eq!(metadata.last_column_id, 1);
        assert_eq!(metadata.last_partition_id, 999);
        assert!(metadata.current_snapshot().is_none());
        assert!(metadata.history(MAIN_BRANCH).is_empty());
    }

    #[test]
    fn test_append_to_main_and_branch() {
        let base = metadata();
        let v2 = base.with_appended_snapshot(snapshot(1, None, 1), MAIN_BRANCH, Some("v1"));
        assert_eq!(v2.current_snapshot_id, Some(1));
        assert_eq!(v2.metadata_log.len(), 1);
        assert_eq!(v2.snapshot_log.len(), 1);

        let v3 = v2.with_appended_snapshot(snapshot(2, Some(1), 2), "exp", Some("v2"));
        assert_eq!(v3.current_snapshot_id, Some(1));
        assert_eq!(v3.snapshot_for_ref("exp").unwrap().snapshot_id, 2);
        assert_eq!(v3.snapshot_for_ref(MAIN_BRANCH).unwrap().snapshot_id, 1);

        let history: Vec<_> = v3.history("exp").iter().map(|s| s.snapshot_id).collect();
        assert_eq!(history, vec![2, 1]);
        assert_eq!(v3.last_sequence_number, 2);
    }

    #[test]
    fn test_metadata_json_roundtrip_keeps_refs() {
        let metadata =
            metadata().with_appended_snapshot(snapshot(7, None, 1), MAIN_BRANCH, None);
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"current-snapshot-id\":7"));
        let back: TableMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
