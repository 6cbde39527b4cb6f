//! Snapshots and named refs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the default branch.
pub const MAIN_BRANCH: &str = "main";

/// Summary keys written by appends.
pub mod summary {
    pub const ADDED_DATA_FILES: &str = "added-data-files";
    pub const ADDED_RECORDS: &str = "added-records";
    pub const ADDED_FILES_SIZE: &str = "added-files-size";
    pub const CHANGED_PARTITION_COUNT: &str = "changed-partition-count";
    pub const TOTAL_DATA_FILES: &str = "total-data-files";
    pub const TOTAL_RECORDS: &str = "total-records";
    pub const TOTAL_FILES_SIZE: &str = "total-files-size";
    pub const COMMIT_ID: &str = "commit-id";
    pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

    /// Holds the snapshot operation; never a free-form property.
    pub const OPERATION: &str = "operation";

    /// Keys an append computes itself. Callers may not set them.
    pub const RESERVED: &[&str] = &[
        OPERATION,
        ADDED_DATA_FILES,
        ADDED_RECORDS,
        ADDED_FILES_SIZE,
        CHANGED_PARTITION_COUNT,
        TOTAL_DATA_FILES,
        TOTAL_RECORDS,
        TOTAL_FILES_SIZE,
        COMMIT_ID,
        IDEMPOTENCY_KEY,
    ];

    pub fn is_reserved(key: &str) -> bool {
        RESERVED.contains(&key)
    }
}

/// Kind of change a snapshot made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Append,
    Overwrite,
    Delete,
    Replace,
}

/// Operation plus free-form counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub operation: Operation,
    #[serde(flatten)]
    pub properties: BTreeMap<String, String>,
}

impl Summary {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Numeric summary value, zero when absent or malformed.
    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}

/// Immutable view of the table's file set at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub snapshot_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub timestamp_ms: i64,
    pub manifest_list: String,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<i32>,
}

impl Snapshot {
    pub fn record_count(&self) -> u64 {
        self.summary.get_u64(summary::TOTAL_RECORDS)
    }

    pub fn added_records(&self) -> u64 {
        self.summary.get_u64(summary::ADDED_RECORDS)
    }

    pub fn commit_id(&self) -> Option<&str> {
        self.summary.get(summary::COMMIT_ID)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Branch,
    Tag,
}

/// A named pointer to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotRef {
    pub snapshot_id: i64,
    #[serde(rename = "type")]
    pub ref_type: RefType,
}

impl SnapshotRef {
    pub fn branch(snapshot_id: i64) -> Self {
        Self {
            snapshot_id,
            ref_type: RefType::Branch,
        }
    }

    pub fn tag(snapshot_id: i64) -> Self {
        Self {
            snapshot_id,
            ref_type: RefType::Tag,
        }
    }

    pub fn is_branch(&self) -> bool {
        self.ref_type == RefType::Branch
    }
}
