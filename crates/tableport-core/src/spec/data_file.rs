//! Immutable data file descriptors.

use super::partition::PartitionData;
use super::values::Value;
use crate::{Error, Result, WriteError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Physical format of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Parquet,
    Avro,
    Orc,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Avro => "avro",
            FileFormat::Orc => "orc",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for FileFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parquet" => Ok(FileFormat::Parquet),
            "avro" => Ok(FileFormat::Avro),
            "orc" => Ok(FileFormat::Orc),
            other => Err(WriteError::UnsupportedFormat(other.to_string()).into()),
        }
    }
}

/// Column-level statistics of a data file, keyed by field id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Metrics {
    pub record_count: u64,
    #[serde(default)]
    pub column_sizes: BTreeMap<i32, u64>,
    #[serde(default)]
    pub value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    pub null_value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    pub nan_value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    pub lower_bounds: BTreeMap<i32, Value>,
    #[serde(default)]
    pub upper_bounds: BTreeMap<i32, Value>,
}

/// Descriptor of one immutable data file.
///
/// Created once through [`DataFileBuilder`] and never mutated; snapshots
/// reference descriptors through their manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataFile {
    file_path: String,
    file_format: FileFormat,
    spec_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition: Option<PartitionData>,
    record_count: u64,
    file_size_in_bytes: u64,
    #[serde(default)]
    column_sizes: BTreeMap<i32, u64>,
    #[serde(default)]
    value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    null_value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    nan_value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    lower_bounds: BTreeMap<i32, Value>,
    #[serde(default)]
    upper_bounds: BTreeMap<i32, Value>,
    #[serde(default)]
    split_offsets: Vec<u64>,
}

impl DataFile {
    pub fn builder(format: FileFormat) -> DataFileBuilder {
        DataFileBuilder::new(format)
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn file_format(&self) -> FileFormat {
        self.file_format
    }

    pub fn spec_id(&self) -> i32 {
        self.spec_id
    }

    pub fn partition(&self) -> Option<&PartitionData> {
        self.partition.as_ref()
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn file_size_in_bytes(&self) -> u64 {
        self.file_size_in_bytes
    }

    pub fn column_sizes(&self) -> &BTreeMap<i32, u64> {
        &self.column_sizes
    }

    pub fn value_counts(&self) -> &BTreeMap<i32, u64> {
        &self.value_counts
    }

    pub fn null_value_counts(&self) -> &BTreeMap<i32, u64> {
        &self.null_value_counts
    }

    pub fn nan_value_counts(&self) -> &BTreeMap<i32, u64> {
        &self.nan_value_counts
    }

    pub fn lower_bounds(&self) -> &BTreeMap<i32, Value> {
        &self.lower_bounds
    }

    pub fn upper_bounds(&self) -> &BTreeMap<i32, Value> {
        &self.upper_bounds
    }

    /// Start offsets of independently readable row groups, ascending.
    pub fn split_offsets(&self) -> &[u64] {
        &self.split_offsets
    }
}

/// Builder for [`DataFile`], also used for files written outside this crate.
#[derive(Debug, Clone)]
pub struct DataFileBuilder {
    format: FileFormat,
    path: Option<String>,
    spec_id: i32,
    partition: Option<PartitionData>,
    record_count: Option<u64>,
    file_size: Option<u64>,
    metrics: Metrics,
    split_offsets: Vec<u64>,
}

impl DataFileBuilder {
    pub fn new(format: FileFormat) -> Self {
        Self {
            format,
            path: None,
            spec_id: 0,
            partition: None,
            record_count: None,
            file_size: None,
            metrics: Metrics::default(),
            split_offsets: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_spec_id(mut self, spec_id: i32) -> Self {
        self.spec_id = spec_id;
        self
    }

    pub fn with_partition(mut self, partition: Option<PartitionData>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_record_count(mut self, record_count: u64) -> Self {
        self.record_count = Some(record_count);
        self
    }

    pub fn with_file_size_in_bytes(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    /// Use collected metrics; also sets the record count.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.record_count = Some(metrics.record_count);
        self.metrics = metrics;
        self
    }

    pub fn with_split_offsets(mut self, offsets: Vec<u64>) -> Self {
        self.split_offsets = offsets;
        self
    }

    pub fn build(self) -> Result<DataFile> {
        let invalid = |msg: String| Error::Write(WriteError::InvalidDescriptor(msg));

        let file_path = self
            .path
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("file path is required".into()))?;
        let record_count = self
            .record_count
            .ok_or_else(|| invalid(format!("record count is required for {}", file_path)))?;
        let file_size = self
            .file_size
            .ok_or_else(|| invalid(format!("file size is required for {}", file_path)))?;

        if self.split_offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(format!(
                "split offsets of {} are not strictly increasing: {:?}",
                file_path, self.split_offsets
            )));
        }
        if let Some(last) = self.split_offsets.last() {
            if *last >= file_size {
                return Err(invalid(format!(
                    "split offset {} is beyond the end of {} ({} bytes)",
                    last, file_path, file_size
                )));
            }
        }

        Ok(DataFile {
            file_path,
            file_format: self.format,
            spec_id: self.spec_id,
            partition: self.partition,
            record_count,
            file_size_in_bytes: file_size,
            column_sizes: self.metrics.column_sizes,
            value_counts: self.metrics.value_counts,
            null_value_counts: self.metrics.null_value_counts,
            nan_value_counts: self.metrics.nan_value_counts,
            lower_bounds: self.metrics.lower_bounds,
            upper_bounds: self.metrics.upper_bounds,
            split_offsets: self.split_offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> DataFileBuilder {
        DataFile::builder(FileFormat::Parquet)
            .with_path("/warehouse/t/data/a.parquet")
            .with_record_count(10)
            .with_file_size_in_bytes(4096)
    }

    #[test]
    fn test_build_pre_written_file() {
        let file = builder().with_split_offsets(vec![4, 2048]).build().unwrap();
        assert_eq!(file.record_count(), 10);
        assert_eq!(file.split_offsets(), &[4, 2048]);
        assert_eq!(file.file_format(), FileFormat::Parquet);
        assert!(file.partition().is_none());
    }

    #[test]
    fn test_rejects_unordered_offsets() {
        let err = builder().with_split_offsets(vec![4, 4]).build().unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
        assert!(builder().with_split_offsets(vec![4096]).build().is_err());
    }

    #[test]
    fn test_requires_path_and_counts() {
        assert!(DataFile::builder(FileFormat::Avro)
            .with_record_count(1)
            .with_file_size_in_bytes(1)
            .build()
            .is_err());
        assert!(DataFile::builder(FileFormat::Avro)
            .with_path("a.avro")
            .with_file_size_in_bytes(1)
            .build()
            .is_err());
    }

    #[test]
    fn test_file_format_parse() {
        assert_eq!("PARQUET".parse::<FileFormat>().unwrap(), FileFormat::Parquet);
        assert_eq!(FileFormat::Orc.extension(), "orc");
        assert!("csv".parse::<FileFormat>().is_err());
    }
}
