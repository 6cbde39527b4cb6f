//! Data file writing and descriptor construction.
//!
//! ## Write Flow
//!
//! 1. Validate the partition tuple and records against the table
//! 2. Stream records through a format [`FileAppender`] into an output file
//! 3. Upload the file through the table's [`FileIo`](crate::io::FileIo)
//! 4. Return a [`DataFile`](crate::spec::DataFile) with metrics and split offsets
//!
//! A file that fails at any step is never described by a descriptor, so it
//! can only ever be an orphan.

mod builder;
mod metrics;
pub mod parquet;

pub use builder::FileMetadataBuilder;
pub use metrics::MetricsCollector;
pub use parquet::ParquetAppender;

use crate::spec::{FileFormat, Metrics, Record};
use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;

/// Streams records of one schema into a single data file.
///
/// `metrics`, `split_offsets` and `length` are final once `close` returns.
#[async_trait]
pub trait FileAppender: Send {
    fn append(&mut self, record: &Record) -> Result<()>;

    fn metrics(&self) -> Metrics;

    fn split_offsets(&self) -> Vec<u64>;

    fn length(&self) -> u64;

    /// Finish the file and store it. Calling it again is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Configuration keys a file format recognizes.
fn format_key_pattern(format: FileFormat) -> &'static str {
    match format {
        FileFormat::Parquet => ".*parquet.*",
        FileFormat::Avro => ".*avro.*",
        FileFormat::Orc => "^orc.*",
    }
}

/// The subset of a configuration map that applies to one file format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatProperties {
    format: FileFormat,
    properties: BTreeMap<String, String>,
}

impl FormatProperties {
    /// Keep only the keys that match `format`'s key pattern in full.
    pub fn for_format(format: FileFormat, properties: &BTreeMap<String, String>) -> Result<Self> {
        let pattern = Regex::new(&format!("^(?:{})$", format_key_pattern(format)))
            .map_err(|e| Error::Config(format!("Invalid {} key pattern: {}", format, e)))?;

        let properties = properties
            .iter()
            .filter(|(key, _)| pattern.is_match(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self { format, properties })
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
