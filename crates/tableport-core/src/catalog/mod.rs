//! Catalog contract and implementations.
//!
//! A catalog maps table identifiers to versioned metadata and publishes new
//! metadata versions through an atomic compare-and-swap. Implementations:
//!
//! - Filesystem catalog: tables under a warehouse directory or bucket, with
//!   create-only metadata files as the swap primitive
//! - Custom catalogs registered through [`CatalogFactoryRegistry`]

pub mod factory;
pub mod filesystem;
pub mod table;

pub use factory::{CatalogFactory, CatalogFactoryRegistry, FilesystemCatalogFactory};
pub use filesystem::{FilesystemCatalog, FilesystemTableOperations, FilesystemTables};
pub use table::{CatalogTableOperations, Table, TableOperations};

use crate::io::FileIo;
use crate::spec::{PartitionSpec, Schema, SortOrder, TableIdent, TableMetadata};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of catalog a loader connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CatalogBackend {
    /// Tables stored under a warehouse location
    Filesystem,
    /// Catalog built by a factory registered under `implementation`
    Custom { implementation: String },
}

impl fmt::Display for CatalogBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogBackend::Filesystem => write!(f, "filesystem"),
            CatalogBackend::Custom { implementation } => write!(f, "{}", implementation),
        }
    }
}

impl FromStr for CatalogBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(Error::Config("Catalog backend must not be empty".into())),
            "filesystem" | "hadoop" => Ok(CatalogBackend::Filesystem),
            other => Ok(CatalogBackend::Custom {
                implementation: other.to_string(),
            }),
        }
    }
}

/// A table's metadata at one version, as read from its catalog.
///
/// `version` is the optimistic concurrency token: a commit based on this
/// state succeeds only if the catalog still holds this version.
#[derive(Debug, Clone)]
pub struct TableState {
    pub metadata: Arc<TableMetadata>,
    pub metadata_location: String,
    pub version: u64,
}

/// Result of a compare-and-swap on a table's metadata.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The new metadata is now current
    Committed(TableState),
    /// Another writer committed first; nothing was changed
    Conflict(String),
    /// The exchange failed and the new metadata may or may not be current
    Indeterminate(String),
}

/// Everything needed to create a table.
#[derive(Debug, Clone)]
pub struct TableCreation {
    pub schema: Schema,
    pub partition_spec: PartitionSpec,
    pub sort_order: SortOrder,
    pub properties: BTreeMap<String, String>,
    pub location: Option<String>,
}

impl TableCreation {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            partition_spec: PartitionSpec::unpartitioned(),
            sort_order: SortOrder::unsorted(),
            properties: BTreeMap::new(),
            location: None,
        }
    }

    pub fn with_partition_spec(mut self, spec: PartitionSpec) -> Self {
        self.partition_spec = spec;
        self
    }

    pub fn with_sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Initial metadata, placed at the explicit location or `default_location`.
    pub fn into_metadata(self, default_location: &str) -> Result<TableMetadata> {
        let location = self
            .location
            .unwrap_or_else(|| default_location.to_string());
        TableMetadata::new(
            location,
            self.schema,
            self.partition_spec,
            self.sort_order,
            self.properties,
        )
    }
}

/// Live connection to a catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> CatalogBackend;

    /// Configuration the catalog was built from.
    fn properties(&self) -> &BTreeMap<String, String>;

    async fn table_exists(&self, ident: &TableIdent) -> Result<bool>;

    /// Load the current metadata of a table.
    async fn load_table(&self, ident: &TableIdent) -> Result<TableState>;

    async fn create_table(&self, ident: &TableIdent, creation: TableCreation) -> Result<TableState>;

    /// Replace the table's metadata if it is still at `base`'s version.
    async fn commit_table(
        &self,
        ident: &TableIdent,
        base: &TableState,
        metadata: TableMetadata,
    ) -> Result<CommitOutcome>;

    /// File I/O for a table's data and metadata files.
    fn table_io(&self, metadata: &TableMetadata) -> Result<FileIo> {
        FileIo::from_location(&metadata.location, self.properties().clone())
    }

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
