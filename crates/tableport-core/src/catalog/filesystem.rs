//! Filesystem catalog and direct-path tables.
//!
//! ## Layout
//!
//! ```text
//! {table}/metadata/v{N}.metadata.json   one file per metadata version
//! {table}/metadata/version-hint.text    advisory pointer to the latest N
//! {table}/metadata/*.json               manifests and manifest lists
//! {table}/data/...                      data files
//! ```
//!
//! ## Concurrency
//!
//! Committing version N+1 creates `v{N+1}.metadata.json` with create-only
//! semantics. Two writers based on version N race on that file and exactly
//! one wins; the loser sees a conflict. The version hint is written after
//! the swap and may lag behind, so readers probe forward from it.

use super::table::TableOperations;
use super::{Catalog, CatalogBackend, CommitOutcome, TableCreation, TableState};
use crate::io::FileIo;
use crate::spec::{TableIdent, TableMetadata};
use crate::{Error, LoaderError, Result, StorageError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Catalog property naming the warehouse root.
pub const WAREHOUSE: &str = "warehouse";

const METADATA_DIR: &str = "metadata";
const VERSION_HINT_FILE: &str = "version-hint.text";

/// Metadata operations for a table stored at a location.
pub struct FilesystemTableOperations {
    location: String,
    io: FileIo,
}

impl FilesystemTableOperations {
    pub fn new(location: impl Into<String>, io: FileIo) -> Self {
        Self {
            location: location.into().trim_end_matches('/').to_string(),
            io,
        }
    }

    pub fn metadata_location(&self, version: u64) -> String {
        format!(
            "{}/{}/v{}.metadata.json",
            self.location, METADATA_DIR, version
        )
    }

    fn version_hint_location(&self) -> String {
        format!("{}/{}/{}", self.location, METADATA_DIR, VERSION_HINT_FILE)
    }

    async fn read_version_hint(&self) -> Option<u64> {
        let input = self.io.new_input(&self.version_hint_location()).ok()?;
        let bytes = input.read().await.ok()?;
        std::str::from_utf8(&bytes).ok()?.trim().parse().ok()
    }

    async fn write_version_hint(&self, version: u64) {
        let location = self.version_hint_location();
        let result: Result<u64> = async {
            let mut output = self.io.new_output(&location)?;
            write!(output, "{}", version)?;
            output.close().await
        }
        .await;

        if let Err(e) = result {
            warn!(
                location = %location,
                version = version,
                error = %e,
                "Failed to update version hint"
            );
        }
    }

    /// Latest committed metadata version, `None` if the table does not exist.
    pub async fn current_version(&self) -> Result<Option<u64>> {
        let mut version = match self.read_version_hint().await {
            Some(hint) if hint > 0 && self.io.exists(&self.metadata_location(hint)).await? => hint,
            _ => {
                if !self.io.exists(&self.metadata_location(1)).await? {
                    return Ok(None);
                }
                1
            }
        };

        while self.io.exists(&self.metadata_location(version + 1)).await? {
            version += 1;
        }

        Ok(Some(version))
    }

    /// Read the latest metadata, `None` if the table does not exist.
    pub async fn read_state(&self) -> Result<Option<TableState>> {
        let Some(version) = self.current_version().await? else {
            return Ok(None);
        };

        let metadata_location = self.metadata_location(version);
        let bytes = self.io.new_input(&metadata_location)?.read().await?;
        let metadata: TableMetadata = serde_json::from_slice(&bytes)?;

        debug!(
            location = %self.location,
            version = version,
            snapshot_id = ?metadata.current_snapshot_id,
            "Read table metadata"
        );

        Ok(Some(TableState {
            metadata: Arc::new(metadata),
            metadata_location,
            version,
        }))
    }

    /// Publish `metadata` as `version`, only if that version does not exist.
    pub async fn commit_version(
        &self,
        version: u64,
        metadata: TableMetadata,
    ) -> Result<CommitOutcome> {
        let metadata_location = self.metadata_location(version);
        let json = serde_json::to_vec_pretty(&metadata)?;
        let mut output = self.io.new_output(&metadata_location)?;
        output.write_all(&json)?;

        match output.close_new().await {
            Ok(_) => {
                self.write_version_hint(version).await;
                debug!(
                    location = %metadata_location,
                    version = version,
                    "Committed metadata version"
                );
                Ok(CommitOutcome::Committed(TableState {
                    metadata: Arc::new(metadata),
                    metadata_location,
                    version,
                }))
            }
            Err(Error::Storage(StorageError::AlreadyExists(_))) => Ok(CommitOutcome::Conflict(
                format!("metadata version {} of {} already exists", version, self.location),
            )),
            Err(e) => Ok(CommitOutcome::Indeterminate(e.to_string())),
        }
    }

    /// Create the first metadata version.
    pub async fn create(&self, metadata: TableMetadata) -> Result<TableState> {
        match self.commit_version(1, metadata).await? {
            CommitOutcome::Committed(state) => Ok(state),
            CommitOutcome::Conflict(_) => {
                Err(LoaderError::TableAlreadyExists(self.location.clone()).into())
            }
            CommitOutcome::Indeterminate(reason) => Err(StorageError::Backend(format!(
                "creating table at {}: {}",
                self.location, reason
            ))
            .into()),
        }
    }
}

#[async_trait]
impl TableOperations for FilesystemTableOperations {
    async fn refresh(&self) -> Result<TableState> {
        self.read_state()
            .await?
            .ok_or_else(|| LoaderError::TableNotFound(self.location.clone()).into())
    }

    async fn commit(&self, base: &TableState, metadata: TableMetadata) -> Result<CommitOutcome> {
        self.commit_version(base.version + 1, metadata).await
    }

    fn io(&self) -> &FileIo {
        &self.io
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// Tables addressed directly by location, without a catalog.
pub struct FilesystemTables {
    properties: BTreeMap<String, String>,
}

impl FilesystemTables {
    pub fn new(properties: BTreeMap<String, String>) -> Self {
        Self { properties }
    }

    fn operations(&self, location: &str) -> Result<FilesystemTableOperations> {
        let io = FileIo::from_location(location, self.properties.clone())?;
        Ok(FilesystemTableOperations::new(location, io))
    }

    /// Create a table at `location`.
    pub async fn create(&self, location: &str, creation: TableCreation) -> Result<TableState> {
        let ops = self.operations(location)?;
        let metadata = creation.into_metadata(ops.location())?;
        let state = ops.create(metadata).await?;
        info!(location = %location, "Created table");
        Ok(state)
    }

    pub async fn load(&self, location: &str) -> Result<TableState> {
        self.operations(location)?.refresh().await
    }

    pub async fn exists(&self, location: &str) -> Result<bool> {
        Ok(self.operations(location)?.current_version().await?.is_some())
    }
}

/// Catalog of tables stored under `{warehouse}/{namespace...}/{table}`.
pub struct FilesystemCatalog {
    name: String,
    warehouse: String,
    properties: BTreeMap<String, String>,
    io: FileIo,
    closed: AtomicBool,
}

impl FilesystemCatalog {
    pub fn new(name: impl Into<String>, properties: BTreeMap<String, String>) -> Result<Self> {
        let name = name.into();
        let connection_error = |message: String| {
            Error::Loader(LoaderError::CatalogConnection {
                catalog: name.clone(),
                message,
            })
        };

        let warehouse = properties
            .get(WAREHOUSE)
            .filter(|w| !w.is_empty())
            .map(|w| w.trim_end_matches('/').to_string())
            .ok_or_else(|| connection_error(format!("missing {} property", WAREHOUSE)))?;

        let io = FileIo::from_location(&warehouse, properties.clone())
            .map_err(|e| connection_error(e.to_string()))?;

        Ok(Self {
            name,
            warehouse,
            properties,
            io,
            closed: AtomicBool::new(false),
        })
    }

    pub fn warehouse(&self) -> &str {
        &self.warehouse
    }

    /// Default location of a table in this warehouse.
    pub fn table_location(&self, ident: &TableIdent) -> String {
        let mut location = self.warehouse.clone();
        for segment in &ident.namespace {
            location.push('/');
            location.push_str(segment);
        }
        location.push('/');
        location.push_str(&ident.name);
        location
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LoaderError::CatalogConnection {
                catalog: self.name.clone(),
                message: "catalog is closed".into(),
            }
            .into());
        }
        Ok(())
    }

    fn operations(&self, location: &str) -> FilesystemTableOperations {
        FilesystemTableOperations::new(location, self.io.clone())
    }
}

#[async_trait]
impl Catalog for FilesystemCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> CatalogBackend {
        CatalogBackend::Filesystem
    }

    fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    async fn table_exists(&self, ident: &TableIdent) -> Result<bool> {
        self.ensure_open()?;
        let ops = self.operations(&self.table_location(ident));
        Ok(ops.current_version().await?.is_some())
    }

    async fn load_table(&self, ident: &TableIdent) -> Result<TableState> {
        self.ensure_open()?;
        let ops = self.operations(&self.table_location(ident));
        ops.read_state()
            .await?
            .ok_or_else(|| LoaderError::TableNotFound(ident.to_string()).into())
    }

    async fn create_table(
        &self,
        ident: &TableIdent,
        creation: TableCreation,
    ) -> Result<TableState> {
        self.ensure_open()?;
        let default_location = self.table_location(ident);
        let metadata = creation.into_metadata(&default_location)?;
        if metadata.location != default_location {
            return Err(Error::Config(format!(
                "filesystem catalog {} stores {} at {}, not {}",
                self.name, ident, default_location, metadata.location
            )));
        }

        let state = self
            .operations(&default_location)
            .create(metadata)
            .await
            .map_err(|e| match e {
                Error::Loader(LoaderError::TableAlreadyExists(_)) => {
                    Error::Loader(LoaderError::TableAlreadyExists(ident.to_string()))
                }
                other => other,
            })?;

        info!(catalog = %self.name, table = %ident, "Created table");
        Ok(state)
    }

    async fn commit_table(
        &self,
        ident: &TableIdent,
        base: &TableState,
        metadata: TableMetadata,
    ) -> Result<CommitOutcome> {
        self.ensure_open()?;
        self.operations(&self.table_location(ident))
            .commit(base, metadata)
            .await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(catalog = %self.name, "Closed catalog");
        }
        Ok(())
    }
}
