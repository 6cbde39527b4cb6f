//! Live table handles.

use super::{Catalog, CommitOutcome, TableState};
use crate::io::FileIo;
use crate::spec::{DataFile, ManifestList, Snapshot, TableIdent, TableMetadata};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Read and swap a single table's metadata.
#[async_trait]
pub trait TableOperations: Send + Sync {
    /// Load the latest metadata.
    async fn refresh(&self) -> Result<TableState>;

    /// Replace the metadata if the table is still at `base`'s version.
    async fn commit(&self, base: &TableState, metadata: TableMetadata) -> Result<CommitOutcome>;

    fn io(&self) -> &FileIo;

    fn location(&self) -> &str;
}

/// Table operations routed through a catalog.
pub struct CatalogTableOperations {
    catalog: Arc<dyn Catalog>,
    ident: TableIdent,
    io: FileIo,
    location: String,
}

impl CatalogTableOperations {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        ident: TableIdent,
        metadata: &TableMetadata,
    ) -> Result<Self> {
        let io = catalog.table_io(metadata)?;
        Ok(Self {
            catalog,
            ident,
            io,
            location: metadata.location.clone(),
        })
    }
}

#[async_trait]
impl TableOperations for CatalogTableOperations {
    async fn refresh(&self) -> Result<TableState> {
        self.catalog.load_table(&self.ident).await
    }

    async fn commit(&self, base: &TableState, metadata: TableMetadata) -> Result<CommitOutcome> {
        self.catalog.commit_table(&self.ident, base, metadata).await
    }

    fn io(&self) -> &FileIo {
        &self.io
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// A table opened from a catalog or a location.
///
/// Holds the last metadata it saw. [`Table::refresh`] and successful commits
/// move it forward; it never moves back to an older version.
pub struct Table {
    ident: TableIdent,
    ops: Arc<dyn TableOperations>,
    state: RwLock<TableState>,
}

impl Table {
    pub fn new(ident: TableIdent, ops: Arc<dyn TableOperations>, state: TableState) -> Self {
        Self {
            ident,
            ops,
            state: RwLock::new(state),
        }
    }

    pub fn identifier(&self) -> &TableIdent {
        &self.ident
    }

    pub fn metadata(&self) -> Arc<TableMetadata> {
        self.state.read().metadata.clone()
    }

    pub fn metadata_location(&self) -> String {
        self.state.read().metadata_location.clone()
    }

    pub fn state(&self) -> TableState {
        self.state.read().clone()
    }

    pub fn location(&self) -> &str {
        self.ops.location()
    }

    pub fn io(&self) -> &FileIo {
        self.ops.io()
    }

    pub fn operations(&self) -> &Arc<dyn TableOperations> {
        &self.ops
    }

    pub fn current_snapshot(&self) -> Option<Snapshot> {
        self.metadata().current_snapshot().cloned()
    }

    pub fn snapshot_for_ref(&self, name: &str) -> Option<Snapshot> {
        self.metadata().snapshot_for_ref(name).cloned()
    }

    /// Snapshots reachable from a branch or tag, newest first.
    pub fn history(&self, ref_name: &str) -> Vec<Snapshot> {
        self.metadata()
            .history(ref_name)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Reload metadata from the catalog.
    pub async fn refresh(&self) -> Result<TableState> {
        let state = self.ops.refresh().await?;
        self.update_state(state.clone());
        Ok(state)
    }

    pub(crate) fn update_state(&self, state: TableState) {
        let mut current = self.state.write();
        if state.version >= current.version {
            debug!(
                table = %self.ident,
                from = current.version,
                to = state.version,
                "Table state advanced"
            );
            *current = state;
        }
    }

    /// Live data files of a snapshot.
    pub async fn data_files(&self, snapshot: &Snapshot) -> Result<Vec<DataFile>> {
        let list = ManifestList::read(self.io(), &snapshot.manifest_list).await?;
        list.data_files(self.io()).await
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Table")
            .field("ident", &self.ident)
            .field("location", &self.ops.location())
            .field("version", &state.version)
            .finish()
    }
}
