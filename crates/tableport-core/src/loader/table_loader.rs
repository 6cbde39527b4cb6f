use super::CatalogLoader;
use crate::catalog::{
    Catalog, CatalogFactoryRegistry, CatalogTableOperations, FilesystemTableOperations, Table,
    TableOperations,
};
use crate::io::FileIo;
use crate::spec::TableIdent;
use crate::{Error, LoaderError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where a table lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TableSource {
    /// Table metadata read straight from a storage location
    DirectPath {
        location: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    /// Table looked up by name in a catalog
    CatalogRef {
        catalog: CatalogLoader,
        identifier: TableIdent,
    },
}

impl TableSource {
    pub fn identifier(&self) -> TableIdent {
        match self {
            TableSource::DirectPath { location, .. } => TableIdent::from_location(location),
            TableSource::CatalogRef { identifier, .. } => identifier.clone(),
        }
    }
}

impl fmt::Display for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSource::DirectPath { location, .. } => write!(f, "{}", location),
            TableSource::CatalogRef {
                catalog,
                identifier,
            } => write!(f, "{}.{}", catalog.name(), identifier),
        }
    }
}

struct LiveTable {
    table: Arc<Table>,
    catalog: Option<Arc<dyn Catalog>>,
}

/// Serializable handle to a table.
///
/// Only the [`TableSource`] is serialized. A deserialized or cloned loader is
/// always closed; [`TableLoader::open`] rebuilds the catalog connection and
/// storage I/O in the process that calls it.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> tableport_core::Result<()> {
/// use std::collections::BTreeMap;
/// use tableport_core::loader::TableLoader;
///
/// let loader = TableLoader::from_path("/data/warehouse/db/events", BTreeMap::new());
/// let bytes = loader.to_bytes()?;
///
/// // On a worker:
/// let mut remote = TableLoader::from_bytes(&bytes)?;
/// remote.open().await?;
/// let table = remote.load_table()?;
/// println!("{:?}", table.current_snapshot());
/// remote.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct TableLoader {
    source: TableSource,
    registry: Option<Arc<CatalogFactoryRegistry>>,
    live: Option<LiveTable>,
}

impl TableLoader {
    pub fn new(source: TableSource) -> Self {
        Self {
            source,
            registry: None,
            live: None,
        }
    }

    pub fn from_path(location: impl Into<String>, properties: BTreeMap<String, String>) -> Self {
        Self::new(TableSource::DirectPath {
            location: location.into(),
            properties,
        })
    }

    pub fn from_catalog(catalog: CatalogLoader, identifier: TableIdent) -> Self {
        Self::new(TableSource::CatalogRef {
            catalog,
            identifier,
        })
    }

    /// Use `registry` instead of the built-in factories when opening.
    ///
    /// The registry belongs to the local process and is not serialized.
    pub fn with_registry(mut self, registry: Arc<CatalogFactoryRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn source(&self) -> &TableSource {
        &self.source
    }

    pub fn identifier(&self) -> TableIdent {
        self.source.identifier()
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// Resolve the live table and its storage I/O. No-op when already open.
    ///
    /// On failure the loader stays closed and any catalog connection made
    /// along the way is closed again, so `open` can simply be retried.
    pub async fn open(&mut self) -> Result<()> {
        self.open_within(None).await
    }

    /// [`TableLoader::open`] bounded by `timeout`.
    ///
    /// A catalog connected before the deadline is closed again.
    pub async fn open_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let result = self.open_within(Some(&deadline)).await;
        if matches!(result, Err(Error::Loader(LoaderError::OpenTimeout { .. }))) {
            warn!(
                table = %self.source,
                timeout_ms = timeout.as_millis() as u64,
                "Table open timed out"
            );
        }
        result
    }

    async fn open_within(&mut self, deadline: Option<&Deadline>) -> Result<()> {
        if self.live.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        let live = match &self.source {
            TableSource::DirectPath {
                location,
                properties,
            } => open_path(location, properties, deadline).await?,
            TableSource::CatalogRef {
                catalog,
                identifier,
            } => {
                open_catalog_ref(catalog, identifier, self.registry.as_deref(), deadline).await?
            }
        };

        info!(
            table = %self.source,
            version = live.table.state().version,
            duration_ms = start.elapsed().as_millis() as u64,
            "Table opened"
        );

        self.live = Some(live);
        Ok(())
    }

    /// The live table. Fails unless the loader is open.
    pub fn load_table(&self) -> Result<Arc<Table>> {
        self.live
            .as_ref()
            .map(|live| live.table.clone())
            .ok_or_else(|| LoaderError::NotOpen(self.source.to_string()).into())
    }

    /// Reload the live table's metadata.
    pub async fn refresh(&self) -> Result<Arc<Table>> {
        let table = self.load_table()?;
        table.refresh().await?;
        Ok(table)
    }

    /// Release the live table and close its catalog. No-op when closed.
    pub async fn close(&mut self) -> Result<()> {
        let Some(live) = self.live.take() else {
            return Ok(());
        };

        drop(live.table);
        if let Some(catalog) = live.catalog {
            catalog.close().await?;
        }

        info!(table = %self.source, "Table closed");
        Ok(())
    }

    /// Open, run `f` with the live table, then close whatever `f` returned.
    pub async fn with_table<F, Fut, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Table>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.open().await?;
        let result = match self.load_table() {
            Ok(table) => f(table).await,
            Err(e) => Err(e),
        };
        let closed = self.close().await;

        let value = result?;
        closed?;
        Ok(value)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.source)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(serde_json::from_slice(bytes)?))
    }
}

/// Point in time an open must finish by.
struct Deadline {
    at: tokio::time::Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + timeout,
            timeout,
        }
    }

    fn expired(&self) -> Error {
        LoaderError::OpenTimeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
        .into()
    }
}

/// Run one step of an open, failing with `OpenTimeout` past the deadline.
async fn bounded<T, F>(deadline: Option<&Deadline>, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        None => step.await,
        Some(deadline) => tokio::time::timeout_at(deadline.at, step)
            .await
            .unwrap_or_else(|_| Err(deadline.expired())),
    }
}

async fn open_path(
    location: &str,
    properties: &BTreeMap<String, String>,
    deadline: Option<&Deadline>,
) -> Result<LiveTable> {
    let io = FileIo::from_location(location, properties.clone())
        .map_err(|e| LoaderError::IoInitialization(e.to_string()))?;
    let ops = Arc::new(FilesystemTableOperations::new(location, io));
    let state = bounded(deadline, ops.refresh()).await?;

    Ok(LiveTable {
        table: Arc::new(Table::new(TableIdent::from_location(location), ops, state)),
        catalog: None,
    })
}

async fn open_catalog_ref(
    loader: &CatalogLoader,
    identifier: &TableIdent,
    registry: Option<&CatalogFactoryRegistry>,
    deadline: Option<&Deadline>,
) -> Result<LiveTable> {
    let connect = async {
        match registry {
            Some(registry) => loader.load_catalog_with(registry).await,
            None => loader.load_catalog().await,
        }
    };
    let catalog = bounded(deadline, connect).await?;

    match bounded(deadline, resolve_table(&catalog, identifier)).await {
        Ok(table) => Ok(LiveTable {
            table: Arc::new(table),
            catalog: Some(catalog),
        }),
        Err(e) => {
            if let Err(close_err) = catalog.close().await {
                warn!(
                    catalog = %loader.name(),
                    error = %close_err,
                    "Failed to close catalog after open failure"
                );
            }
            Err(e)
        }
    }
}

async fn resolve_table(catalog: &Arc<dyn Catalog>, identifier: &TableIdent) -> Result<Table> {
    let state = catalog.load_table(identifier).await?;
    let ops = CatalogTableOperations::new(catalog.clone(), identifier.clone(), &state.metadata)
        .map_err(|e| LoaderError::IoInitialization(e.to_string()))?;
    Ok(Table::new(identifier.clone(), Arc::new(ops), state))
}

impl Clone for TableLoader {
    /// Clones are closed.
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            registry: self.registry.clone(),
            live: None,
        }
    }
}

impl fmt::Debug for TableLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableLoader")
            .field("source", &self.source)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Serialize for TableLoader {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.source.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TableLoader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        TableSource::deserialize(deserializer).map(TableLoader::new)
    }
}

impl Drop for TableLoader {
    fn drop(&mut self) {
        if self.live.is_some() {
            debug!(table = %self.source, "Table loader dropped while open");
        }
    }
}
