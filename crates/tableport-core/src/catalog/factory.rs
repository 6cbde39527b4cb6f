//! Catalog factory for creating catalog instances.
//!
//! A [`CatalogLoader`] only names a backend and carries its configuration.
//! The registry resolves that name to a factory on whichever process opens
//! the loader. Supported backends:
//!
//! - Filesystem catalog (built in)
//! - Custom backends registered by the host application

use super::filesystem::FilesystemCatalog;
use super::{Catalog, CatalogBackend};
use crate::loader::CatalogLoader;
use crate::{Error, LoaderError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Trait for creating catalog instances.
///
/// Implementations are responsible for validating the loader's configuration
/// and connecting to the backend.
#[async_trait]
pub trait CatalogFactory: Send + Sync {
    /// Create a new, independent catalog instance.
    ///
    /// # Arguments
    /// * `loader` - Catalog name, backend and configuration
    ///
    /// # Returns
    /// A live catalog or an error if the configuration is invalid or the
    /// backend cannot be reached.
    async fn create(&self, loader: &CatalogLoader) -> Result<Arc<dyn Catalog>>;

    /// Get the backend this factory creates.
    fn backend(&self) -> CatalogBackend;

    /// Check if this factory supports the given loader.
    fn supports(&self, loader: &CatalogLoader) -> bool {
        &self.backend() == loader.backend()
    }
}

/// Registry of catalog factories.
///
/// Manages available catalog factory implementations and provides
/// a way to create catalogs from loaders.
pub struct CatalogFactoryRegistry {
    factories: Vec<Box<dyn CatalogFactory>>,
}

impl CatalogFactoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Create a registry with default factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FilesystemCatalogFactory));
        registry
    }

    /// Register a new catalog factory. Later registrations take precedence.
    pub fn register(&mut self, factory: Box<dyn CatalogFactory>) {
        self.factories.insert(0, factory);
    }

    /// Create a catalog instance for a loader.
    pub async fn create(&self, loader: &CatalogLoader) -> Result<Arc<dyn Catalog>> {
        let start = Instant::now();

        let factory = self
            .factories
            .iter()
            .find(|f| f.supports(loader))
            .ok_or_else(|| {
                Error::Loader(LoaderError::CatalogConnection {
                    catalog: loader.name().to_string(),
                    message: format!("no catalog factory for backend {}", loader.backend()),
                })
            })?;

        debug!(
            catalog = %loader.name(),
            backend = %loader.backend(),
            "Creating catalog"
        );

        let catalog = factory.create(loader).await?;

        info!(
            catalog = %loader.name(),
            backend = %loader.backend(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Catalog loaded"
        );

        Ok(catalog)
    }

    /// Get the supported backends.
    pub fn supported_backends(&self) -> Vec<CatalogBackend> {
        self.factories.iter().map(|f| f.backend()).collect()
    }
}

impl Default for CatalogFactoryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Factory for the filesystem catalog.
///
/// Requires the `warehouse` property.
pub struct FilesystemCatalogFactory;

#[async_trait]
impl CatalogFactory for FilesystemCatalogFactory {
    async fn create(&self, loader: &CatalogLoader) -> Result<Arc<dyn Catalog>> {
        let catalog = FilesystemCatalog::new(loader.name(), loader.properties().clone())?;
        Ok(Arc::new(catalog))
    }

    fn backend(&self) -> CatalogBackend {
        CatalogBackend::Filesystem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_registry_with_defaults() {
        let registry = CatalogFactoryRegistry::with_defaults();
        assert_eq!(
            registry.supported_backends(),
            vec![CatalogBackend::Filesystem]
        );
    }

    #[tokio::test]
    async fn test_registry_creates_filesystem_catalog() {
        let temp_dir = TempDir::new().unwrap();
        let mut props = BTreeMap::new();
        props.insert(
            "warehouse".to_string(),
            temp_dir.path().to_str().unwrap().to_string(),
        );
        let loader = CatalogLoader::filesystem("local", props);

        let catalog = CatalogFactoryRegistry::with_defaults()
            .create(&loader)
            .await
            .unwrap();
        assert_eq!(catalog.name(), "local");
        assert_eq!(catalog.backend(), CatalogBackend::Filesystem);
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_backend() {
        let loader = CatalogLoader::custom("remote", "com.example.Unknown", BTreeMap::new());
        let err = CatalogFactoryRegistry::with_defaults()
            .create(&loader)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Loader(LoaderError::CatalogConnection { .. })
        ));
    }

    #[tokio::test]
    async fn test_filesystem_factory_requires_warehouse() {
        let loader = CatalogLoader::filesystem("local", BTreeMap::new());
        let result = FilesystemCatalogFactory.create(&loader).await;
        assert!(result.is_err());
    }
}
