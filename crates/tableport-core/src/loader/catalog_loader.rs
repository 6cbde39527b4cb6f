use crate::catalog::{Catalog, CatalogBackend, CatalogFactoryRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serializable recipe for a catalog connection.
///
/// Holds the backend kind, the catalog name and its configuration, never a
/// live connection. Every process that receives a loader builds its own
/// catalog with [`CatalogLoader::load_catalog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogLoader {
    name: String,
    backend: CatalogBackend,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl CatalogLoader {
    pub fn new(
        name: impl Into<String>,
        backend: CatalogBackend,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            properties,
        }
    }

    /// Loader for a filesystem catalog; expects a `warehouse` property.
    pub fn filesystem(name: impl Into<String>, properties: BTreeMap<String, String>) -> Self {
        Self::new(name, CatalogBackend::Filesystem, properties)
    }

    /// Loader for a catalog built by a registered custom factory.
    pub fn custom(
        name: impl Into<String>,
        implementation: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        Self::new(
            name,
            CatalogBackend::Custom {
                implementation: implementation.into(),
            },
            properties,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &CatalogBackend {
        &self.backend
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Build a new live catalog with the built-in factories.
    pub async fn load_catalog(&self) -> Result<Arc<dyn Catalog>> {
        self.load_catalog_with(&CatalogFactoryRegistry::with_defaults())
            .await
    }

    /// Build a new live catalog with the factories of `registry`.
    pub async fn load_catalog_with(
        &self,
        registry: &CatalogFactoryRegistry,
    ) -> Result<Arc<dyn Catalog>> {
        registry.create(self).await
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
