//! Integration tests for catalog and table loaders.
//!
//! Loaders are serialized, shipped to another thread with its own runtime
//! and reopened there, the way a remote worker would.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tableport_core::catalog::{
    Catalog, CatalogBackend, CatalogFactory, CatalogFactoryRegistry, FilesystemCatalog,
    FilesystemTables, TableCreation,
};
use tableport_core::spec::{NestedField, PrimitiveType, Schema, TableIdent};
use tableport_core::{CatalogLoader, Error, LoaderError, Result, TableLoader};
use tempfile::TempDir;

fn schema() -> Schema {
    Schema::new(
        0,
        vec![
            NestedField::required(1, "id", PrimitiveType::Long),
            NestedField::optional(2, "payload", PrimitiveType::String),
        ],
    )
    .unwrap()
}

fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn catalog_table(temp_dir: &TempDir) -> (CatalogLoader, TableIdent) {
    let warehouse = temp_dir.path().to_str().unwrap().to_string();
    let loader = CatalogLoader::filesystem(
        "prod",
        props(&[("warehouse", &warehouse), ("my_key", "my_value")]),
    );
    let ident = TableIdent::new(vec!["db".into()], "events");

    let catalog = loader.load_catalog().await.unwrap();
    catalog
        .create_table(&ident, TableCreation::new(schema()))
        .await
        .unwrap();
    catalog.close().await.unwrap();

    (loader, ident)
}

/// Builds filesystem catalogs and counts how many it built.
struct CountingFactory {
    created: Arc<AtomicUsize>,
}

#[async_trait]
impl CatalogFactory for CountingFactory {
    async fn create(&self, loader: &CatalogLoader) -> Result<Arc<dyn Catalog>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FilesystemCatalog::new(
            loader.name(),
            loader.properties().clone(),
        )?))
    }

    fn backend(&self) -> CatalogBackend {
        CatalogBackend::Custom {
            implementation: "counting".into(),
        }
    }
}

#[tokio::test]
async fn test_direct_path_round_trip_keeps_configuration() {
    let temp_dir = TempDir::new().unwrap();
    let location = format!("{}/events", temp_dir.path().to_str().unwrap());
    FilesystemTables::new(BTreeMap::new())
        .create(&location, TableCreation::new(schema()))
        .await
        .unwrap();

    let mut original = TableLoader::from_path(&location, props(&[("my_key", "my_value")]));
    original.open().await.unwrap();
    let direct = original.load_table().unwrap();

    let mut restored = TableLoader::from_bytes(&original.to_bytes().unwrap()).unwrap();
    assert!(!restored.is_open());
    restored.open().await.unwrap();
    let table = restored.load_table().unwrap();

    assert_eq!(table.identifier(), direct.identifier());
    assert_eq!(table.io().property("my_key"), Some("my_value"));
    assert_eq!(table.io().properties(), direct.io().properties());
    assert_eq!(table.metadata_location(), direct.metadata_location());

    restored.close().await.unwrap();
    original.close().await.unwrap();
}

#[tokio::test]
async fn test_catalog_round_trip_keeps_configuration() {
    let temp_dir = TempDir::new().unwrap();
    let (catalog, ident) = catalog_table(&temp_dir).await;

    let restored_catalog = CatalogLoader::from_bytes(&catalog.to_bytes().unwrap()).unwrap();
    assert_eq!(restored_catalog, catalog);
    assert_eq!(restored_catalog.property("my_key"), Some("my_value"));

    let loader = TableLoader::from_catalog(catalog, ident.clone());
    let mut restored = TableLoader::from_bytes(&loader.to_bytes().unwrap()).unwrap();
    restored.open().await.unwrap();
    let table = restored.load_table().unwrap();

    assert_eq!(table.identifier(), &ident);
    assert_eq!(table.io().property("my_key"), Some("my_value"));
    assert!(table.current_snapshot().is_none());
    restored.close().await.unwrap();
}

#[test]
fn test_loader_opens_on_another_thread_with_its_own_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (catalog, ident) = runtime.block_on(catalog_table(&temp_dir));

    let bytes = TableLoader::from_catalog(catalog, ident.clone())
        .to_bytes()
        .unwrap();

    let remote_ident = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let mut loader = TableLoader::from_bytes(&bytes)?;
            loader
                .with_table(|table| async move { Ok(table.identifier().clone()) })
                .await
        })
    })
    .join()
    .unwrap()
    .unwrap();

    assert_eq!(remote_ident, ident);
}

#[tokio::test]
async fn test_open_and_close_are_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let (catalog, ident) = catalog_table(&temp_dir).await;

    let created = Arc::new(AtomicUsize::new(0));
    let mut registry = CatalogFactoryRegistry::with_defaults();
    registry.register(Box::new(CountingFactory {
        created: created.clone(),
    }));

    let counting = CatalogLoader::custom("prod", "counting", catalog.properties().clone());
    let mut loader = TableLoader::from_catalog(counting, ident).with_registry(Arc::new(registry));

    loader.open().await.unwrap();
    loader.open().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);

    loader.close().await.unwrap();
    loader.close().await.unwrap();
    assert!(!loader.is_open());
    assert!(matches!(
        loader.load_table(),
        Err(Error::Loader(LoaderError::NotOpen(_)))
    ));

    loader.open().await.unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
    loader.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_open_can_be_retried() {
    let temp_dir = TempDir::new().unwrap();
    let location = format!("{}/late", temp_dir.path().to_str().unwrap());

    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    let err = loader.open().await.unwrap_err();
    assert!(matches!(err, Error::Loader(LoaderError::TableNotFound(_))));
    assert!(!loader.is_open());

    FilesystemTables::new(BTreeMap::new())
        .create(&location, TableCreation::new(schema()))
        .await
        .unwrap();

    loader.open().await.unwrap();
    assert!(loader.load_table().is_ok());
    loader.close().await.unwrap();
}
