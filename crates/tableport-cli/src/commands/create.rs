//! Create command implementation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tableport_core::catalog::{FilesystemTables, TableCreation};
use tableport_core::loader::TableSource;
use tableport_core::spec::{PartitionSpec, Schema, Transform};
use tableport_core::Config;

/// One partition field as written in the partition spec file.
#[derive(Debug, Deserialize)]
struct PartitionFieldArg {
    column: String,
    transform: Transform,
}

/// Create the configured table.
pub async fn run(config: &Config, schema_path: &Path, partition_path: Option<&Path>) -> Result<()> {
    let schema: Schema = read_json(schema_path).context("Failed to read schema")?;
    schema.validate()?;

    let mut creation = TableCreation::new(schema.clone());
    if let Some(path) = partition_path {
        let fields: Vec<PartitionFieldArg> =
            read_json(path).context("Failed to read partition spec")?;
        let spec = fields
            .iter()
            .fold(PartitionSpec::builder(&schema), |builder, field| {
                builder.add(&field.column, field.transform)
            })
            .build()?;
        creation = creation.with_partition_spec(spec);
    }

    let loader = config.table_loader()?;
    let state = match loader.source() {
        TableSource::DirectPath {
            location,
            properties,
        } => {
            FilesystemTables::new(properties.clone())
                .create(location, creation)
                .await?
        }
        TableSource::CatalogRef {
            catalog,
            identifier,
        } => {
            let catalog = catalog.load_catalog().await?;
            let created = catalog.create_table(identifier, creation).await;
            catalog.close().await?;
            created?
        }
    };

    println!("Created table at {}", state.metadata.location);
    println!("Metadata: {}", state.metadata_location);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    if content.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(serde_json::from_str(&content)?)
}
