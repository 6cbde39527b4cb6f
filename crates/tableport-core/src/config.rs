//! Configuration structures for tableport.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! The library itself never reads it implicitly: loaders, format properties
//! and coordinator settings are built from it and passed to constructors.

use crate::catalog::CatalogBackend;
use crate::commit::CommitCoordinatorConfig;
use crate::loader::{CatalogLoader, TableLoader};
use crate::spec::{FileFormat, TableIdent, MAIN_BRANCH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Target table
    pub table: TableConfig,

    /// Commit configuration
    #[serde(default)]
    pub commit: CommitConfig,

    /// Data file write configuration
    #[serde(default)]
    pub write: WriteConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Where the table lives.
///
/// Either `location` (a direct path) or `namespace`, `name` and `catalog`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TableConfig {
    /// Table root, e.g. `/data/warehouse/db/events` or `s3://bucket/events`
    pub location: Option<String>,

    /// Namespace levels of a catalog table
    #[serde(default)]
    pub namespace: Vec<String>,

    /// Catalog table name
    pub name: Option<String>,

    /// Catalog holding the table
    pub catalog: Option<CatalogConfig>,

    /// Storage configuration for direct paths (`s3.*` and friends)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Catalog connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Catalog name
    pub name: String,

    /// Backend (`filesystem` or a registered custom implementation)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Catalog properties, e.g. `warehouse`
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Commit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommitConfig {
    /// Maximum retries after a CAS conflict
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Bound on one metadata swap in milliseconds
    pub timeout_ms: Option<u64>,

    /// Branch to commit to
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_wait_ms: default_min_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            timeout_ms: None,
            branch: default_branch(),
        }
    }
}

impl From<&CommitConfig> for CommitCoordinatorConfig {
    fn from(config: &CommitConfig) -> Self {
        CommitCoordinatorConfig {
            max_retries: config.max_retries,
            min_wait_ms: config.min_wait_ms,
            max_wait_ms: config.max_wait_ms,
            commit_timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Data file write configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WriteConfig {
    /// File format of new data files
    #[serde(default)]
    pub format: FileFormat,

    /// Writer properties, filtered per format
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive for an `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions

fn default_backend() -> String {
    "filesystem".to_string()
}

fn default_max_retries() -> u32 {
    4
}

fn default_min_wait_ms() -> u64 {
    100
}

fn default_max_wait_ms() -> u64 {
    60_000
}

fn default_branch() -> String {
    MAIN_BRANCH.to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let table = &self.table;
        match (&table.location, &table.catalog) {
            (Some(_), Some(_)) => {
                return Err(crate::Error::Config(
                    "Table location and catalog are mutually exclusive".into(),
                ));
            }
            (None, None) => {
                return Err(crate::Error::Config(
                    "Either a table location or a catalog is required".into(),
                ));
            }
            (Some(location), None) if location.trim().is_empty() => {
                return Err(crate::Error::Config("Table location is required".into()));
            }
            (None, Some(catalog)) => {
                if catalog.name.is_empty() {
                    return Err(crate::Error::Config("Catalog name is required".into()));
                }
                catalog.backend.parse::<CatalogBackend>()?;
                if table.name.as_deref().map_or(true, str::is_empty) {
                    return Err(crate::Error::Config("Table name is required".into()));
                }
            }
            _ => {}
        }

        if self.commit.branch.is_empty() {
            return Err(crate::Error::Config("Commit branch is required".into()));
        }

        if self.commit.min_wait_ms > self.commit.max_wait_ms {
            return Err(crate::Error::Config(format!(
                "commit.min_wait_ms ({}) exceeds commit.max_wait_ms ({})",
                self.commit.min_wait_ms, self.commit.max_wait_ms
            )));
        }

        if self.commit.timeout_ms == Some(0) {
            return Err(crate::Error::Config(
                "commit.timeout_ms must be positive".into(),
            ));
        }

        if self.write.format != FileFormat::Parquet {
            tracing::warn!(
                format = %self.write.format,
                "Only parquet files can be written; other formats can only be imported"
            );
        }

        Ok(())
    }

    /// Catalog loader for a catalog table, `None` for direct paths.
    pub fn catalog_loader(&self) -> crate::Result<Option<CatalogLoader>> {
        self.table
            .catalog
            .as_ref()
            .map(|catalog| {
                Ok(CatalogLoader::new(
                    catalog.name.clone(),
                    catalog.backend.parse()?,
                    catalog.properties.clone(),
                ))
            })
            .transpose()
    }

    /// Table identifier of a catalog table.
    pub fn table_ident(&self) -> Option<TableIdent> {
        self.table
            .name
            .as_ref()
            .map(|name| TableIdent::new(self.table.namespace.clone(), name.clone()))
    }

    /// Loader for the configured table.
    pub fn table_loader(&self) -> crate::Result<TableLoader> {
        if let Some(location) = &self.table.location {
            return Ok(TableLoader::from_path(
                location.clone(),
                self.table.properties.clone(),
            ));
        }

        let catalog = self
            .catalog_loader()?
            .ok_or_else(|| crate::Error::Config("No catalog configured".into()))?;
        let ident = self
            .table_ident()
            .ok_or_else(|| crate::Error::Config("Table name is required".into()))?;
        Ok(TableLoader::from_catalog(catalog, ident))
    }
}
