//! Error types for the tableport core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for tableport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for tableport.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog or table loader error
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Data file write error
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Snapshot commit error
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// Table metadata is malformed or inconsistent
    #[error("Invalid table metadata: {0}")]
    Metadata(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the error is a terminal optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Commit(CommitError::Conflict { .. }))
    }

    /// Whether the outcome of a commit is unknown and needs a metadata refresh.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Error::Commit(CommitError::Indeterminate { .. }))
    }
}

/// Catalog and table loader errors.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Catalog backend unreachable or misconfigured
    #[error("Catalog connection failed for {catalog}: {message}")]
    CatalogConnection { catalog: String, message: String },

    /// Table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table already exists
    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    /// Operation requires an open handle
    #[error("Table loader is not open: {0}")]
    NotOpen(String),

    /// Storage I/O resource could not be created
    #[error("IO initialization failed: {0}")]
    IoInitialization(String),

    /// Opening the table exceeded the caller's timeout
    #[error("Open timed out after {timeout_ms} ms")]
    OpenTimeout { timeout_ms: u64 },
}

/// Storage I/O errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create-only write hit an existing object
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Location cannot be addressed by any supported backend
    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Data file write errors.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Record does not match the table schema
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Partition tuple does not match the partition spec
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// Data file descriptor failed validation
    #[error("Invalid data file: {0}")]
    InvalidDescriptor(String),

    /// No appender exists for the format
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Parquet writer failure
    #[error("Parquet write error: {0}")]
    Parquet(String),

    /// File upload failure
    #[error("File upload error: {0}")]
    Upload(String),
}

/// Snapshot commit errors.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Optimistic concurrency retry budget exhausted
    #[error("Commit conflict after {attempts} attempts: {message}")]
    Conflict { attempts: u32, message: String },

    /// The CAS exchange failed or timed out with an unknown outcome
    #[error("Commit {commit_id} state unknown: {reason}")]
    Indeterminate { commit_id: String, reason: String },

    /// Append called with no files
    #[error("Cannot commit an empty file list")]
    EmptyCommit,

    /// Data files are not valid for the table
    #[error("Commit validation failed: {0}")]
    Validation(String),

    /// Target ref exists but is a tag
    #[error("Ref {0} is a tag, not a branch")]
    RefIsNotBranch(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            object_store::Error::AlreadyExists { path, .. } => StorageError::AlreadyExists(path),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        Error::Storage(err.into())
    }
}
