//! tableport core - access layer for open table formats
//!
//! This library lets distributed processing engines read and append to
//! tables stored as immutable data files plus versioned metadata:
//!
//! - Serializable catalog and table loaders that reconnect on remote workers
//! - Data file writing with column metrics and split offsets
//! - Atomic snapshot appends under optimistic concurrency control

pub mod catalog;
pub mod commit;
pub mod config;
pub mod error;
pub mod io;
pub mod loader;
pub mod spec;
pub mod writer;

// Re-export commonly used types
pub use catalog::{Catalog, CatalogBackend, Table};
pub use commit::{AppendRequest, CommitCoordinator, CommitResult};
pub use config::Config;
pub use error::{CommitError, LoaderError, StorageError, WriteError};
pub use error::{Error, Result};
pub use loader::{CatalogLoader, TableLoader, TableSource};
pub use writer::FileMetadataBuilder;
