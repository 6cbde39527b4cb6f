//! Table model: schemas, partitioning, data files, manifests, snapshots and
//! the versioned table metadata document.

pub mod data_file;
pub mod manifest;
pub mod partition;
pub mod schema;
pub mod snapshot;
pub mod table_metadata;
pub mod values;

pub use data_file::{DataFile, DataFileBuilder, FileFormat, Metrics};
pub use manifest::{Manifest, ManifestEntry, ManifestFile, ManifestList, ManifestStatus};
pub use partition::{PartitionData, PartitionField, PartitionSpec, PartitionSpecBuilder, Transform};
pub use schema::{NestedField, NullOrder, Schema, SortDirection, SortField, SortOrder};
pub use snapshot::{Operation, RefType, Snapshot, SnapshotRef, Summary, MAIN_BRANCH};
pub use table_metadata::{MetadataLogEntry, SnapshotLogEntry, TableIdent, TableMetadata};
pub use values::{PrimitiveType, Record, Value};
