//! Serializable catalog and table handles.
//!
//! Loaders carry only identifying data (backend, location or identifier, and
//! a configuration map) so they can be shipped to other processes. Live
//! catalog connections and storage I/O are rebuilt wherever a loader is
//! opened.

mod catalog_loader;
mod table_loader;

pub use catalog_loader::CatalogLoader;
pub use table_loader::{TableLoader, TableSource};
