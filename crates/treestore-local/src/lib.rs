//! Local backends for treestore: SQLite metadata and on-disk blobs.

pub mod backends;
pub mod blob;
pub mod config;
pub mod metadata;

pub use backends::{create_backends, create_service};
pub use blob::LocalBlobStore;
pub use metadata::SqliteDataContext;
