use std::path::Path;
use std::sync::Arc;

use treestore_core::{BlobStore, DataContext, NamedLockRegistry, TreeError, TreeService};

use crate::blob::LocalBlobStore;
use crate::metadata::SqliteDataContext;

/// Create the metadata store and blob store.
/// Shared between the command-line binary and the integration tests.
pub fn create_backends(
    database: &Path,
    blob_dir: &Path,
) -> Result<(Arc<dyn DataContext>, Arc<dyn BlobStore>), TreeError> {
    let data: Arc<dyn DataContext> = Arc::new(SqliteDataContext::open(database)?);
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(blob_dir));
    Ok((data, blobs))
}

/// Create a tree service over local backends with a fresh lock registry.
pub fn create_service(database: &Path, blob_dir: &Path) -> Result<TreeService, TreeError> {
    let (data, blobs) = create_backends(database, blob_dir)?;
    Ok(TreeService::new(
        data,
        blobs,
        Arc::new(NamedLockRegistry::new()),
    ))
}
