use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Readable blob content.
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

/// Content storage for file bytes, addressed by node id.
///
/// Independent of the metadata store: nothing here takes part in a metadata
/// transaction. Implementations must be safe to share between any number of
/// concurrent callers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend name for logging
    fn backend_name(&self) -> &'static str;

    /// Write the whole stream under `id` and return where it was stored.
    /// A failed write leaves no partial blob behind. Content already stored
    /// under `id` is never replaced; saving it again is an error.
    async fn save(
        &self,
        id: &str,
        content: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<PathBuf>;

    /// Open the blob for reading, `None` if it does not exist.
    async fn open(&self, id: &str) -> Result<Option<BlobReader>>;

    /// Remove the blob. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}
