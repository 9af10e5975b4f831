use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use treestore_core::{BlobReader, BlobStore, TreeError, SEPARATOR};

/// Blob store keeping one file per node id in a flat directory.
///
/// Layout:
/// ```text
/// {base_dir}/
///   {id}             committed content
///   {id}.tmp         in-flight write, linked into place once complete
/// ```
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf, TreeError> {
        if id.is_empty() || id.contains(SEPARATOR) || id.contains('\\') || id.starts_with('.') {
            return Err(TreeError::Io(format!("Invalid blob id '{}'", id)));
        }
        Ok(self.base_dir.join(id))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, content), level = "debug")]
    async fn save(
        &self,
        id: &str,
        content: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<PathBuf, TreeError> {
        let path = self.blob_path(id)?;

        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            TreeError::Io(format!(
                "Failed to create blob directory {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;

        // Write to a temp file, then publish it with a hard link, which fails
        // instead of replacing content already stored under this id.
        let temp_path = self.base_dir.join(format!("{}.tmp", id));
        let file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(TreeError::Io(format!(
                    "Blob {} is already being written",
                    id
                )));
            }
            Err(e) => {
                return Err(TreeError::Io(format!(
                    "Failed to create temp blob {}: {}",
                    temp_path.display(),
                    e
                )));
            }
        };

        let written = match write_file(file, content).await {
            Ok(written) => written,
            Err(e) => {
                remove_temp(&temp_path).await;
                return Err(TreeError::Io(format!(
                    "Failed to write blob {}: {}",
                    temp_path.display(),
                    e
                )));
            }
        };

        let published = fs::hard_link(&temp_path, &path).await;
        remove_temp(&temp_path).await;
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(TreeError::Io(format!("Blob {} already exists", id)));
            }
            Err(e) => {
                return Err(TreeError::Io(format!(
                    "Failed to publish blob {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        debug!("Saved {} bytes to {}", written, path.display());
        Ok(path)
    }

    #[instrument(skip(self), level = "debug")]
    async fn open(&self, id: &str) -> Result<Option<BlobReader>, TreeError> {
        let path = self.blob_path(id)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TreeError::Io(format!(
                "Failed to open blob {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, id: &str) -> Result<bool, TreeError> {
        let path = self.blob_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted blob {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TreeError::Io(format!(
                "Failed to delete blob {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

async fn write_file(
    mut file: fs::File,
    content: &mut (dyn AsyncRead + Unpin + Send),
) -> std::io::Result<u64> {
    let written = tokio::io::copy(content, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove temp blob {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn setup() -> (LocalBlobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(&temp_dir.path().join("files"));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_open_delete() {
        let (store, _temp) = setup();

        let mut content: &[u8] = b"hello blob";
        let path = store.save("b1", &mut content).await.unwrap();
        assert_eq!(path, store.base_dir().join("b1"));
        assert!(!store.base_dir().join("b1.tmp").exists());

        let mut reader = store.open("b1").await.unwrap().unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"hello blob");

        assert!(store.delete("b1").await.unwrap());
        assert!(!store.delete("b1").await.unwrap());
        assert!(store.open("b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_blob_is_never_replaced() {
        let (store, _temp) = setup();

        let mut first: &[u8] = b"original";
        store.save("b1", &mut first).await.unwrap();

        let mut second: &[u8] = b"intruder";
        let err = store.save("b1", &mut second).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(!store.base_dir().join("b1.tmp").exists());

        let mut reader = store.open("b1").await.unwrap().unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, b"original");
    }

    #[tokio::test]
    async fn test_rejects_ids_escaping_the_directory() {
        let (store, _temp) = setup();
        let mut content: &[u8] = b"x";
        assert!(store.save("../evil", &mut content).await.is_err());
        assert!(store.open("a/b").await.is_err());
        assert!(store.delete("").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("stream reset")))
            }
        }

        let (store, _temp) = setup();
        let mut content = Failing;
        assert!(store.save("b2", &mut content).await.is_err());
        assert!(!store.base_dir().join("b2").exists());
        assert!(!store.base_dir().join("b2.tmp").exists());
    }
}
