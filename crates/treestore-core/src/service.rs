//! Tree-consistency engine.
//!
//! Structural operations (create, move, rename, delete) run under the owner's
//! named lock and inside one unit of work. Reads and downloads take no lock and
//! use the committed view.
//!
//! The metadata store and the blob store cannot share a commit, so the engine
//! compensates instead:
//! - create writes the blob first and deletes it again if the metadata side fails
//! - delete removes blobs only after the metadata commit, logging failures
//! - download soft-deletes a row whose blob has disappeared

use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, instrument, warn};

use crate::blob::{BlobReader, BlobStore};
use crate::error::{Result, TreeError};
use crate::lock::NamedLockRegistry;
use crate::node::{is_valid_name, is_within, FileNode, ROOT_DIRECTORY};
use crate::repository::{uuid_generator, DataContext, FileRepository, IdGenerator, UnitOfWork};

/// Outcome of a recursive delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    /// Metadata rows soft-deleted (the target and all descendants)
    pub nodes_deleted: usize,
    /// Blobs removed from the blob store
    pub blobs_deleted: usize,
    /// Ids whose blob could not be removed; their rows are deleted regardless
    pub blob_failures: Vec<String>,
}

/// File tree operations over a metadata store and a blob store.
pub struct TreeService {
    data: Arc<dyn DataContext>,
    blobs: Arc<dyn BlobStore>,
    locks: Arc<NamedLockRegistry>,
    ids: IdGenerator,
}

impl TreeService {
    pub fn new(
        data: Arc<dyn DataContext>,
        blobs: Arc<dyn BlobStore>,
        locks: Arc<NamedLockRegistry>,
    ) -> Self {
        Self {
            data,
            blobs,
            locks,
            ids: uuid_generator(),
        }
    }

    /// Replace the id generator (deterministic ids in tests).
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    fn next_id(&self) -> Result<String> {
        let id = (self.ids)();
        if id.is_empty() {
            return Err(TreeError::Internal("id generator returned an empty id".to_string()));
        }
        Ok(id)
    }

    // =========================================================================
    // Structural operations
    // =========================================================================

    /// Create a directory named `name` under `parent_id` (root when empty).
    #[instrument(skip(self), level = "debug")]
    pub async fn create_directory(
        &self,
        owner: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<FileNode> {
        const OP: &str = "create";
        require(OP, "owner", owner)?;
        require_name(OP, "name", name)?;
        let parent_id = if parent_id.is_empty() { owner } else { parent_id };

        let node = FileNode::new(self.next_id()?, owner, parent_id, name, true, 0);

        let _guard = self.locks.acquire(owner).await;
        let unit = self.data.begin().await?;
        let result = insert_node(OP, unit.files(), node).await;
        let created = finish(OP, unit, result).await?;

        debug!("Created directory {} ({})", created.path(), created.id);
        Ok(created)
    }

    /// Store `content` as a new file named `name` under `parent_id`.
    ///
    /// The blob is written before the owner lock is taken. If the metadata
    /// insert fails the blob is removed again before the error is returned.
    #[instrument(skip(self, content), level = "debug")]
    pub async fn create_file(
        &self,
        owner: &str,
        parent_id: &str,
        name: &str,
        size: u64,
        content: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<FileNode> {
        const OP: &str = "create";
        require(OP, "owner", owner)?;
        require_name(OP, "name", name)?;
        let parent_id = if parent_id.is_empty() { owner } else { parent_id };

        let id = self.next_id()?;
        let stored_at = self.blobs.save(&id, content).await?;
        debug!(
            "Stored blob {} at {} ({} backend)",
            id,
            stored_at.display(),
            self.blobs.backend_name()
        );

        let pending = PendingBlob::new(Arc::clone(&self.blobs), &id);
        let node = FileNode::new(&id, owner, parent_id, name, false, size);
        let result = {
            let _guard = self.locks.acquire(owner).await;
            match self.data.begin().await {
                Ok(unit) => {
                    let result = insert_node(OP, unit.files(), node).await;
                    finish(OP, unit, result).await
                }
                Err(e) => Err(e),
            }
        };

        pending.disarm();
        match result {
            Ok(created) => {
                debug!("Created file {} ({}, {} bytes)", created.path(), created.id, size);
                Ok(created)
            }
            Err(e) => {
                self.discard_orphan_blob(&id).await;
                Err(e)
            }
        }
    }

    /// Delete a node and, for directories, its whole subtree.
    ///
    /// Rows are soft-deleted children first inside one transaction. Blobs are
    /// removed after the commit; a blob that cannot be removed is logged and
    /// reported in the summary but never fails the call.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_file(&self, owner: &str, id: &str) -> Result<DeleteSummary> {
        const OP: &str = "delete";
        require(OP, "owner", owner)?;
        require(OP, "id", id)?;

        let guard = self.locks.acquire(owner).await;
        let unit = self.data.begin().await?;
        let result = delete_subtree(OP, unit.files(), owner, id).await;
        let (nodes_deleted, blob_ids) = finish(OP, unit, result).await?;
        drop(guard);

        let mut summary = DeleteSummary {
            nodes_deleted,
            ..Default::default()
        };
        for blob_id in blob_ids {
            match self.blobs.delete(&blob_id).await {
                Ok(true) => summary.blobs_deleted += 1,
                Ok(false) => {
                    warn!("Blob {} was already gone while deleting {}", blob_id, id);
                }
                Err(e) => {
                    warn!("Failed to delete blob {}: {}", blob_id, e);
                    summary.blob_failures.push(blob_id);
                }
            }
        }

        debug!(
            "Deleted {} ({} nodes, {} blobs, {} blob failures)",
            id,
            summary.nodes_deleted,
            summary.blobs_deleted,
            summary.blob_failures.len()
        );
        Ok(summary)
    }

    /// Move a node under `new_parent_id`, rewriting the materialized path of
    /// every descendant. Moving to the current parent is a no-op.
    #[instrument(skip(self), level = "debug")]
    pub async fn move_file(&self, owner: &str, id: &str, new_parent_id: &str) -> Result<FileNode> {
        const OP: &str = "move";
        require(OP, "owner", owner)?;
        require(OP, "id", id)?;
        require(OP, "new_parent_id", new_parent_id)?;

        let _guard = self.locks.acquire(owner).await;
        let unit = self.data.begin().await?;
        let result = move_node(OP, unit.files(), owner, id, new_parent_id).await;
        finish(OP, unit, result).await
    }

    /// Rename a node. Renaming a directory rewrites the materialized path of
    /// every descendant. Renaming to the current name is a no-op.
    #[instrument(skip(self), level = "debug")]
    pub async fn rename_file(&self, owner: &str, id: &str, new_name: &str) -> Result<FileNode> {
        const OP: &str = "rename";
        require(OP, "owner", owner)?;
        require(OP, "id", id)?;
        require_name(OP, "new_name", new_name)?;

        let _guard = self.locks.acquire(owner).await;
        let unit = self.data.begin().await?;
        let result = rename_node(OP, unit.files(), owner, id, new_name).await;
        finish(OP, unit, result).await
    }

    // =========================================================================
    // Reads (lock-free, committed view)
    // =========================================================================

    /// Open a file's content.
    ///
    /// A row whose blob has disappeared is soft-deleted on the spot and
    /// reported as `FileMissing`.
    #[instrument(skip(self), level = "debug")]
    pub async fn download(&self, owner: &str, id: &str) -> Result<(BlobReader, FileNode)> {
        const OP: &str = "download";
        require(OP, "owner", owner)?;
        require(OP, "id", id)?;

        let files = self.data.files();
        let node = files
            .find_by_id(owner, id)
            .await?
            .ok_or_else(|| TreeError::not_found(OP, id))?;

        if node.is_dir {
            return Err(TreeError::CannotDownloadDirectory {
                op: OP,
                path: node.path(),
            });
        }

        match self.blobs.open(&node.id).await? {
            Some(reader) => Ok((reader, node)),
            None => {
                warn!(
                    "Blob for {} ({}) is missing, removing its metadata",
                    node.path(),
                    node.id
                );
                files.delete_node(&node).await?;
                Err(TreeError::FileMissing {
                    op: OP,
                    path: node.path(),
                })
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn get_file(&self, owner: &str, id: &str) -> Result<FileNode> {
        const OP: &str = "get";
        require(OP, "owner", owner)?;
        require(OP, "id", id)?;

        self.data
            .files()
            .find_by_id(owner, id)
            .await?
            .ok_or_else(|| TreeError::not_found(OP, id))
    }

    /// Children of a directory (root when `parent_id` is empty).
    #[instrument(skip(self), level = "debug")]
    pub async fn list_children(
        &self,
        owner: &str,
        parent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileNode>> {
        const OP: &str = "list";
        require(OP, "owner", owner)?;
        let parent_id = if parent_id.is_empty() { owner } else { parent_id };

        let files = self.data.files();
        if parent_id != owner {
            match files.find_by_id(owner, parent_id).await? {
                None => return Err(TreeError::not_found(OP, parent_id)),
                Some(parent) if !parent.is_dir => {
                    return Err(TreeError::parent_not_directory(OP, parent.path()))
                }
                Some(_) => {}
            }
        }
        files.list_children(owner, parent_id, limit, offset).await
    }

    /// Every node of an owner, ordered by path.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_by_owner(
        &self,
        owner: &str,
        directories_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileNode>> {
        require("list", "owner", owner)?;
        self.data
            .files()
            .list_by_owner(owner, directories_only, limit, offset)
            .await
    }

    async fn discard_orphan_blob(&self, id: &str) {
        match self.blobs.delete(id).await {
            Ok(_) => warn!("Removed blob {} after failed metadata insert", id),
            Err(e) => warn!("Failed to remove orphaned blob {}: {}", id, e),
        }
    }
}

/// A blob written by `create_file` whose metadata row is not settled yet.
///
/// If the create future is dropped while armed, the blob is deleted on a
/// spawned task.
struct PendingBlob {
    blobs: Arc<dyn BlobStore>,
    id: String,
    armed: bool,
}

impl PendingBlob {
    fn new(blobs: Arc<dyn BlobStore>, id: &str) -> Self {
        Self {
            blobs,
            id: id.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to remove blob {} of a cancelled create", self.id);
            return;
        };
        let blobs = Arc::clone(&self.blobs);
        let id = std::mem::take(&mut self.id);
        warn!("Create of {} was cancelled, removing its blob", id);
        handle.spawn(async move {
            if let Err(e) = blobs.delete(&id).await {
                warn!("Failed to remove blob {} of a cancelled create: {}", id, e);
            }
        });
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Commit on success, roll back on failure. A failed rollback is logged and the
/// original error returned.
async fn finish<T>(op: &'static str, unit: Box<dyn UnitOfWork>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            unit.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = unit.rollback().await {
                warn!("Rollback failed in {}: {}", op, rollback_err);
            }
            Err(err)
        }
    }
}

/// Materialized path for children of `parent_id`. The parent must be the
/// owner root or a live directory.
async fn child_directory(
    op: &'static str,
    files: &dyn FileRepository,
    owner: &str,
    parent_id: &str,
) -> Result<String> {
    if parent_id == owner {
        return Ok(ROOT_DIRECTORY.to_string());
    }
    match files.find_by_id(owner, parent_id).await? {
        Some(parent) if parent.is_dir => Ok(parent.path()),
        Some(parent) => Err(TreeError::parent_not_directory(op, parent.path())),
        None => Err(TreeError::parent_not_directory(op, parent_id)),
    }
}

async fn reload(op: &'static str, files: &dyn FileRepository, node: &FileNode) -> Result<FileNode> {
    files
        .find_by_id(&node.owner, &node.id)
        .await?
        .ok_or_else(|| TreeError::not_found(op, node.id.as_str()))
}

async fn insert_node(
    op: &'static str,
    files: &dyn FileRepository,
    mut node: FileNode,
) -> Result<FileNode> {
    node.directory = child_directory(op, files, &node.owner, &node.parent_id).await?;

    if let Some(existing) = files
        .find_by_parent_and_name(&node.owner, &node.parent_id, &node.name)
        .await?
    {
        return Err(TreeError::already_exists(op, existing.path()));
    }

    files.create_node(&node).await?;
    reload(op, files, &node).await
}

/// Soft-delete `id` and everything below it, descendants before ancestors.
/// Returns the number of rows deleted and the ids of plain files.
async fn delete_subtree(
    op: &'static str,
    files: &dyn FileRepository,
    owner: &str,
    id: &str,
) -> Result<(usize, Vec<String>)> {
    let target = files
        .find_by_id(owner, id)
        .await?
        .ok_or_else(|| TreeError::not_found(op, id))?;

    // Pre-order collection; walking it backwards visits every node after all
    // of its descendants.
    let mut pending = vec![target];
    let mut ordered = Vec::new();
    while let Some(node) = pending.pop() {
        if node.is_dir {
            pending.extend(files.list_children(owner, &node.id, 0, 0).await?);
        }
        ordered.push(node);
    }

    let mut blob_ids = Vec::new();
    for node in ordered.iter().rev() {
        files.delete_node(node).await?;
        if !node.is_dir {
            blob_ids.push(node.id.clone());
        }
    }
    Ok((ordered.len(), blob_ids))
}

async fn move_node(
    op: &'static str,
    files: &dyn FileRepository,
    owner: &str,
    id: &str,
    new_parent_id: &str,
) -> Result<FileNode> {
    let mut node = files
        .find_by_id(owner, id)
        .await?
        .ok_or_else(|| TreeError::not_found(op, id))?;

    if node.parent_id == new_parent_id {
        return Ok(node);
    }

    if let Some(existing) = files
        .find_by_parent_and_name(owner, new_parent_id, &node.name)
        .await?
    {
        return Err(TreeError::already_exists(op, existing.path()));
    }

    let directory = child_directory(op, files, owner, new_parent_id).await?;
    if node.is_dir && is_within(&directory, &node.path()) {
        return Err(TreeError::MoveIntoSelf {
            op,
            path: node.path(),
        });
    }

    let old_path = node.path();
    node.parent_id = new_parent_id.to_string();
    let rewritten = rewrite_subtree(files, &mut node, directory).await?;
    debug!("Moved {} to {} ({} rows rewritten)", old_path, node.path(), rewritten);

    reload(op, files, &node).await
}

async fn rename_node(
    op: &'static str,
    files: &dyn FileRepository,
    owner: &str,
    id: &str,
    new_name: &str,
) -> Result<FileNode> {
    let mut node = files
        .find_by_id(owner, id)
        .await?
        .ok_or_else(|| TreeError::not_found(op, id))?;

    if node.name == new_name {
        return Ok(node);
    }

    if let Some(existing) = files
        .find_by_parent_and_name(owner, &node.parent_id, new_name)
        .await?
    {
        return Err(TreeError::already_exists(op, existing.path()));
    }

    let old_path = node.path();
    node.name = new_name.to_string();
    let directory = node.directory.clone();
    let rewritten = rewrite_subtree(files, &mut node, directory).await?;
    debug!("Renamed {} to {} ({} rows rewritten)", old_path, node.path(), rewritten);

    reload(op, files, &node).await
}

/// Store `node` with `directory` as its materialized path and re-root every
/// descendant under the node's new path. The part of each descendant's path
/// below `node` is kept as is. Returns the number of rows written.
async fn rewrite_subtree(
    files: &dyn FileRepository,
    node: &mut FileNode,
    directory: String,
) -> Result<usize> {
    node.directory = directory;
    files.update_node(node).await?;
    let mut rewritten = 1;

    if !node.is_dir {
        return Ok(rewritten);
    }

    let mut pending = vec![(node.id.clone(), node.path())];
    while let Some((parent_id, parent_path)) = pending.pop() {
        for mut child in files.list_children(&node.owner, &parent_id, 0, 0).await? {
            child.directory = parent_path.clone();
            files.update_node(&child).await?;
            rewritten += 1;
            if child.is_dir {
                pending.push((child.id.clone(), child.path()));
            }
        }
    }
    Ok(rewritten)
}

fn require(op: &'static str, argument: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(TreeError::invalid(op, argument));
    }
    Ok(())
}

fn require_name(op: &'static str, argument: &'static str, name: &str) -> Result<()> {
    if !is_valid_name(name) {
        return Err(TreeError::invalid(op, argument));
    }
    Ok(())
}
