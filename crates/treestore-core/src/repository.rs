use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::node::FileNode;

/// Supplies wall-clock time to the metadata store.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Supplies fresh node identifiers to the engine.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Clock backed by the system time.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Identifier generator producing random UUIDs.
pub fn uuid_generator() -> IdGenerator {
    Arc::new(|| uuid::Uuid::new_v4().to_string())
}

/// Owner-scoped CRUD and queries over file nodes.
///
/// Every lookup ignores soft-deleted nodes. `limit == 0` means no limit.
/// Deleting a directory row does not touch its children; recursion belongs to
/// the engine.
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Insert a new node. Stamps `created_at` / `updated_at` on the stored row.
    async fn create_node(&self, node: &FileNode) -> Result<()>;

    /// Persist `parent_id`, `name`, `directory` and `size` of an existing node.
    async fn update_node(&self, node: &FileNode) -> Result<()>;

    /// Soft-delete a single node.
    async fn delete_node(&self, node: &FileNode) -> Result<()>;

    async fn find_by_parent_and_name(
        &self,
        owner: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<FileNode>>;

    async fn find_by_id(&self, owner: &str, id: &str) -> Result<Option<FileNode>>;

    /// Direct children of `parent_id`, ordered by name.
    async fn list_children(
        &self,
        owner: &str,
        parent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileNode>>;

    /// All nodes of an owner ordered by path; only directories when
    /// `directories_only` is set.
    async fn list_by_owner(
        &self,
        owner: &str,
        directories_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileNode>>;
}

/// A metadata-store transaction exposing the repository contract.
///
/// Exactly one of `commit` / `rollback` must be called. Both consume the
/// handle; a handle dropped without either is rolled back by the backend and
/// reported as a bug.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Repository bound to this transaction.
    fn files(&self) -> &dyn FileRepository;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Entry point to the metadata store.
#[async_trait]
pub trait DataContext: Send + Sync {
    /// Non-transactional repository reading the committed view.
    fn files(&self) -> &dyn FileRepository;

    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}
