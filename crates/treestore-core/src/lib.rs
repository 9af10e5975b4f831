//! Core types and traits for the treestore file tree.
//!
//! This crate holds the storage-agnostic pieces:
//! - `FileNode` and path helpers
//! - `FileRepository` / `UnitOfWork` / `DataContext`: the metadata store contract
//! - `BlobStore`: content storage keyed by node id
//! - `NamedLockRegistry`: per-owner serialization of structural mutations
//! - `TreeService`: the tree-consistency engine built on top of them

mod blob;
mod error;
mod lock;
mod node;
mod repository;
mod service;

pub use blob::{BlobReader, BlobStore};
pub use error::{ErrorKind, Result, TreeError};
pub use lock::{NamedLockGuard, NamedLockRegistry};
pub use node::{is_valid_name, is_within, join_path, FileNode, ROOT_DIRECTORY, SEPARATOR};
pub use repository::{
    system_clock, uuid_generator, Clock, DataContext, FileRepository, IdGenerator, UnitOfWork,
};
pub use service::{DeleteSummary, TreeService};
