use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path separator used by materialized paths.
pub const SEPARATOR: char = '/';

/// Materialized path of the synthetic per-owner root.
pub const ROOT_DIRECTORY: &str = "/";

/// One file or directory in an owner's tree.
///
/// `directory` is the absolute path of the parent directory, not including
/// `name`. It is stored redundantly so reads never walk parents, and the engine
/// keeps it equal to the join of all ancestor names after every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Generated at creation time, never reused
    pub id: String,
    pub owner: String,
    /// Id of the containing directory, or `owner` for root-level nodes
    pub parent_id: String,
    pub is_dir: bool,
    pub name: String,
    /// Materialized path of the parent directory
    pub directory: String,
    /// Byte length (0 for directories)
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileNode {
    /// A node that has not been stored yet. Timestamps are placeholders until
    /// the metadata store stamps them.
    pub fn new(
        id: impl Into<String>,
        owner: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
        is_dir: bool,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            parent_id: parent_id.into(),
            is_dir,
            name: name.into(),
            directory: ROOT_DIRECTORY.to_string(),
            size,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            deleted_at: None,
        }
    }

    /// Absolute path of this node (its directory joined with its name).
    pub fn path(&self) -> String {
        join_path(&self.directory, &self.name)
    }
}

/// Join a directory path and a leaf name.
///
/// `join_path("/", "") == "/"`, `join_path("/", "a") == "/a"`,
/// `join_path("/a", "b") == "/a/b"`.
pub fn join_path(directory: &str, name: &str) -> String {
    let directory = directory.trim_end_matches(SEPARATOR);
    if name.is_empty() {
        return if directory.is_empty() {
            ROOT_DIRECTORY.to_string()
        } else {
            directory.to_string()
        };
    }
    format!("{}{}{}", directory, SEPARATOR, name)
}

/// Whether `path` is `ancestor` itself or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT_DIRECTORY {
        return true;
    }
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Whether `name` can be used as a leaf segment.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(SEPARATOR)
}
