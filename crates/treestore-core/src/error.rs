use thiserror::Error;

/// Errors returned by the tree engine and its collaborators.
///
/// Variants that describe a caller-visible condition carry the operation name
/// and the offending path segment or id. Store failures are kept as strings
/// so backends with unrelated error types can share this enum.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("[{op}] invalid argument '{argument}'")]
    InvalidArgument {
        op: &'static str,
        argument: &'static str,
    },

    #[error("[{op}] ({path}) cannot move a directory into its own subtree")]
    MoveIntoSelf { op: &'static str, path: String },

    #[error("[{op}] ({path}) parent is not a directory")]
    ParentNotDirectory { op: &'static str, path: String },

    #[error("[{op}] ({path}) file already exists")]
    AlreadyExists { op: &'static str, path: String },

    #[error("[{op}] ({path}) file not found")]
    NotFound { op: &'static str, path: String },

    #[error("[{op}] ({path}) directories cannot be downloaded")]
    CannotDownloadDirectory { op: &'static str, path: String },

    #[error("[{op}] ({path}) file content is missing")]
    FileMissing { op: &'static str, path: String },

    #[error("Metadata store error: {0}")]
    Database(String),

    #[error("Blob store error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat classification of [`TreeError`] for callers that branch on the kind
/// of failure rather than its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ParentNotDirectory,
    AlreadyExists,
    NotFound,
    CannotDownloadDirectory,
    FileMissing,
    Internal,
}

impl TreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TreeError::InvalidArgument { .. } | TreeError::MoveIntoSelf { .. } => {
                ErrorKind::InvalidArgument
            }
            TreeError::ParentNotDirectory { .. } => ErrorKind::ParentNotDirectory,
            TreeError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            TreeError::NotFound { .. } => ErrorKind::NotFound,
            TreeError::CannotDownloadDirectory { .. } => ErrorKind::CannotDownloadDirectory,
            TreeError::FileMissing { .. } => ErrorKind::FileMissing,
            TreeError::Database(_) | TreeError::Io(_) | TreeError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn invalid(op: &'static str, argument: &'static str) -> Self {
        TreeError::InvalidArgument { op, argument }
    }

    pub fn not_found(op: &'static str, path: impl Into<String>) -> Self {
        TreeError::NotFound {
            op,
            path: path.into(),
        }
    }

    pub fn parent_not_directory(op: &'static str, path: impl Into<String>) -> Self {
        TreeError::ParentNotDirectory {
            op,
            path: path.into(),
        }
    }

    pub fn already_exists(op: &'static str, path: impl Into<String>) -> Self {
        TreeError::AlreadyExists {
            op,
            path: path.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
