//! SQLite metadata store.
//!
//! One shared connection serves the non-transactional repository. Every unit of
//! work opens its own connection and holds `BEGIN IMMEDIATE` until it commits
//! or rolls back, so writers never hit `SQLITE_BUSY` halfway through.

mod repository;
mod unit;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, instrument};
use treestore_core::{system_clock, Clock, DataContext, FileRepository, TreeError, UnitOfWork};

pub use repository::SqlRepository;
pub use unit::SqliteUnitOfWork;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS file_nodes (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    parent_id TEXT NOT NULL,
    is_dir INTEGER NOT NULL,
    name TEXT NOT NULL,
    directory TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);

-- Live siblings have unique names; soft-deleted rows keep theirs.
CREATE UNIQUE INDEX IF NOT EXISTS idx_file_nodes_live_sibling
    ON file_nodes(owner, parent_id, name) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_file_nodes_parent ON file_nodes(owner, parent_id);
CREATE INDEX IF NOT EXISTS idx_file_nodes_directory ON file_nodes(owner, directory);
"#;

/// Metadata store backed by a SQLite database file.
pub struct SqliteDataContext {
    db_path: PathBuf,
    shared: SqlRepository,
    clock: Clock,
}

impl SqliteDataContext {
    /// Open (or create) the database at `path` using the system clock.
    pub fn open(path: &Path) -> Result<Self, TreeError> {
        Self::open_with_clock(path, system_clock())
    }

    /// Open (or create) the database at `path`, stamping rows with `clock`.
    pub fn open_with_clock(path: &Path, clock: Clock) -> Result<Self, TreeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TreeError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TreeError::Database(format!("schema creation failed: {}", e)))?;
        info!("Opened metadata store at {}", path.display());

        Ok(Self {
            db_path: path.to_path_buf(),
            shared: SqlRepository::new(Arc::new(Mutex::new(conn)), clock.clone()),
            clock,
        })
    }
}

#[async_trait]
impl DataContext for SqliteDataContext {
    fn files(&self) -> &dyn FileRepository {
        &self.shared
    }

    #[instrument(skip(self), level = "debug")]
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, TreeError> {
        let db_path = self.db_path.clone();
        let conn = tokio::task::spawn_blocking(move || open_txn_connection(&db_path))
            .await
            .map_err(|e| TreeError::Database(format!("db task join failed: {}", e)))??;

        debug!("Began transaction on {}", self.db_path.display());
        let repo = SqlRepository::new(Arc::new(Mutex::new(conn)), self.clock.clone());
        Ok(Box::new(SqliteUnitOfWork::new(repo)))
    }
}

fn open_connection(path: &Path) -> Result<Connection, TreeError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )
    .map_err(|e| TreeError::Database(format!("open {} failed: {}", path.display(), e)))?;
    init_connection(&conn)?;
    Ok(conn)
}

fn init_connection(conn: &Connection) -> Result<(), TreeError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| TreeError::Database(format!("pragma failed: {}", e)))?;
    Ok(())
}

fn open_txn_connection(path: &Path) -> Result<Connection, TreeError> {
    let conn = open_connection(path)?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| TreeError::Database(format!("begin txn failed: {}", e)))?;
    Ok(conn)
}

pub(crate) fn map_db_err(err: rusqlite::Error) -> TreeError {
    TreeError::Database(format!("db error: {}", err))
}
