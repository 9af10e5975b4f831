use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use tracing::{debug, instrument};
use treestore_core::{join_path, Clock, FileNode, FileRepository, TreeError};

use super::map_db_err;

const NODE_COLUMNS: &str =
    "id, owner, parent_id, is_dir, name, directory, size, created_at, updated_at, deleted_at";

/// Column list SQLite reports when `idx_file_nodes_live_sibling` is violated.
const LIVE_SIBLING_COLUMNS: &str = "file_nodes.owner, file_nodes.parent_id, file_nodes.name";

/// Full path of a row, computed in SQL for ordering.
const PATH_EXPR: &str =
    "CASE directory WHEN '/' THEN '/' || name ELSE directory || '/' || name END";

/// `FileRepository` over one SQLite connection.
///
/// Used both for the shared autocommit connection and for the dedicated
/// connection of a unit of work. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqlRepository {
    conn: Arc<Mutex<Connection>>,
    clock: Clock,
}

impl SqlRepository {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, clock: Clock) -> Self {
        Self { conn, clock }
    }

    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, TreeError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, TreeError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn_guard = conn
                .lock()
                .map_err(|e| TreeError::Database(format!("conn lock poisoned: {}", e)))?;
            f(&conn_guard)
        })
        .await
        .map_err(|e| TreeError::Database(format!("db task join failed: {}", e)))?
    }

    fn now_millis(&self) -> i64 {
        (self.clock)().timestamp_millis()
    }
}

#[async_trait]
impl FileRepository for SqlRepository {
    #[instrument(skip(self, node), level = "debug", fields(id = %node.id))]
    async fn create_node(&self, node: &FileNode) -> Result<(), TreeError> {
        let node = node.clone();
        let now = self.now_millis();
        let size = size_to_sql(node.size)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO file_nodes
                    (id, owner, parent_id, is_dir, name, directory, size, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    node.id,
                    node.owner,
                    node.parent_id,
                    node.is_dir,
                    node.name,
                    node.directory,
                    size,
                    now,
                ],
            )
            .map_err(|e| write_err("create", &node, e))?;
            debug!("Inserted node {} at {}", node.id, node.path());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, node), level = "debug", fields(id = %node.id))]
    async fn update_node(&self, node: &FileNode) -> Result<(), TreeError> {
        let node = node.clone();
        let now = self.now_millis();
        let size = size_to_sql(node.size)?;

        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE file_nodes
                     SET parent_id = ?1, name = ?2, directory = ?3, size = ?4, updated_at = ?5
                     WHERE owner = ?6 AND id = ?7 AND deleted_at IS NULL",
                    params![
                        node.parent_id,
                        node.name,
                        node.directory,
                        size,
                        now,
                        node.owner,
                        node.id,
                    ],
                )
                .map_err(|e| write_err("update", &node, e))?;
            if changed == 0 {
                return Err(TreeError::not_found("update", node.id.as_str()));
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, node), level = "debug", fields(id = %node.id))]
    async fn delete_node(&self, node: &FileNode) -> Result<(), TreeError> {
        let owner = node.owner.clone();
        let id = node.id.clone();
        let now = self.now_millis();

        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE file_nodes SET deleted_at = ?1, updated_at = ?1
                     WHERE owner = ?2 AND id = ?3 AND deleted_at IS NULL",
                    params![now, owner, id],
                )
                .map_err(map_db_err)?;
            if changed == 0 {
                debug!("Node {} was already deleted", id);
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_by_parent_and_name(
        &self,
        owner: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<FileNode>, TreeError> {
        let sql = format!(
            "SELECT {} FROM file_nodes
             WHERE owner = ?1 AND parent_id = ?2 AND name = ?3 AND deleted_at IS NULL",
            NODE_COLUMNS
        );
        let args = (owner.to_string(), parent_id.to_string(), name.to_string());

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let mut rows = stmt
                .query(params![args.0, args.1, args.2])
                .map_err(map_db_err)?;
            match rows.next().map_err(map_db_err)? {
                Some(row) => Ok(Some(read_node(row).map_err(map_db_err)?)),
                None => Ok(None),
            }
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn find_by_id(&self, owner: &str, id: &str) -> Result<Option<FileNode>, TreeError> {
        let sql = format!(
            "SELECT {} FROM file_nodes WHERE owner = ?1 AND id = ?2 AND deleted_at IS NULL",
            NODE_COLUMNS
        );
        let owner = owner.to_string();
        let id = id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
            let mut rows = stmt.query(params![owner, id]).map_err(map_db_err)?;
            match rows.next().map_err(map_db_err)? {
                Some(row) => Ok(Some(read_node(row).map_err(map_db_err)?)),
                None => Ok(None),
            }
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_children(
        &self,
        owner: &str,
        parent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileNode>, TreeError> {
        let sql = format!(
            "SELECT {} FROM file_nodes
             WHERE owner = ?1 AND parent_id = ?2 AND deleted_at IS NULL
             ORDER BY name LIMIT ?3 OFFSET ?4",
            NODE_COLUMNS
        );
        let owner = owner.to_string();
        let parent_id = parent_id.to_string();
        let (limit, offset) = (sql_limit(limit), sql_offset(offset));

        let nodes = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![owner, parent_id, limit, offset], read_node)
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })
            .await?;

        debug!("Listed {} children", nodes.len());
        Ok(nodes)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_by_owner(
        &self,
        owner: &str,
        directories_only: bool,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FileNode>, TreeError> {
        let filter = if directories_only { "AND is_dir = 1" } else { "" };
        let sql = format!(
            "SELECT {} FROM file_nodes
             WHERE owner = ?1 AND deleted_at IS NULL {}
             ORDER BY {} LIMIT ?2 OFFSET ?3",
            NODE_COLUMNS, filter, PATH_EXPR
        );
        let owner_key = owner.to_string();
        let (limit, offset) = (sql_limit(limit), sql_offset(offset));

        let nodes = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![owner_key, limit, offset], read_node)
                    .map_err(map_db_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
            })
            .await?;

        debug!("Listed {} nodes for owner {}", nodes.len(), owner);
        Ok(nodes)
    }
}

fn read_node(row: &Row<'_>) -> rusqlite::Result<FileNode> {
    let size: i64 = row.get(6)?;
    let deleted_at: Option<i64> = row.get(9)?;
    Ok(FileNode {
        id: row.get(0)?,
        owner: row.get(1)?,
        parent_id: row.get(2)?,
        is_dir: row.get(3)?,
        name: row.get(4)?,
        directory: row.get(5)?,
        size: u64::try_from(size).unwrap_or(0),
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
        deleted_at: deleted_at.map(from_millis),
    })
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn size_to_sql(size: u64) -> Result<i64, TreeError> {
    i64::try_from(size).map_err(|_| TreeError::invalid("create", "size"))
}

/// SQLite treats a negative LIMIT as unbounded.
fn sql_limit(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::try_from(limit).unwrap_or(i64::MAX)
    }
}

fn sql_offset(offset: usize) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

/// Live-sibling index violations become `AlreadyExists`; anything else,
/// including a duplicate `id`, is a store failure.
fn write_err(op: &'static str, node: &FileNode, err: rusqlite::Error) -> TreeError {
    match &err {
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.code == ErrorCode::ConstraintViolation && msg.contains(LIVE_SIBLING_COLUMNS) =>
        {
            TreeError::already_exists(op, join_path(&node.directory, &node.name))
        }
        _ => map_db_err(err),
    }
}
