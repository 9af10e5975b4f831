use async_trait::async_trait;
use tracing::{debug, warn};
use treestore_core::{FileRepository, TreeError, UnitOfWork};

use super::map_db_err;
use super::repository::SqlRepository;

/// A transaction on a dedicated connection opened with `BEGIN IMMEDIATE`.
///
/// Dropping it without `commit` or `rollback` closes the connection, which
/// makes SQLite roll the transaction back.
pub struct SqliteUnitOfWork {
    repo: SqlRepository,
    finished: bool,
}

impl SqliteUnitOfWork {
    pub(crate) fn new(repo: SqlRepository) -> Self {
        Self {
            repo,
            finished: false,
        }
    }
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    fn files(&self) -> &dyn FileRepository {
        &self.repo
    }

    async fn commit(self: Box<Self>) -> Result<(), TreeError> {
        let mut this = self;
        // A failed COMMIT leaves the transaction open; closing the connection
        // rolls it back.
        this.finished = true;
        this.repo
            .with_conn(|conn| conn.execute_batch("COMMIT").map_err(map_db_err))
            .await?;
        debug!("Transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TreeError> {
        let mut this = self;
        this.finished = true;
        this.repo
            .with_conn(|conn| conn.execute_batch("ROLLBACK").map_err(map_db_err))
            .await?;
        debug!("Transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteUnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Unit of work dropped without commit or rollback, rolling back");
        }
    }
}
