use anyhow::{Context, Result, anyhow};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

/// A write transaction opened with `BEGIN IMMEDIATE`, so the SQLite write lock
/// is held from the first statement and reads inside it cannot go stale.
///
/// Dropping it without `commit`/`rollback` closes the underlying connection
/// instead of handing a half-finished transaction back to the pool; SQLite
/// rolls back on close.
pub(crate) struct ImmediateTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl ImmediateTx {
    pub(crate) async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("Failed to begin write transaction")?;
        Ok(Self { conn: Some(conn) })
    }

    pub(crate) fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| anyhow!("Transaction already finished"))
    }

    pub(crate) async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT")
            .execute(self.conn()?)
            .await
            .context("Failed to commit transaction")?;
        self.conn.take();
        Ok(())
    }

    pub(crate) async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK")
            .execute(self.conn()?)
            .await
            .context("Failed to roll back transaction")?;
        self.conn.take();
        Ok(())
    }
}

impl Drop for ImmediateTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Write transaction abandoned, closing its connection");
            drop(conn.detach());
        }
    }
}
