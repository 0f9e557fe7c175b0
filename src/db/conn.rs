//! The unified connection handle.
//!
//! Data-access code takes a `&mut Conn<'_>` and works the same whether it was handed the pool or an
//! open transaction. Beginning on either yields a transaction; finalizing the pool variant is a
//! no-op, so the same begin/commit/close sequence composes at any nesting level.

use crate::db::batch::{Batch, BatchResult};
use crate::db::copy::Identifier;
use crate::db::pool::Db;
use crate::db::transaction::Tx;
use crate::error::DbResult;
use crate::lock::AdvisoryLock;
use sqlx::postgres::{PgQueryResult, PgRow};
use sqlx::{Execute, Postgres};

/// Either the shared pool or a transaction on one of its connections.
#[derive(Debug)]
pub enum Conn<'c> {
    Pool(Db),
    Tx(Tx<'c>),
}

impl<'c> Conn<'c> {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Conn::Tx(_))
    }

    /// The pool behind this handle.
    pub fn db(&self) -> &Db {
        impl_conn_dispatch!(self, {
            Pool(db) => db,
            Tx(tx) => tx.db(),
        })
    }

    /// Start a transaction on the pool, or a savepoint inside the current transaction.
    pub async fn begin(&mut self) -> DbResult<Conn<'_>> {
        impl_conn_dispatch!(self, {
            Pool(db) => Ok(Conn::Tx(db.begin().await?)),
            Tx(tx) => Ok(Conn::Tx(tx.begin().await?)),
        })
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        impl_conn_dispatch!(self, {
            Pool(db) => db.commit().await,
            Tx(tx) => tx.commit().await,
        })
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        impl_conn_dispatch!(self, {
            Pool(db) => db.rollback().await,
            Tx(tx) => tx.rollback().await,
        })
    }

    /// Finalize the handle. Rolls back an unfinished transaction and never touches the pool.
    pub async fn close(&mut self) -> DbResult<()> {
        impl_conn_dispatch!(self, {
            Pool(db) => db.close().await,
            Tx(tx) => tx.close().await,
        })
    }

    pub async fn execute<'q, E>(&mut self, query: E) -> DbResult<PgQueryResult>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        impl_conn_dispatch!(self, {
            Pool(db) => db.execute(query).await,
            Tx(tx) => tx.execute(query).await,
        })
    }

    pub async fn query<'q, E>(&mut self, query: E) -> DbResult<Vec<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        impl_conn_dispatch!(self, {
            Pool(db) => db.query(query).await,
            Tx(tx) => tx.query(query).await,
        })
    }

    pub async fn query_row<'q, E>(&mut self, query: E) -> DbResult<PgRow>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        impl_conn_dispatch!(self, {
            Pool(db) => db.query_row(query).await,
            Tx(tx) => tx.query_row(query).await,
        })
    }

    pub async fn query_optional<'q, E>(&mut self, query: E) -> DbResult<Option<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        impl_conn_dispatch!(self, {
            Pool(db) => db.query_optional(query).await,
            Tx(tx) => tx.query_optional(query).await,
        })
    }

    pub async fn send_batch(&mut self, batch: Batch<'_>) -> DbResult<Vec<BatchResult>> {
        impl_conn_dispatch!(self, {
            Pool(db) => db.send_batch(batch).await,
            Tx(tx) => tx.send_batch(batch).await,
        })
    }

    pub async fn copy_from<R, S>(
        &mut self,
        table: &Identifier,
        columns: &[&str],
        rows: impl IntoIterator<Item = R>,
    ) -> DbResult<u64>
    where
        R: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        impl_conn_dispatch!(self, {
            Pool(db) => db.copy_from(table, columns, rows).await,
            Tx(tx) => tx.copy_from(table, columns, rows).await,
        })
    }

    /// Block until the advisory lock is held: session-scoped on the pool, transaction-scoped inside
    /// a transaction.
    pub async fn lock(&mut self, id: i64) -> DbResult<AdvisoryLock> {
        impl_conn_dispatch!(self, {
            Pool(db) => db.lock(id).await,
            Tx(tx) => tx.lock(id).await,
        })
    }

    /// Like [`Conn::lock`] but fails with [`DbError::Locked`](crate::DbError::Locked) instead of
    /// waiting.
    pub async fn try_lock(&mut self, id: i64) -> DbResult<AdvisoryLock> {
        impl_conn_dispatch!(self, {
            Pool(db) => db.try_lock(id).await,
            Tx(tx) => tx.try_lock(id).await,
        })
    }
}

impl From<Db> for Conn<'static> {
    fn from(db: Db) -> Self {
        Conn::Pool(db)
    }
}

impl<'c> From<Tx<'c>> for Conn<'c> {
    fn from(tx: Tx<'c>) -> Self {
        Conn::Tx(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use tokio_test::assert_ok;

    fn lazy_conn() -> Conn<'static> {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/pglink_unused")
            .unwrap();
        Conn::from(Db::from_pool(pool))
    }

    #[tokio::test]
    async fn test_pool_variant_finalizers_are_noops() {
        let mut conn = lazy_conn();
        assert!(!conn.is_transaction());
        assert_ok!(conn.commit().await);
        assert_ok!(conn.rollback().await);
        assert_ok!(conn.close().await);
        assert!(!conn.db().is_shutdown());
    }
}
