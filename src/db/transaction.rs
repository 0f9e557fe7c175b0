//! Transaction adapter.
//!
//! A [`Tx`] owns one driver transaction. Beginning on a `Tx` opens a savepoint on the same
//! connection and returns a child that mutably borrows its parent until it is finalized or dropped.
//! Dropping an unfinished `Tx` rolls it back.

use crate::context::{CancelGuard, Context, derive_timeout};
use crate::db::batch::{Batch, BatchResult, run_batch};
use crate::db::contextual::ContextualTx;
use crate::db::copy::{Identifier, copy_rows};
use crate::db::pool::Db;
use crate::error::{DbError, DbResult};
use sqlx::postgres::{PgConnection, PgQueryResult, PgRow};
use sqlx::{Connection, Execute, Executor, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

pub struct Tx<'c> {
    /// `None` once committed or rolled back.
    inner: Option<Transaction<'c, Postgres>>,
    db: Db,
    depth: usize,
    default_timeout: Duration,
}

impl<'c> Tx<'c> {
    pub(crate) fn new(
        inner: Transaction<'c, Postgres>,
        db: Db,
        depth: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Some(inner),
            db,
            depth,
            default_timeout,
        }
    }

    /// The pool this transaction was started from.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Nesting level: 0 for a real transaction, 1+ for savepoints.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_savepoint(&self) -> bool {
        self.depth > 0
    }

    /// Whether the transaction has been committed or rolled back.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// The connection the transaction runs on.
    pub fn connection(&mut self) -> DbResult<&mut PgConnection> {
        self.inner.as_deref_mut().ok_or(DbError::TxClosed)
    }

    /// Open a savepoint. The returned child borrows this transaction until it is dropped.
    pub async fn begin(&mut self) -> DbResult<Tx<'_>> {
        let depth = self.depth + 1;
        let db = self.db.clone();
        let default_timeout = self.default_timeout;

        let child = self.connection()?.begin().await?;
        debug!(depth, "Savepoint started");

        Ok(Tx::new(child, db, depth, default_timeout))
    }

    /// Commit the transaction, or release the savepoint.
    pub async fn commit(&mut self) -> DbResult<()> {
        let tx = self.inner.take().ok_or(DbError::TxClosed)?;
        tx.commit().await?;
        self.log_finished("committed");
        Ok(())
    }

    /// Roll back the transaction, or roll back to the savepoint. Does nothing once finalized.
    pub async fn rollback(&mut self) -> DbResult<()> {
        let Some(tx) = self.inner.take() else {
            return Ok(());
        };
        tx.rollback().await?;
        self.log_finished("rolled back");
        Ok(())
    }

    /// Roll back unless already finalized. Safe to call after [`Tx::commit`].
    pub async fn close(&mut self) -> DbResult<()> {
        self.rollback().await
    }

    /// Drop the driver handle without waiting. The driver queues a rollback that runs the next time
    /// the connection is used.
    pub(crate) fn discard(&mut self) {
        if self.inner.take().is_some() {
            debug!(depth = self.depth, "Transaction discarded");
        }
    }

    fn log_finished(&self, outcome: &'static str) {
        if self.depth == 0 {
            info!(outcome, "Transaction finished");
        } else {
            debug!(depth = self.depth, outcome, "Savepoint finished");
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Set the default used by [`Tx::with_timeout`]. Savepoints opened afterwards inherit it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    pub fn with_timeout(&self, parent: Option<&Context>) -> (Context, CancelGuard) {
        derive_timeout(parent, self.default_timeout)
    }

    /// Open a savepoint that runs every call under one derived timeout context.
    pub async fn begin_with_timeout(
        &mut self,
        parent: Option<&Context>,
    ) -> DbResult<ContextualTx<'_>> {
        let (ctx, cancel) = self.with_timeout(parent);
        let tx = ctx.run(self.begin()).await?;
        Ok(ContextualTx::new(tx, ctx, cancel))
    }

    pub async fn execute<'q, E>(&mut self, query: E) -> DbResult<PgQueryResult>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), depth = self.depth, "Executing in transaction");
        Ok(self.connection()?.execute(query).await?)
    }

    pub async fn query<'q, E>(&mut self, query: E) -> DbResult<Vec<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), depth = self.depth, "Querying in transaction");
        Ok(self.connection()?.fetch_all(query).await?)
    }

    pub async fn query_row<'q, E>(&mut self, query: E) -> DbResult<PgRow>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), depth = self.depth, "Querying row in transaction");
        Ok(self.connection()?.fetch_one(query).await?)
    }

    pub async fn query_optional<'q, E>(&mut self, query: E) -> DbResult<Option<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), depth = self.depth, "Querying optional row in transaction");
        Ok(self.connection()?.fetch_optional(query).await?)
    }

    /// Run queued statements in order within this transaction.
    pub async fn send_batch(&mut self, batch: Batch<'_>) -> DbResult<Vec<BatchResult>> {
        run_batch(self.connection()?, batch).await
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
        copy_rows(self.connection()?, table, columns, rows).await
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("depth", &self.depth)
            .field("closed", &self.is_closed())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
