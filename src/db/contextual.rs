//! Transaction bound to a single timeout context.

use crate::context::{CancelGuard, Context};
use crate::db::batch::{Batch, BatchResult};
use crate::db::copy::Identifier;
use crate::db::transaction::Tx;
use crate::error::DbResult;
use crate::lock::AdvisoryLock;
use sqlx::postgres::{PgQueryResult, PgRow};
use sqlx::{Execute, Postgres};
use tracing::debug;

/// A [`Tx`] whose calls all run under the context captured at begin time.
///
/// Created by [`Db::begin_with_timeout`](crate::db::Db::begin_with_timeout) or
/// [`Tx::begin_with_timeout`]. Calls made after the context expires fail with
/// [`DbError::DeadlineExceeded`](crate::DbError::DeadlineExceeded).
pub struct ContextualTx<'c> {
    tx: Tx<'c>,
    ctx: Context,
    cancel: CancelGuard,
}

impl<'c> ContextualTx<'c> {
    pub(crate) fn new(tx: Tx<'c>, ctx: Context, cancel: CancelGuard) -> Self {
        Self { tx, ctx, cancel }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The wrapped transaction, for calls that should not be bounded by the context.
    pub fn inner(&mut self) -> &mut Tx<'c> {
        &mut self.tx
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.ctx.run(self.tx.commit()).await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ctx.run(self.tx.rollback()).await
    }

    /// Roll back unless already finalized, then release the context.
    ///
    /// If the context has already ended the handle is discarded instead and the driver rolls it
    /// back on the connection's next use.
    pub async fn close(&mut self) -> DbResult<()> {
        let result = if self.ctx.is_done() {
            self.tx.discard();
            Ok(())
        } else {
            match self.ctx.run(self.tx.rollback()).await {
                Err(err) if err.is_timeout() => {
                    debug!(error = %err, "Context ended during rollback");
                    self.tx.discard();
                    Ok(())
                }
                other => other,
            }
        };
        self.cancel.cancel();
        result
    }

    pub async fn execute<'q, E>(&mut self, query: E) -> DbResult<PgQueryResult>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        self.ctx.run(self.tx.execute(query)).await
    }

    pub async fn query<'q, E>(&mut self, query: E) -> DbResult<Vec<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        self.ctx.run(self.tx.query(query)).await
    }

    pub async fn query_row<'q, E>(&mut self, query: E) -> DbResult<PgRow>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        self.ctx.run(self.tx.query_row(query)).await
    }

    pub async fn query_optional<'q, E>(&mut self, query: E) -> DbResult<Option<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        self.ctx.run(self.tx.query_optional(query)).await
    }

    pub async fn send_batch(&mut self, batch: Batch<'_>) -> DbResult<Vec<BatchResult>> {
        self.ctx.run(self.tx.send_batch(batch)).await
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
        self.ctx.run(self.tx.copy_from(table, columns, rows)).await
    }

    pub async fn lock(&mut self, id: i64) -> DbResult<AdvisoryLock> {
        self.ctx.run(self.tx.lock(id)).await
    }

    pub async fn try_lock(&mut self, id: i64) -> DbResult<AdvisoryLock> {
        self.ctx.run(self.tx.try_lock(id)).await
    }
}

impl std::fmt::Debug for ContextualTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextualTx")
            .field("tx", &self.tx)
            .field("deadline", &self.ctx.deadline())
            .finish_non_exhaustive()
    }
}
