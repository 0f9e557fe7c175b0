//! Queued statements sent to the server as one unit of work.

use crate::error::DbResult;
use sqlx::postgres::{PgArguments, PgConnection, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::debug;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

enum BatchItem<'q> {
    Execute(PgQuery<'q>),
    Fetch(PgQuery<'q>),
}

/// Statements executed in queue order on a single connection.
///
/// On a pool the whole batch runs inside its own transaction, so either every statement applies
/// or none does. Inside a transaction the batch simply joins it.
#[derive(Default)]
pub struct Batch<'q> {
    items: Vec<BatchItem<'q>>,
}

impl<'q> Batch<'q> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Queue a statement whose affected-row count is wanted.
    pub fn execute(&mut self, query: PgQuery<'q>) -> &mut Self {
        self.items.push(BatchItem::Execute(query));
        self
    }

    /// Queue a statement whose rows are wanted.
    pub fn fetch(&mut self, query: PgQuery<'q>) -> &mut Self {
        self.items.push(BatchItem::Fetch(query));
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for Batch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("len", &self.items.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of one queued statement, in queue order.
#[derive(Debug)]
pub enum BatchResult {
    Executed(PgQueryResult),
    Rows(Vec<PgRow>),
}

impl BatchResult {
    pub fn rows_affected(&self) -> u64 {
        match self {
            Self::Executed(result) => result.rows_affected(),
            Self::Rows(rows) => rows.len() as u64,
        }
    }

    pub fn rows(&self) -> &[PgRow] {
        match self {
            Self::Executed(_) => &[],
            Self::Rows(rows) => rows,
        }
    }

    pub fn into_rows(self) -> Vec<PgRow> {
        match self {
            Self::Executed(_) => Vec::new(),
            Self::Rows(rows) => rows,
        }
    }
}

/// Run every queued statement on `conn`, stopping at the first failure.
pub(crate) async fn run_batch(
    conn: &mut PgConnection,
    batch: Batch<'_>,
) -> DbResult<Vec<BatchResult>> {
    let mut results = Vec::with_capacity(batch.len());

    for item in batch.items {
        let result = match item {
            BatchItem::Execute(query) => BatchResult::Executed(query.execute(&mut *conn).await?),
            BatchItem::Fetch(query) => BatchResult::Rows(query.fetch_all(&mut *conn).await?),
        };
        results.push(result);
    }

    debug!(statements = results.len(), "Batch completed");

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_queue() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());

        batch
            .execute(sqlx::query("INSERT INTO t (id) VALUES ($1)").bind(1_i64))
            .execute(sqlx::query("INSERT INTO t (id) VALUES ($1)").bind(2_i64))
            .fetch(sqlx::query("SELECT id FROM t"));

        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        assert!(format!("{batch:?}").contains("len: 3"));
    }

    #[test]
    fn test_batch_result_rows() {
        let result = BatchResult::Rows(Vec::new());
        assert_eq!(result.rows_affected(), 0);
        assert!(result.rows().is_empty());
        assert!(result.into_rows().is_empty());
    }
}
