//! Pool adapter.
//!
//! [`Db`] wraps the process-wide [`PgPool`]. Beginning work on it opens a real transaction;
//! commit, rollback and close are no-ops because the pool itself is never finalized through the
//! connection interface. Use [`Db::shutdown`] for process teardown.

use crate::config::DbConfig;
use crate::context::{CancelGuard, Context, DEFAULT_TIMEOUT, derive_timeout};
use crate::db::batch::{Batch, BatchResult, run_batch};
use crate::db::contextual::ContextualTx;
use crate::db::copy::{Identifier, copy_rows};
use crate::db::transaction::Tx;
use crate::error::DbResult;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{Execute, Executor, Postgres};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Shared handle to the connection pool.
///
/// Clones share the pool and the default timeout, so [`Db::set_timeout`] on any handle is seen by
/// every other.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
    /// Nanoseconds.
    default_timeout: Arc<AtomicU64>,
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Db {
    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self::with_default_timeout(pool, DEFAULT_TIMEOUT)
    }

    fn with_default_timeout(pool: PgPool, timeout: Duration) -> Self {
        Self {
            pool,
            default_timeout: Arc::new(AtomicU64::new(duration_to_nanos(timeout))),
        }
    }

    /// Connect using a URL, with pool options taken from its query string.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let config = DbConfig::parse(url)?;
        Self::connect_with(&config).await
    }

    /// Connect using an explicit configuration.
    pub async fn connect_with(config: &DbConfig) -> DbResult<Self> {
        let opts = &config.pool_options;
        opts.validate()?;

        info!(
            url = %config.masked_url(),
            max_connections = opts.max_connections_or_default(),
            session_statements = config.session_statements.len(),
            "Connecting to database"
        );

        let statements: Arc<[String]> = config.session_statements.clone().into();

        let pool = PgPoolOptions::new()
            .min_connections(opts.min_connections_or_default())
            .max_connections(opts.max_connections_or_default())
            .acquire_timeout(opts.acquire_timeout_or_default())
            .idle_timeout(Some(opts.idle_timeout_or_default()))
            .test_before_acquire(opts.test_before_acquire_or_default())
            .after_connect(move |conn, _meta| {
                let statements = Arc::clone(&statements);
                Box::pin(async move {
                    for sql in statements.iter() {
                        sqlx::query(sql.as_str()).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(&config.url)
            .await?;

        info!("Connected successfully");

        Ok(Self::with_default_timeout(
            pool,
            opts.default_timeout_or_default(),
        ))
    }

    /// The underlying driver pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every connection in the pool. Outstanding checkouts finish first.
    pub async fn shutdown(&self) {
        info!("Closing connection pool");
        self.pool.close().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_closed()
    }

    /// Check out a connection for session-scoped work.
    pub async fn acquire(&self) -> DbResult<PoolConnection<Postgres>> {
        Ok(self.pool.acquire().await?)
    }

    /// Start a real transaction.
    pub async fn begin(&self) -> DbResult<Tx<'static>> {
        let tx = self.pool.begin().await?;
        info!("Transaction started");
        Ok(Tx::new(tx, self.clone(), 0, self.default_timeout()))
    }

    /// Does nothing on a pool.
    pub async fn commit(&self) -> DbResult<()> {
        Ok(())
    }

    /// Does nothing on a pool.
    pub async fn rollback(&self) -> DbResult<()> {
        Ok(())
    }

    /// Does nothing on a pool; see [`Db::shutdown`].
    pub async fn close(&self) -> DbResult<()> {
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_nanos(self.default_timeout.load(Ordering::Relaxed))
    }

    /// Set the default used by [`Db::with_timeout`] on this handle and all its clones. Zero means
    /// [`DEFAULT_TIMEOUT`]. Transactions already begun keep the value they started with.
    pub fn set_timeout(&self, timeout: Duration) {
        self.default_timeout
            .store(duration_to_nanos(timeout), Ordering::Relaxed);
    }

    /// Derive a context bounded by the configured default timeout, unless `parent` already has a
    /// deadline. Keep the guard until the context is no longer needed.
    pub fn with_timeout(&self, parent: Option<&Context>) -> (Context, CancelGuard) {
        derive_timeout(parent, self.default_timeout())
    }

    /// Start a transaction that runs every call under one derived timeout context.
    pub async fn begin_with_timeout(
        &self,
        parent: Option<&Context>,
    ) -> DbResult<ContextualTx<'static>> {
        let (ctx, cancel) = self.with_timeout(parent);
        let tx = ctx.run(self.begin()).await?;
        Ok(ContextualTx::new(tx, ctx, cancel))
    }

    pub async fn execute<'q, E>(&self, query: E) -> DbResult<PgQueryResult>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), "Executing on pool");
        Ok(self.pool.execute(query).await?)
    }

    pub async fn query<'q, E>(&self, query: E) -> DbResult<Vec<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), "Querying on pool");
        Ok(self.pool.fetch_all(query).await?)
    }

    /// Fetch exactly one row; an empty result is a no-rows driver error.
    pub async fn query_row<'q, E>(&self, query: E) -> DbResult<PgRow>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), "Querying row on pool");
        Ok(self.pool.fetch_one(query).await?)
    }

    pub async fn query_optional<'q, E>(&self, query: E) -> DbResult<Option<PgRow>>
    where
        E: Execute<'q, Postgres> + 'q,
    {
        debug!(sql = query.sql(), "Querying optional row on pool");
        Ok(self.pool.fetch_optional(query).await?)
    }

    /// Run a batch atomically in its own transaction.
    pub async fn send_batch(&self, batch: Batch<'_>) -> DbResult<Vec<BatchResult>> {
        let mut tx = self.pool.begin().await?;
        let results = run_batch(&mut tx, batch).await?;
        tx.commit().await?;
        Ok(results)
    }

    /// Bulk-load rows with `COPY ... FROM STDIN` on a pooled connection.
    pub async fn copy_from<R, S>(
        &self,
        table: &Identifier,
        columns: &[&str],
        rows: impl IntoIterator<Item = R>,
    ) -> DbResult<u64>
    where
        R: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut conn = self.pool.acquire().await?;
        copy_rows(&mut conn, table, columns, rows).await
    }
}
