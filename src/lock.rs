//! PostgreSQL advisory locks.
//!
//! On the pool, a lock is session-scoped. It holds a dedicated connection until [`AdvisoryLock::release`]
//! unlocks it and returns the connection. Inside a transaction, it is transaction-scoped and ends with
//! the transaction, so `release` does nothing.
//!
//! Lock ids are opaque `bigint` keys shared by every client of the database.

use crate::db::{Db, Tx};
use crate::error::{DbError, DbResult};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnection;
use sqlx::Postgres;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const LOCK_SQL: &str = "SELECT pg_advisory_lock($1)";
const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";
const XACT_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock($1)";
const TRY_XACT_LOCK_SQL: &str = "SELECT pg_try_advisory_xact_lock($1)";

/// A held advisory lock.
#[derive(Debug)]
pub enum AdvisoryLock {
    Session(SessionLock),
    Transaction(TransactionLock),
}

impl AdvisoryLock {
    pub fn id(&self) -> i64 {
        match self {
            AdvisoryLock::Session(lock) => lock.id(),
            AdvisoryLock::Transaction(lock) => lock.id(),
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, AdvisoryLock::Session(_))
    }

    /// Release the lock. Safe to call more than once, including concurrently.
    pub async fn release(&self) -> DbResult<()> {
        match self {
            AdvisoryLock::Session(lock) => lock.release().await,
            AdvisoryLock::Transaction(lock) => lock.release().await,
        }
    }
}

/// Session-scoped lock holding its own connection.
///
/// The connection is used for nothing else. If the lock is dropped without being released, the
/// connection is closed rather than pooled, which ends the session and frees the lock on the server.
#[derive(Debug)]
pub struct SessionLock {
    id: i64,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl SessionLock {
    fn new(id: i64, conn: PoolConnection<Postgres>) -> Self {
        Self {
            id,
            conn: Mutex::new(Some(conn)),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub async fn is_released(&self) -> bool {
        self.conn.lock().await.is_none()
    }

    /// Unlock and return the connection to the pool. Later calls do nothing.
    pub async fn release(&self) -> DbResult<()> {
        let mut slot = self.conn.lock().await;
        let Some(mut conn) = slot.take() else {
            return Ok(());
        };

        match sqlx::query_scalar::<_, bool>(UNLOCK_SQL)
            .bind(self.id)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => {
                debug!(id = self.id, "Session lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(id = self.id, "Session lock was not held at release");
                Ok(())
            }
            Err(err) => {
                // The session may still hold the lock; ending it is the only way to be sure.
                conn.close_on_drop();
                Err(err.into())
            }
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.get_mut().take() {
            warn!(id = self.id, "Session lock dropped without release, closing its connection");
            conn.close_on_drop();
        }
    }
}

/// Transaction-scoped lock.
///
/// Released when the top-level transaction commits or rolls back. A lock taken inside a savepoint
/// outlives the savepoint's commit and stays held until the outermost transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLock {
    id: i64,
}

impl TransactionLock {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Does nothing; the lock ends with the top-level transaction.
    pub async fn release(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Closes the connection if an acquisition future is dropped before the server answers, so a lock
/// granted late can never ride along into the pool.
struct CloseOnCancel<'a> {
    conn: &'a mut PoolConnection<Postgres>,
    armed: bool,
}

impl<'a> CloseOnCancel<'a> {
    fn new(conn: &'a mut PoolConnection<Postgres>) -> Self {
        Self { conn, armed: true }
    }

    fn connection(&mut self) -> &mut PgConnection {
        &mut **self.conn
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CloseOnCancel<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Lock acquisition abandoned, closing connection");
            self.conn.close_on_drop();
        }
    }
}

impl Db {
    /// Take a session lock, waiting as long as it takes. Bound the wait with
    /// [`Context::run`](crate::Context::run).
    pub async fn lock(&self, id: i64) -> DbResult<AdvisoryLock> {
        let mut conn = self.acquire().await?;
        {
            let mut guard = CloseOnCancel::new(&mut conn);
            let result = sqlx::query(LOCK_SQL)
                .bind(id)
                .execute(guard.connection())
                .await;
            guard.disarm();
            result?;
        }

        debug!(id, "Session lock acquired");
        Ok(AdvisoryLock::Session(SessionLock::new(id, conn)))
    }

    /// Take a session lock if it is free, otherwise fail with [`DbError::Locked`]. The connection
    /// goes back to the pool on failure.
    pub async fn try_lock(&self, id: i64) -> DbResult<AdvisoryLock> {
        let mut conn = self.acquire().await?;
        let acquired = {
            let mut guard = CloseOnCancel::new(&mut conn);
            let result = sqlx::query_scalar::<_, bool>(TRY_LOCK_SQL)
                .bind(id)
                .fetch_one(guard.connection())
                .await;
            guard.disarm();
            result?
        };

        if !acquired {
            debug!(id, "Session lock busy");
            return Err(DbError::Locked { id });
        }

        debug!(id, "Session lock acquired");
        Ok(AdvisoryLock::Session(SessionLock::new(id, conn)))
    }
}

impl Tx<'_> {
    /// Take a transaction lock, waiting as long as it takes. On a savepoint the lock is held until
    /// the top-level transaction ends.
    ///
    /// If the wait is abandoned the server keeps waiting on this transaction's connection; roll it
    /// back rather than reusing it.
    pub async fn lock(&mut self, id: i64) -> DbResult<AdvisoryLock> {
        sqlx::query(XACT_LOCK_SQL)
            .bind(id)
            .execute(self.connection()?)
            .await?;

        debug!(id, depth = self.depth(), "Transaction lock acquired");
        Ok(AdvisoryLock::Transaction(TransactionLock { id }))
    }

    /// Take a transaction lock if it is free, otherwise fail with [`DbError::Locked`].
    pub async fn try_lock(&mut self, id: i64) -> DbResult<AdvisoryLock> {
        let acquired = sqlx::query_scalar::<_, bool>(TRY_XACT_LOCK_SQL)
            .bind(id)
            .fetch_one(self.connection()?)
            .await?;

        if !acquired {
            debug!(id, "Transaction lock busy");
            return Err(DbError::Locked { id });
        }

        debug!(id, depth = self.depth(), "Transaction lock acquired");
        Ok(AdvisoryLock::Transaction(TransactionLock { id }))
    }
}
