//! pglink library
//!
//! A PostgreSQL access layer where application code takes one connection handle and works the same
//! whether it was given the pool or an open transaction. Adds session and transaction advisory
//! locks, nested transactions through savepoints, and deadline-bound transactions.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod lock;

pub use config::{Config, DbConfig, PoolOptions};
pub use context::{CancelGuard, Context, derive_timeout};
pub use db::{Batch, BatchResult, Conn, ContextualTx, Db, Identifier, Tx};
pub use error::{DbError, DbResult, is_disconnected, is_no_rows};
pub use lock::{AdvisoryLock, SessionLock, TransactionLock};
