//! Database access layer.
//!
//! This module provides:
//! - The pool adapter and connection setup
//! - Transactions and savepoint nesting
//! - The unified [`Conn`] handle and its dispatch macro
//! - Context-bound transactions
//! - Batched statements and bulk `COPY`

pub mod batch;
#[macro_use]
pub mod macros;
pub mod conn;
pub mod contextual;
pub mod copy;
pub mod pool;
pub mod transaction;

pub use batch::{Batch, BatchResult};
pub use conn::Conn;
pub use contextual::ContextualTx;
pub use copy::{Identifier, quote_ident};
pub use pool::Db;
pub use transaction::Tx;
