//! Dispatch macro for the [`Conn`](crate::db::Conn) variants.
//!
//! Each arm gets the concrete adapter (`Db` or `Tx`) so the same method body can be written once
//! per variant while the match stays readable. Expands at compile time with zero runtime overhead.

/// Macro for generating `Conn` dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_conn_dispatch!(self, {
///     Pool(db) => db.commit().await,
///     Tx(tx) => tx.commit().await,
/// })
/// ```
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::conn::Conn::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;
