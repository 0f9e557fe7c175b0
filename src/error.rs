//! Error types for pglink.
//!
//! Driver errors are carried through untouched in [`DbError::Driver`]; the remaining variants are the
//! few conditions this crate adds on top of the driver (a taken advisory lock, a finalized
//! transaction, an expired or cancelled context, bad configuration).

use thiserror::Error;

// PostgreSQL disconnect errors - https://www.postgresql.org/docs/current/errcodes-appendix.html
pub const OPERATOR_INTERVENTION: &str = "57000";
pub const QUERY_CANCELED: &str = "57014";
pub const ADMIN_SHUTDOWN: &str = "57P01";
pub const CRASH_SHUTDOWN: &str = "57P02";
pub const CANNOT_CONNECT_NOW: &str = "57P03";
pub const DATABASE_DROPPED: &str = "57P04";
pub const IDLE_SESSION_TIMEOUT: &str = "57P05";

/// SQLSTATE codes that mean the server dropped or refused the session.
pub const DISCONNECT_CODES: [&str; 7] = [
    OPERATOR_INTERVENTION,
    QUERY_CANCELED,
    ADMIN_SHUTDOWN,
    CRASH_SHUTDOWN,
    CANNOT_CONNECT_NOW,
    DATABASE_DROPPED,
    IDLE_SESSION_TIMEOUT,
];

#[derive(Error, Debug)]
pub enum DbError {
    /// Anything the driver reported: failed begin/commit/rollback, failed lock acquisition,
    /// query errors, pool exhaustion.
    #[error(transparent)]
    Driver(#[from] sqlx::Error),

    #[error("Advisory lock {id} is held by another session")]
    Locked { id: i64 },

    #[error("Transaction has already been committed or rolled back")]
    TxClosed,

    #[error("Context deadline exceeded")]
    DeadlineExceeded,

    #[error("Context cancelled")]
    Cancelled,

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// The underlying driver error, if this is one.
    pub fn driver(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Driver(err) => Some(err),
            _ => None,
        }
    }

    /// True when a `try_lock` found the lock held elsewhere.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// True when a context deadline elapsed or the pool timed out handing out a connection.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded | Self::Driver(sqlx::Error::PoolTimedOut)
        )
    }

    /// See [`is_disconnected`].
    pub fn is_disconnected(&self) -> bool {
        self.driver().is_some_and(is_disconnected)
    }

    /// See [`is_no_rows`].
    pub fn is_no_rows(&self) -> bool {
        self.driver().is_some_and(is_no_rows)
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<String> {
        self.driver()
            .and_then(|err| err.as_database_error())
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned())
    }

    /// Check if the failure is worth retrying on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Driver(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) => true,
            Self::Driver(err) => is_disconnected(err),
            _ => false,
        }
    }
}

/// Returns true if the error carries one of the [`DISCONNECT_CODES`].
pub fn is_disconnected(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| is_disconnect_code(&code))
}

/// Returns true if `code` is one of the [`DISCONNECT_CODES`].
pub fn is_disconnect_code(code: &str) -> bool {
    DISCONNECT_CODES.contains(&code)
}

/// Returns true if a single-row fetch came back empty.
pub fn is_no_rows(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::RowNotFound)
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
