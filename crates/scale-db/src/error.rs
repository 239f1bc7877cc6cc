//! # Database Error Types
//!
//! ```text
//! sqlx::Error ──────────┐
//! MigrateError ─────────┼──► DbError ──► SyncError::Storage (scale-sync)
//! serde_json::Error ────┘
//! ```
//!
//! Callers above this crate only ever see `ErrorKind::Storage`; the
//! variants exist for logs and for deciding whether a retry makes sense.

use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened or created.
    ///
    /// ## When This Occurs
    /// - Directory missing or not writable
    /// - Disk full
    #[error("Cannot open database: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Another writer held the file for longer than `busy_timeout`.
    #[error("Database is busy")]
    Busy,

    /// Every pooled connection stayed in use past `acquire_timeout`.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored snapshot does not decode as a product table.
    ///
    /// ## When This Occurs
    /// - Row written by an incompatible build
    /// - Manual edits to the `products` column
    #[error("Corrupt snapshot: {0}")]
    Snapshot(String),
}

impl DbError {
    /// True for contention that clears on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Busy | DbError::PoolExhausted)
    }
}

/// SQLite's primary result code for a locked database file.
const SQLITE_BUSY: &str = "5";

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(SQLITE_BUSY) => {
                DbError::Busy
            }
            sqlx::Error::Database(db_err) => DbError::QueryFailed(db_err.message().to_string()),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            other => DbError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Snapshot(err.to_string())
    }
}
