//! Error types for the event store

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// PostgreSQL unique violation SQLSTATE
const UNIQUE_VIOLATION: &str = "23505";

/// Errors that can occur while persisting events.
///
/// Identity conflicts are never surfaced here: the store resolves them into
/// [`crate::InsertOutcome::Duplicate`] or the duplicate count of a batch.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event ID validation failed (empty, too long)
    #[error("Invalid event ID: {0}")]
    InvalidEventId(String),
}

impl StoreError {
    /// Vendor error code (SQLSTATE) when the database reported one
    pub fn code(&self) -> Option<String> {
        match self {
            StoreError::Database(sqlx_err) => sqlx_err
                .as_database_error()
                .and_then(|db_err| db_err.code())
                .map(|code| code.into_owned()),
            StoreError::InvalidEventId(_) => None,
        }
    }

    /// Check if error is a duplicate key violation
    pub fn is_unique_violation(&self) -> bool {
        self.code().as_deref() == Some(UNIQUE_VIOLATION)
    }

    /// Check if error is a pool/connectivity fault rather than a query fault
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}
