//! # Database Error Types
//!
//! Error types for Local Store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ├── StorageUnavailable → fatal, aborts startup                   │
//! │       ├── SchemaMismatch     → logged by the migrator, never returned  │
//! │       │                        for a single column                     │
//! │       ▼                                                                 │
//! │  SyncError (keystone-sync) ← Wraps DbError as Database / Storage       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use keystone_core::{CoreError, ValidationError};
use thiserror::Error;

/// Local Store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The store file cannot be opened or read.
    ///
    /// ## When This Occurs
    /// - File is corrupt or not a SQLite database
    /// - Directory is not writable
    /// - Pool was closed
    ///
    /// Fatal. There is no in-memory fallback.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Actual schema could not be brought in line with the expected one.
    #[error("Schema mismatch on {table}.{column}: {message}")]
    SchemaMismatch {
        table: String,
        column: String,
        message: String,
    },

    /// Sealing or opening an encrypted column failed.
    ///
    /// ## When This Occurs
    /// - Encrypted value read without a key configured
    /// - Wrong key
    /// - Ciphertext truncated or tampered with
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Input rejected before reaching SQL.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Returns true if the store itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::StorageUnavailable(_))
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound           → DbError::NotFound
/// sqlx::Error::Database (corrupt)    → DbError::StorageUnavailable
/// sqlx::Error::Database (other)      → DbError::QueryFailed
/// sqlx::Error::Io / PoolClosed       → DbError::StorageUnavailable
/// Other                              → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // SQLITE_NOTADB / SQLITE_CORRUPT
                if msg.contains("file is not a database")
                    || msg.contains("database disk image is malformed")
                    || msg.contains("unable to open database file")
                {
                    DbError::StorageUnavailable(msg.to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::Io(io) => DbError::StorageUnavailable(io.to_string()),

            sqlx::Error::PoolClosed => DbError::StorageUnavailable("Pool is closed".to_string()),

            sqlx::Error::PoolTimedOut => {
                DbError::QueryFailed("Timed out waiting for a connection".to_string())
            }

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<CoreError> for DbError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => DbError::Validation(v),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Internal(format!("JSON column: {err}"))
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_pool_closed_is_fatal() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(err.is_fatal());
    }
}
