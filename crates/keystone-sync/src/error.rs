//! # Sync Error Types
//!
//! Error types for token, transport and sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Authentication      │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  NetworkError   │  │  AuthError              │ │
//! │  │  InvalidUrl     │  │  ServerError    │  │  TokenInvalid           │ │
//! │  │  ConfigLoad/Save│  │                 │  │  TokenExpired           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │      Sync       │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Storage-       │  │  TableSyncError │  │  Serialization          │ │
//! │  │   Unavailable   │  │  Cancelled      │  │  Internal               │ │
//! │  │  Database       │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  HANDLING:                                                             │
//! │  • Retryable (network, 5xx, 429) → queue / retry with backoff          │
//! │  • Auth → one refresh, then re-login                                   │
//! │  • Fatal (StorageUnavailable) → abort startup                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use keystone_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering token, transport and sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid remote URL.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Connection refused, DNS failure, timeout or dropped body.
    ///
    /// Transient. The operation stays queued and is retried later.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The server answered with a non-success status other than 401.
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// Authorization failed and could not be repaired by a refresh.
    ///
    /// The user has to log in again.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Token signature, structure or identity check failed.
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// Token is past its expiry.
    #[error("Token expired")]
    TokenExpired,

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// The local store cannot be opened or read. Fatal.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A local store operation failed.
    #[error("Database error: {0}")]
    Database(DbError),

    // =========================================================================
    // Sync Errors
    // =========================================================================
    /// One table failed to sync. Other tables are unaffected.
    #[error("Sync of table {table} failed: {message}")]
    TableSyncError { table: String, message: String },

    /// The sync run was cancelled before this work started.
    #[error("Sync cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Unexpected payload shape.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::StorageUnavailable(msg) => SyncError::StorageUnavailable(msg),
            other => SyncError::Database(other),
        }
    }
}

impl From<keystone_core::CoreError> for SyncError {
    fn from(err: keystone_core::CoreError) -> Self {
        SyncError::Database(DbError::from(err))
    }
}

impl From<keystone_core::ValidationError> for SyncError {
    fn from(err: keystone_core::ValidationError) -> Self {
        SyncError::Database(DbError::Validation(err))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::from(DbError::from(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Serialization(err.to_string());
        }
        if let Some(status) = err.status() {
            return SyncError::ServerError {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        if err.is_builder() {
            return SyncError::InvalidUrl(err.to_string());
        }
        // Connect, timeout, request and body failures.
        SyncError::NetworkError(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => SyncError::TokenExpired,
            _ => SyncError::TokenInvalid(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - 5xx responses
    /// - 429 Too Many Requests
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::NetworkError(_) => true,
            SyncError::ServerError { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if the caller has to refresh or log in again.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            SyncError::AuthError(_) | SyncError::TokenInvalid(_) | SyncError::TokenExpired
        )
    }

    /// Returns true if the process cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::StorageUnavailable(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Shorthand for a per-table failure.
    pub fn table(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::TableSyncError {
            table: table.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::NetworkError("connection refused".into()).is_retryable());
        assert!(SyncError::ServerError { status: 503, message: "busy".into() }.is_retryable());
        assert!(SyncError::ServerError { status: 429, message: "slow down".into() }.is_retryable());

        assert!(!SyncError::ServerError { status: 400, message: "bad".into() }.is_retryable());
        assert!(!SyncError::AuthError("nope".into()).is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
    }

    #[test]
    fn test_auth_and_fatal_classification() {
        assert!(SyncError::TokenExpired.is_auth_error());
        assert!(SyncError::TokenInvalid("sig".into()).is_auth_error());
        assert!(!SyncError::NetworkError("x".into()).is_auth_error());

        let fatal = SyncError::from(DbError::StorageUnavailable("file is not a database".into()));
        assert!(fatal.is_fatal());
        assert!(!SyncError::from(DbError::QueryFailed("locked".into())).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::table("sites", "connection reset");
        assert!(err.to_string().contains("sites"));
        assert!(err.to_string().contains("connection reset"));
    }
}
