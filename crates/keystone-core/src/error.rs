//! # Error Types
//!
//! Domain-specific error types for keystone-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  keystone-core errors (this file)                                      │
//! │  ├── CoreError        - Parsing and conversion failures                │
//! │  └── ValidationError  - Identifier / endpoint validation failures      │
//! │                                                                         │
//! │  keystone-db errors                                                    │
//! │  └── DbError          - Local Store failures (StorageUnavailable, ...) │
//! │                                                                         │
//! │  keystone-sync errors                                                  │
//! │  └── SyncError        - Network, auth, token and table sync failures   │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError → caller      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while parsing or converting core types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An HTTP method string that is not one of GET/POST/PUT/PATCH/DELETE.
    #[error("Unknown HTTP method: {0}")]
    UnknownMethod(String),

    /// A persisted sync state that is not pending/synced/failed.
    ///
    /// ## When This Occurs
    /// - The store was edited by hand
    /// - A newer build wrote a state this build does not know
    #[error("Unknown sync state: {0}")]
    UnknownSyncState(String),

    /// A positional row whose width does not match the column list.
    #[error("Row has {actual} values, expected {expected}")]
    RowWidthMismatch { expected: usize, actual: usize },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g. an identifier with a quote in it).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Name collides with a table the Local Store owns.
    #[error("{field} '{value}' is reserved")]
    Reserved { field: String, value: String },

    /// Same name listed twice.
    #[error("{field} '{value}' is listed more than once")]
    Duplicate { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
