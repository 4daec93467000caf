//! # keystone-core: Pure Types for the Keystone Sync Core
//!
//! Everything in this crate is deterministic and free of I/O. The storage
//! crate (`keystone-db`) and the sync crate (`keystone-sync`) both build on
//! these types.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Keystone Offline Sync Core                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               keystone-sync (Tokens, Transport, Engine)         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               keystone-db (Local Store, Schema Migrator)        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ keystone-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   value   │  │  schema   │  │ validation│  │   │
//! │  │   │ Pending   │  │ RowValue  │  │ RemoteKind│  │ table &   │  │   │
//! │  │   │ AuthToken │  │           │  │ LocalType │  │ endpoint  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Data model (PendingOperation, CachedResponse, AuthToken, ...)
//! - [`value`] - Explicit row value variant moved between the two stores
//! - [`schema`] - Remote-to-local column type translation
//! - [`validation`] - Identifier and endpoint validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use keystone_core::schema::{translate_type, LocalType};
//!
//! assert_eq!(translate_type("boolean"), LocalType::Integer);
//! assert_eq!(translate_type("character varying(120)"), LocalType::Text);
//! assert_eq!(translate_type("numeric(10,2)"), LocalType::Real);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod schema;
pub mod types;
pub mod validation;
pub mod value;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use schema::{LocalColumn, LocalType, RemoteColumn, RemoteKind, TemporalKind};
pub use types::*;
pub use value::RowValue;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Suffix of the shadow table built during a table sync.
///
/// `parts` is rebuilt as `parts_temp` and then renamed into place.
pub const SHADOW_SUFFIX: &str = "_temp";

/// Tables owned by the Local Store itself.
///
/// None of these may be mirrored from the remote store; a sync would
/// otherwise replace the pending queue or the token table.
pub const RESERVED_TABLES: &[&str] = &[
    "pending_operations",
    "response_cache",
    "auth_tokens",
    "offline_credentials",
    "sync_checkpoint",
    "table_sync_status",
];

/// Canonical text form of a datetime in the Local Store.
pub const CANONICAL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical text form of a date-only value.
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Canonical text form of a time-only value.
pub const CANONICAL_TIME_FORMAT: &str = "%H:%M:%S";
