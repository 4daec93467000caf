//! # keystone-db: Local Store for the Keystone Sync Core
//!
//! Embedded SQLite storage: the pending write queue, the response cache,
//! persisted tokens, offline credentials, mirrored server tables and the
//! sync checkpoint.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Keystone Data Flow                                │
//! │                                                                         │
//! │  OfflineGateway::submit / SyncEngine::sync_tables                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    keystone-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │  Repositories │    │   Schema     │  │   │
//! │  │   │  (pool.rs)    │    │               │    │   Migrator   │  │   │
//! │  │   │               │    │ Pending       │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ Cache, Token  │    │ additive     │  │   │
//! │  │   │ PayloadCipher │    │ Mirror        │    │ ADD COLUMN   │  │   │
//! │  │   │ queue mutex   │    │ Checkpoint    │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   keystone.db (WAL)            keystone.last_sync (marker)     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Store configuration and opening
//! - [`migrations`] - Built-in schema of the store's own tables
//! - [`schema_migrator`] - Additive schema reconciliation
//! - [`crypto`] - Payload encryption at rest
//! - [`repository`] - Repository implementations
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keystone_db::{DbConfig, LocalStore};
//!
//! let store = LocalStore::open(DbConfig::new("data/keystone.db")).await?;
//! let id = store.enqueue(HttpMethod::Post, "/api/parts", Some(&payload)).await?;
//! let queued = store.pending_operations().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod crypto;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod schema_migrator;

// =============================================================================
// Re-exports
// =============================================================================

pub use crypto::PayloadCipher;
pub use error::{DbError, DbResult};
pub use pool::{DbConfig, LocalStore};
pub use schema_migrator::{ColumnInfo, SchemaMigrator};

// Repository re-exports for convenience
pub use repository::cache::CacheRepository;
pub use repository::checkpoint::CheckpointRepository;
pub use repository::credential::CredentialRepository;
pub use repository::mirror::MirrorRepository;
pub use repository::pending::PendingRepository;
pub use repository::token::TokenRepository;
