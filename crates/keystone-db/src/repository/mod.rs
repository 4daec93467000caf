//! # Repository Module
//!
//! Repository implementations for the Local Store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Caller (token manager, gateway, sync engine)                          │
//! │       │                                                                 │
//! │       │  store.pending().enqueue(POST, "/api/parts", payload)          │
//! │       ▼                                                                 │
//! │  PendingRepository                                                     │
//! │  ├── enqueue / pending_operations                                      │
//! │  ├── mark_synced / mark_failed / retry                                 │
//! │  └── record_attempt / cleanup_synced                                   │
//! │       │                                                                 │
//! │       │  SQL (sealed through PayloadCipher when enabled)               │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`PendingRepository`](pending::PendingRepository) - Durable write queue
//! - [`CacheRepository`](cache::CacheRepository) - Last-known responses
//! - [`TokenRepository`](token::TokenRepository) - One live token per user
//! - [`CredentialRepository`](credential::CredentialRepository) - Offline login hashes
//! - [`MirrorRepository`](mirror::MirrorRepository) - Shadow build + atomic swap
//! - [`CheckpointRepository`](checkpoint::CheckpointRepository) - Checkpoint and table status

pub mod cache;
pub mod checkpoint;
pub mod credential;
pub mod mirror;
pub mod pending;
pub mod token;
