//! # keystone-sync: Tokens, Transport and Sync Engine for Keystone
//!
//! Everything that talks to the server: session tokens, the authenticated
//! HTTP client, table mirroring, replay of queued mutations and the
//! background agent that drives them.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncAgent (background task)                   │  │
//! │  │  interval + on-demand cycles, coalesced, cancellable             │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┴─────────────────────┐                  │
//! │         ▼                                           ▼                   │
//! │  ┌────────────────┐                       ┌────────────────────────┐   │
//! │  │ OutboxProcessor│   OfflineGateway      │      SyncEngine        │   │
//! │  │                │   (app-facing         │                        │   │
//! │  │ Replays queued │    submit / fetch)    │ RemoteSource ──► type  │   │
//! │  │ mutations      │         │             │ translation ──► shadow │   │
//! │  │ in order       │         │             │ table ──► atomic swap  │   │
//! │  └───────┬────────┘         │             └───────────┬────────────┘   │
//! │          └──────────────────┼─────────────────────────┘                │
//! │                             ▼                                           │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  TransportClient: bearer auth, 401 → refresh → replay once,      │  │
//! │  │  timeouts, probe(), RetryPolicy for idempotent calls             │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  TokenManager: HS256 issue / validate / refresh, single-flight   │  │
//! │  │  session refresh, offline login against stored credentials       │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Background `SyncAgent` and its handle
//! - [`auth`] - `TokenManager` and offline login
//! - [`config`] - TOML + environment configuration
//! - [`engine`] - Table mirroring
//! - [`error`] - Sync error types
//! - [`gateway`] - Offline-aware submit and fetch
//! - [`outbox`] - Replay of queued mutations
//! - [`remote`] - Remote table source and its HTTP implementation
//! - [`retry`] - Exponential backoff for idempotent calls
//! - [`transport`] - Authenticated HTTP client
//!
//! ## Usage
//!
//! ```rust,ignore
//! use keystone_sync::{SyncConfig, TokenManager, TransportClient, SyncEngine};
//!
//! let config = SyncConfig::load(None)?;
//! let store = LocalStore::open(config.db_config()).await?;
//! let tokens = Arc::new(TokenManager::from_settings(store.clone(), &config.auth));
//! let client = TransportClient::new(
//!     TransportConfig::from_settings(&config.remote),
//!     tokens,
//!     "u-1",
//!     RetryPolicy::from_settings(&config.retry),
//! )?;
//! let engine = SyncEngine::new(store, Arc::new(HttpRemoteSource::new(client)));
//! let report = engine.sync_tables(config.tables()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod outbox;
pub mod remote;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{NoOpEmitter, SyncAgent, SyncAgentConfig, SyncAgentHandle, SyncEventEmitter, SyncStatus};
pub use auth::{Claims, TokenManager};
pub use config::SyncConfig;
pub use engine::{CancelFlag, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use gateway::{FetchOutcome, OfflineGateway, QueueReason, SubmitOutcome};
pub use outbox::{OutboxProcessor, ReplayReport};
pub use remote::{HttpRemoteSource, RemoteSource, RemoteTable};
pub use retry::RetryPolicy;
pub use transport::{TransportClient, TransportConfig, TransportResponse};
