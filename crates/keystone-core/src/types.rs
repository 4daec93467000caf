//! # Data Model
//!
//! Types persisted by the Local Store and exchanged with the sync layer.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Data Model                                      │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌─────────────────┐  ┌─────────────────┐        │
//! │  │ PendingOperation │  │ CachedResponse  │  │   AuthToken     │        │
//! │  │  ──────────────  │  │  ─────────────  │  │  ─────────────  │        │
//! │  │  id (UUID)       │  │  endpoint (PK)  │  │  user_id (PK)   │        │
//! │  │  seq (order)     │  │  payload        │  │  token (JWT)    │        │
//! │  │  method/endpoint │  │  cached_at      │  │  expires_at     │        │
//! │  │  sync_state      │  └─────────────────┘  └─────────────────┘        │
//! │  └──────────────────┘                                                   │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌─────────────────┐                             │
//! │  │ SyncCheckpoint   │  │  TableOutcome   │                             │
//! │  │  timestamp       │  │  success{rows}  │                             │
//! │  │  (monotonic)     │  │  error{message} │                             │
//! │  └──────────────────┘  └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## PendingOperation Lifecycle
//! ```text
//!   enqueue ──► PENDING ──── delivered ────► SYNCED ──► (cleanup deletes)
//!                  │  ▲
//!   retries spent  │  │ retry(id)
//!                  ▼  │
//!                 FAILED
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// =============================================================================
// HTTP Method
// =============================================================================

/// HTTP method of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Returns the canonical upper-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Returns true for methods that change server state.
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(CoreError::UnknownMethod(other.to_string())),
        }
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Delivery state of a [`PendingOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Not yet confirmed by the server.
    #[default]
    Pending,
    /// Server confirmed delivery.
    Synced,
    /// Retries exhausted. Still retryable through `retry(id)`.
    Failed,
}

impl SyncState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            "failed" => Ok(SyncState::Failed),
            other => Err(CoreError::UnknownSyncState(other.to_string())),
        }
    }
}

// =============================================================================
// Pending Operation
// =============================================================================

/// A durably queued write destined for the remote server.
///
/// Created whenever a mutation cannot be confirmed as delivered. Replayed in
/// `seq` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Operation id (UUID v4), returned by `enqueue`.
    pub id: String,

    /// Monotonic enqueue position. Replay order.
    pub seq: i64,

    pub method: HttpMethod,

    /// Server path, e.g. `/api/parts/42`.
    pub endpoint: String,

    /// JSON body, if the mutation has one.
    pub payload: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub sync_state: SyncState,

    /// Delivery attempts so far.
    pub attempts: i64,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Returns true if the operation still waits for delivery.
    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::Pending
    }
}

// =============================================================================
// Cached Response
// =============================================================================

/// Last known server response for an endpoint. Last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub endpoint: String,
    pub payload: serde_json::Value,
    pub cached_at: DateTime<Utc>,
}

// =============================================================================
// Auth Token
// =============================================================================

/// The single persisted token of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub user_id: String,

    /// Signed JWT.
    pub token: String,

    pub issued_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Server-issued refresh token, when the server hands one out.
    pub refresh_token: Option<String>,
}

impl AuthToken {
    /// Expiry is a hard boundary: a token is expired at `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// =============================================================================
// Offline Credential
// =============================================================================

/// Locally cached credential used for password login without network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineCredential {
    pub username: String,
    pub user_id: String,

    /// Argon2 PHC string. Never the password itself.
    pub password_hash: String,

    /// Claims re-embedded in tokens issued by an offline login.
    pub claims: serde_json::Map<String, serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Checkpoint
// =============================================================================

/// Time of the last fully successful sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Table Outcome
// =============================================================================

/// Result of synchronizing one mirrored table.
///
/// Serialized as `{"status": "success", "rows": 3}` or
/// `{"status": "error", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Success { rows: u64 },
    Error { message: String },
}

impl TableOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TableOutcome::Success { .. })
    }

    /// Rows written, zero for failures.
    pub fn rows_synced(&self) -> u64 {
        match self {
            TableOutcome::Success { rows } => *rows,
            TableOutcome::Error { .. } => 0,
        }
    }

    /// Failure message, `None` for successes.
    pub fn error(&self) -> Option<&str> {
        match self {
            TableOutcome::Success { .. } => None,
            TableOutcome::Error { message } => Some(message),
        }
    }

    /// Status label as persisted in `table_sync_status`.
    pub fn status_str(&self) -> &'static str {
        match self {
            TableOutcome::Success { .. } => "success",
            TableOutcome::Error { .. } => "error",
        }
    }
}

/// Per-table outcomes of one `sync_tables` call, keyed by table name.
pub type SyncReport = BTreeMap<String, TableOutcome>;

/// Last recorded outcome of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSyncStatus {
    pub table_name: String,
    pub outcome: TableOutcome,
    pub synced_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_http_method_parsing() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!(" DELETE ".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert!(!HttpMethod::Get.is_mutation());
        assert!(HttpMethod::Patch.is_mutation());
    }

    #[test]
    fn test_sync_state_roundtrip_through_str() {
        for state in [SyncState::Pending, SyncState::Synced, SyncState::Failed] {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("done".parse::<SyncState>().is_err());
    }

    #[test]
    fn test_table_outcome_serialization() {
        let ok = TableOutcome::Success { rows: 3 };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"status": "success", "rows": 3})
        );

        let err = TableOutcome::Error {
            message: "connection reset".into(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!({"status": "error", "message": "connection reset"})
        );
        assert_eq!(err.rows_synced(), 0);
        assert_eq!(err.error(), Some("connection reset"));
    }

    #[test]
    fn test_token_expiry_is_hard_boundary() {
        let now = Utc::now();
        let token = AuthToken {
            user_id: "u1".into(),
            token: "jwt".into(),
            issued_at: now,
            expires_at: now,
            refresh_token: None,
        };
        assert!(token.is_expired_at(now));
        assert!(!token.is_expired_at(now - Duration::seconds(1)));
    }
}
