//! # Pending Operation Repository
//!
//! The durable queue of writes not yet confirmed by the server.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  MUTATION (e.g. PUT /api/parts/42)                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  queue_lock held                                                │   │
//! │  │  INSERT INTO pending_operations (id, method, endpoint, ...)     │   │
//! │  │  COMMIT (synchronous = FULL) ─► operation_id returned           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            OUTBOX PROCESSOR (keystone-sync)                     │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT .. WHERE sync_state = 'pending' ORDER BY seq        │   │
//! │  │  2. For each entry, in order:                                  │   │
//! │  │     a. Send through the transport                              │   │
//! │  │     b. On success: mark_synced                                 │   │
//! │  │     c. On transient failure: record_attempt, stop the pass     │   │
//! │  │     d. Retries spent / rejected: mark_failed                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • The id is returned only after the row is on disk                    │
//! │  • Replay order is seq order, which is enqueue order                   │
//! │  • Rows leave the table only through cleanup_synced                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use keystone_core::validation::validate_endpoint;
use keystone_core::{HttpMethod, PendingOperation, SyncState};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::PayloadCipher;
use crate::error::{DbError, DbResult};

const SELECT_COLUMNS: &str = "seq, id, method, endpoint, payload, created_at, updated_at, \
                              sync_state, attempts, last_error";

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    seq: i64,
    id: String,
    method: String,
    endpoint: String,
    payload: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sync_state: String,
    attempts: i64,
    last_error: Option<String>,
}

impl PendingRow {
    fn into_operation(self, cipher: &PayloadCipher) -> DbResult<PendingOperation> {
        let payload = match cipher.open_opt(self.payload.as_deref())? {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };

        Ok(PendingOperation {
            id: self.id,
            seq: self.seq,
            method: self.method.parse()?,
            endpoint: self.endpoint,
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync_state: self.sync_state.parse()?,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

/// Repository for the pending operation queue.
#[derive(Debug, Clone)]
pub struct PendingRepository {
    pool: SqlitePool,
    cipher: PayloadCipher,
    lock: Arc<Mutex<()>>,
}

impl PendingRepository {
    pub fn new(pool: SqlitePool, cipher: PayloadCipher, lock: Arc<Mutex<()>>) -> Self {
        PendingRepository { pool, cipher, lock }
    }

    /// Queues a mutation for delivery.
    ///
    /// ## Arguments
    /// * `method` - HTTP method to replay with
    /// * `endpoint` - Server path, must start with `/`
    /// * `payload` - JSON body, if any
    ///
    /// ## Returns
    /// The operation id. The row is committed before this returns.
    pub async fn enqueue(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<&serde_json::Value>,
    ) -> DbResult<String> {
        validate_endpoint(endpoint)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let payload = match payload {
            Some(value) => Some(self.cipher.seal(&serde_json::to_string(value)?)?),
            None => None,
        };

        let _guard = self.lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO pending_operations (
                id, method, endpoint, payload, created_at, updated_at, sync_state, attempts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, 0)
            "#,
        )
        .bind(&id)
        .bind(method.as_str())
        .bind(endpoint)
        .bind(payload)
        .bind(now)
        .bind(SyncState::Pending.as_str())
        .execute(&self.pool)
        .await?;

        debug!(operation_id = %id, method = %method, endpoint = %endpoint, "Queued operation");
        Ok(id)
    }

    /// Pending operations, oldest first.
    pub async fn pending_operations(&self) -> DbResult<Vec<PendingOperation>> {
        self.list(SyncState::Pending).await
    }

    /// Operations in a given state, in enqueue order.
    pub async fn list(&self, state: SyncState) -> DbResult<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_operations WHERE sync_state = ?1 ORDER BY seq ASC"
        );
        let rows: Vec<PendingRow> = sqlx::query_as(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| row.into_operation(&self.cipher))
            .collect()
    }

    /// Looks up one operation by id.
    pub async fn operation(&self, id: &str) -> DbResult<Option<PendingOperation>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM pending_operations WHERE id = ?1");
        let row: Option<PendingRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_operation(&self.cipher)).transpose()
    }

    /// Marks an operation as delivered.
    pub async fn mark_synced(&self, id: &str) -> DbResult<()> {
        let _guard = self.lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE pending_operations SET
                sync_state = ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(SyncState::Synced.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("PendingOperation", id));
        }

        debug!(operation_id = %id, "Operation synced");
        Ok(())
    }

    /// Marks an operation as failed. It stays in the table and can be
    /// moved back with [`retry`](Self::retry).
    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        let _guard = self.lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE pending_operations SET
                sync_state = ?2,
                last_error = ?3,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(SyncState::Failed.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("PendingOperation", id));
        }

        debug!(operation_id = %id, error = %error, "Operation failed");
        Ok(())
    }

    /// Resets a failed operation to pending with a fresh attempt budget.
    ///
    /// ## Returns
    /// `true` if the operation was failed and is now pending, `false` if it
    /// was not in the failed state.
    pub async fn retry(&self, id: &str) -> DbResult<bool> {
        let _guard = self.lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE pending_operations SET
                sync_state = ?2,
                attempts = 0,
                last_error = NULL,
                updated_at = ?3
            WHERE id = ?1 AND sync_state = ?4
            "#,
        )
        .bind(id)
        .bind(SyncState::Pending.as_str())
        .bind(Utc::now())
        .bind(SyncState::Failed.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(operation_id = %id, "Operation moved back to pending");
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT seq FROM pending_operations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(DbError::not_found("PendingOperation", id)),
        }
    }

    /// Records a failed delivery attempt without changing the state.
    ///
    /// ## Returns
    /// The attempt count after this failure.
    pub async fn record_attempt(&self, id: &str, error: &str) -> DbResult<i64> {
        let _guard = self.lock.lock().await;

        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE pending_operations SET
                attempts = attempts + 1,
                last_error = ?2,
                updated_at = ?3
            WHERE id = ?1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        attempts.ok_or_else(|| DbError::not_found("PendingOperation", id))
    }

    /// Counts pending operations.
    pub async fn pending_count(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_operations WHERE sync_state = ?1")
                .bind(SyncState::Pending.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// Deletes synced operations older than the given age.
    ///
    /// ## Returns
    /// Number of deleted rows.
    pub async fn cleanup_synced(&self, older_than_days: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        let _guard = self.lock.lock().await;

        let result = sqlx::query(
            r#"
            DELETE FROM pending_operations
            WHERE sync_state = ?1
            AND updated_at <= ?2
            "#,
        )
        .bind(SyncState::Synced.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        debug!(deleted = result.rows_affected(), "Cleaned up synced operations");
        Ok(result.rows_affected())
    }
}
