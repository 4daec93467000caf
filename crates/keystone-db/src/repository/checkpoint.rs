//! # Checkpoint Repository
//!
//! The sync checkpoint (time of the last fully successful sync) and the last
//! outcome of every mirrored table.
//!
//! The checkpoint lives in a single-row table and is mirrored to a plain-text
//! marker file holding an RFC 3339 timestamp, so health checks outside the
//! process can read it without opening the database. It only moves forward.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use keystone_core::{SyncCheckpoint, TableOutcome, TableSyncStatus};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    table_name: String,
    status: String,
    row_count: i64,
    message: Option<String>,
    synced_at: DateTime<Utc>,
}

impl StatusRow {
    fn into_status(self) -> DbResult<TableSyncStatus> {
        let outcome = match self.status.as_str() {
            "success" => TableOutcome::Success {
                rows: u64::try_from(self.row_count).unwrap_or(0),
            },
            "error" => TableOutcome::Error {
                message: self.message.unwrap_or_default(),
            },
            other => {
                return Err(DbError::Internal(format!(
                    "unknown table status '{other}' for {}",
                    self.table_name
                )))
            }
        };

        Ok(TableSyncStatus {
            table_name: self.table_name,
            outcome,
            synced_at: self.synced_at,
        })
    }
}

/// Repository for the checkpoint and per-table sync status.
#[derive(Debug, Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
    marker: Option<PathBuf>,
}

impl CheckpointRepository {
    pub fn new(pool: SqlitePool, marker: Option<PathBuf>) -> Self {
        CheckpointRepository { pool, marker }
    }

    /// Current checkpoint, if any sync has ever fully succeeded.
    pub async fn load(&self) -> DbResult<Option<SyncCheckpoint>> {
        let ts: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT synced_at FROM sync_checkpoint WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(ts.map(|timestamp| SyncCheckpoint { timestamp }))
    }

    /// Moves the checkpoint forward to `timestamp`.
    ///
    /// An older or equal timestamp leaves it unchanged. The marker file is
    /// rewritten whenever the checkpoint moves.
    ///
    /// ## Returns
    /// The checkpoint in effect after the call.
    pub async fn advance(&self, timestamp: DateTime<Utc>) -> DbResult<SyncCheckpoint> {
        let mut tx = self.pool.begin().await?;

        let current: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT synced_at FROM sync_checkpoint WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(current) = current {
            if current >= timestamp {
                debug!(current = %current, requested = %timestamp, "Checkpoint not moved backwards");
                return Ok(SyncCheckpoint { timestamp: current });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO sync_checkpoint (id, synced_at) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET synced_at = excluded.synced_at
            "#,
        )
        .bind(timestamp)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.write_marker(timestamp).await;
        debug!(checkpoint = %timestamp, "Checkpoint advanced");
        Ok(SyncCheckpoint { timestamp })
    }

    /// Timestamp in the marker file, if present and parseable.
    pub async fn read_marker(&self) -> Option<DateTime<Utc>> {
        let path = self.marker.as_ref()?;
        let text = tokio::fs::read_to_string(path).await.ok()?;
        DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    async fn write_marker(&self, timestamp: DateTime<Utc>) {
        let Some(path) = &self.marker else {
            return;
        };
        // The database row is authoritative; a stale marker is only logged.
        if let Err(e) = tokio::fs::write(path, format!("{}\n", timestamp.to_rfc3339())).await {
            warn!(path = %path.display(), error = %e, "Could not write sync marker file");
        }
    }

    /// Records the latest outcome for a table.
    pub async fn record_outcome(&self, table: &str, outcome: &TableOutcome) -> DbResult<()> {
        let rows = i64::try_from(outcome.rows_synced()).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT INTO table_sync_status (table_name, status, row_count, message, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(table_name) DO UPDATE SET
                status = excluded.status,
                row_count = excluded.row_count,
                message = excluded.message,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(table)
        .bind(outcome.status_str())
        .bind(rows)
        .bind(outcome.error())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Latest outcome of every table ever synced, by name.
    pub async fn table_statuses(&self) -> DbResult<Vec<TableSyncStatus>> {
        let rows: Vec<StatusRow> = sqlx::query_as(
            r#"
            SELECT table_name, status, row_count, message, synced_at
            FROM table_sync_status
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StatusRow::into_status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{temp_db_path, DbConfig, LocalStore};
    use chrono::Duration;

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let checkpoints = store.checkpoints();
        assert!(checkpoints.load().await.unwrap().is_none());

        let t1 = Utc::now();
        let t0 = t1 - Duration::hours(1);
        let t2 = t1 + Duration::seconds(5);

        assert_eq!(checkpoints.advance(t1).await.unwrap().timestamp, t1);
        assert_eq!(checkpoints.advance(t0).await.unwrap().timestamp, t1);
        assert_eq!(checkpoints.load().await.unwrap().unwrap().timestamp, t1);
        assert_eq!(checkpoints.advance(t2).await.unwrap().timestamp, t2);
        assert_eq!(store.last_checkpoint().await.unwrap(), Some(t2));
    }

    #[tokio::test]
    async fn test_marker_file_follows_checkpoint() {
        let path = temp_db_path();
        let store = LocalStore::open(DbConfig::new(&path)).await.unwrap();
        let checkpoints = store.checkpoints();
        assert!(checkpoints.read_marker().await.is_none());

        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        checkpoints.advance(ts).await.unwrap();

        assert_eq!(checkpoints.read_marker().await, Some(ts));
        let text = std::fs::read_to_string(path.with_extension("last_sync")).unwrap();
        assert!(text.starts_with("2024-05-01T12:00:00"));
    }

    #[tokio::test]
    async fn test_table_status_upsert() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let checkpoints = store.checkpoints();

        checkpoints
            .record_outcome("sites", &TableOutcome::Error { message: "timeout".into() })
            .await
            .unwrap();
        checkpoints
            .record_outcome("machines", &TableOutcome::Success { rows: 12 })
            .await
            .unwrap();
        checkpoints
            .record_outcome("sites", &TableOutcome::Success { rows: 3 })
            .await
            .unwrap();

        let statuses = checkpoints.table_statuses().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].table_name, "machines");
        assert_eq!(statuses[0].outcome, TableOutcome::Success { rows: 12 });
        assert_eq!(statuses[1].outcome, TableOutcome::Success { rows: 3 });
    }
}
