//! # Built-in Local Store Schema
//!
//! The store's own tables are described as an [`ExpectedSchema`] and applied
//! through the [`SchemaMigrator`] on every open, so an older store file gains
//! any table or column added since it was created.
//!
//! ## Tables
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  pending_operations   durable queue of unconfirmed writes (seq order)  │
//! │  response_cache       last server response per endpoint                │
//! │  auth_tokens          one live token per user                          │
//! │  offline_credentials  argon2 hashes for offline login                  │
//! │  sync_checkpoint      single row: last fully successful sync           │
//! │  table_sync_status    last outcome per mirrored table                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding Columns
//!
//! Append to the table's spec. Give the column a DEFAULT if it is NOT NULL,
//! otherwise SQLite cannot add it to an existing table.

use keystone_core::schema::{ExpectedSchema, TableSpec};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::DbResult;
use crate::schema_migrator::SchemaMigrator;

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_pending_state_seq ON pending_operations (sync_state, seq)",
    "CREATE INDEX IF NOT EXISTS idx_pending_updated ON pending_operations (updated_at)",
];

/// The schema of the store's own tables.
pub fn local_schema() -> ExpectedSchema {
    ExpectedSchema::new()
        .table(
            TableSpec::new("pending_operations")
                .column("seq", "INTEGER PRIMARY KEY AUTOINCREMENT")
                .column("id", "TEXT NOT NULL DEFAULT '' UNIQUE")
                .column("method", "TEXT NOT NULL DEFAULT 'POST'")
                .column("endpoint", "TEXT NOT NULL DEFAULT ''")
                .column("payload", "TEXT")
                .column("created_at", "TEXT NOT NULL DEFAULT ''")
                .column("updated_at", "TEXT NOT NULL DEFAULT ''")
                .column("sync_state", "TEXT NOT NULL DEFAULT 'pending'")
                .column("attempts", "INTEGER NOT NULL DEFAULT 0")
                .column("last_error", "TEXT"),
        )
        .table(
            TableSpec::new("response_cache")
                .column("endpoint", "TEXT PRIMARY KEY")
                .column("payload", "TEXT NOT NULL DEFAULT ''")
                .column("cached_at", "TEXT NOT NULL DEFAULT ''"),
        )
        .table(
            TableSpec::new("auth_tokens")
                .column("user_id", "TEXT PRIMARY KEY")
                .column("token", "TEXT NOT NULL DEFAULT ''")
                .column("issued_at", "TEXT NOT NULL DEFAULT ''")
                .column("expires_at", "TEXT NOT NULL DEFAULT ''")
                .column("refresh_token", "TEXT"),
        )
        .table(
            TableSpec::new("offline_credentials")
                .column("username", "TEXT PRIMARY KEY")
                .column("user_id", "TEXT NOT NULL DEFAULT ''")
                .column("password_hash", "TEXT NOT NULL DEFAULT ''")
                .column("claims", "TEXT NOT NULL DEFAULT '{}'")
                .column("updated_at", "TEXT NOT NULL DEFAULT ''"),
        )
        .table(
            TableSpec::new("sync_checkpoint")
                .column("id", "INTEGER PRIMARY KEY CHECK (id = 1)")
                .column("synced_at", "TEXT NOT NULL DEFAULT ''"),
        )
        .table(
            TableSpec::new("table_sync_status")
                .column("table_name", "TEXT PRIMARY KEY")
                .column("status", "TEXT NOT NULL DEFAULT 'error'")
                .column("row_count", "INTEGER NOT NULL DEFAULT 0")
                .column("message", "TEXT")
                .column("synced_at", "TEXT NOT NULL DEFAULT ''"),
        )
}

/// Brings the store's own tables up to date.
///
/// ## Returns
/// Number of DDL statements applied (0 on an up-to-date store).
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<usize> {
    info!("Reconciling local store schema");

    let applied = SchemaMigrator::new(pool.clone())
        .reconcile(&local_schema())
        .await?;

    for sql in INDEXES {
        if let Err(e) = sqlx::query(sql).execute(pool).await {
            warn!(error = %e, statement = %sql, "Index creation failed");
        }
    }

    info!(applied, "Local store schema ready");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::RESERVED_TABLES;

    #[test]
    fn test_local_schema_covers_reserved_tables() {
        let schema = local_schema();
        for name in RESERVED_TABLES {
            assert!(schema.get(name).is_some(), "{name} missing from local schema");
        }
    }

    #[test]
    fn test_not_null_columns_have_defaults() {
        for table in local_schema().tables {
            for column in table.columns {
                let def = column.additive_definition().to_ascii_uppercase();
                if def.contains("NOT NULL") {
                    assert!(def.contains("DEFAULT"), "{}.{}", table.name, column.name);
                }
            }
        }
    }
}
