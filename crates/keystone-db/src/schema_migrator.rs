//! # Schema Migrator
//!
//! Additive, idempotent reconciliation of the actual SQLite schema against an
//! [`ExpectedSchema`].
//!
//! ## Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for each expected table                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  PRAGMA table_info("<table>")                                          │
//! │       │                                                                 │
//! │       ├── no columns  → CREATE TABLE            (1 migration)          │
//! │       │                                                                 │
//! │       └── for each expected column not present                         │
//! │                → ALTER TABLE .. ADD COLUMN     (1 migration each)      │
//! │                   failure: warn SchemaMismatch, keep going             │
//! │                                                                         │
//! │  Never DROP, never RENAME. A column that could not be added is tried   │
//! │  again on the next startup.                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;

use keystone_core::schema::{ExpectedSchema, LocalType, TableSpec};
use keystone_core::validation::{quote_ident, validate_identifier};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

impl ColumnInfo {
    pub fn local_type(&self) -> LocalType {
        LocalType::from_declared(&self.declared_type)
    }
}

/// Reads the column list of a table. Empty when the table does not exist.
pub async fn table_info(pool: &SqlitePool, table: &str) -> DbResult<Vec<ColumnInfo>> {
    validate_identifier("table", table)?;

    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.try_get("name")?,
                declared_type: row.try_get("type")?,
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                primary_key: row.try_get::<i64, _>("pk")? != 0,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(DbError::from)
}

/// Reconciles the Local Store schema.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    pool: SqlitePool,
}

impl SchemaMigrator {
    pub fn new(pool: SqlitePool) -> Self {
        SchemaMigrator { pool }
    }

    /// Applies every missing table and column, returning how many DDL
    /// statements succeeded.
    ///
    /// Only a fatal storage error is returned; everything else is logged and
    /// skipped.
    pub async fn reconcile(&self, expected: &ExpectedSchema) -> DbResult<usize> {
        let mut applied = 0;

        for table in &expected.tables {
            match self.reconcile_table(table).await {
                Ok(n) => applied += n,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(table = %table.name, error = %e, "Skipping table during schema reconciliation");
                }
            }
        }

        if applied > 0 {
            info!(applied, "Schema reconciled");
        } else {
            debug!("Schema already up to date");
        }

        Ok(applied)
    }

    async fn reconcile_table(&self, table: &TableSpec) -> DbResult<usize> {
        let actual = table_info(&self.pool, &table.name).await?;

        if actual.is_empty() {
            self.create_table(table).await?;
            return Ok(1);
        }

        let present: HashSet<String> = actual.iter().map(|c| c.name.to_ascii_lowercase()).collect();
        let mut applied = 0;

        for column in &table.columns {
            if present.contains(&column.name.to_ascii_lowercase()) {
                continue;
            }

            if let Err(e) = validate_identifier("column", &column.name) {
                warn!(table = %table.name, column = %column.name, error = %e, "Invalid column name");
                continue;
            }

            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(&table.name),
                quote_ident(&column.name),
                column.additive_definition()
            );

            match sqlx::query(&sql).execute(&self.pool).await {
                Ok(_) => {
                    info!(table = %table.name, column = %column.name, "Added missing column");
                    applied += 1;
                }
                Err(e) => {
                    let e = DbError::from(e);
                    if e.is_fatal() {
                        return Err(e);
                    }
                    let mismatch = DbError::SchemaMismatch {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        message: e.to_string(),
                    };
                    warn!(error = %mismatch, "Column addition failed, will retry on next startup");
                }
            }
        }

        Ok(applied)
    }

    async fn create_table(&self, table: &TableSpec) -> DbResult<()> {
        let mut parts = Vec::with_capacity(table.columns.len() + table.constraints.len());
        for column in &table.columns {
            validate_identifier("column", &column.name)?;
            parts.push(format!("{} {}", quote_ident(&column.name), column.definition));
        }
        parts.extend(table.constraints.iter().cloned());

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&table.name),
            parts.join(", ")
        );

        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table = %table.name, columns = table.columns.len(), "Created missing table");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{DbConfig, LocalStore};

    fn parts_schema() -> ExpectedSchema {
        ExpectedSchema::new().table(
            TableSpec::new("parts")
                .column("id", "INTEGER PRIMARY KEY")
                .column("name", "TEXT")
                .column("quantity", "INTEGER NOT NULL DEFAULT 0")
                .column("supplier", "TEXT"),
        )
    }

    async fn store() -> LocalStore {
        LocalStore::open(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_creates_missing_table() {
        let store = store().await;
        let migrator = SchemaMigrator::new(store.pool().clone());

        assert_eq!(migrator.reconcile(&parts_schema()).await.unwrap(), 1);

        let columns = table_info(store.pool(), "parts").await.unwrap();
        assert_eq!(columns.len(), 4);
        assert!(columns[0].primary_key);
    }

    #[tokio::test]
    async fn test_adds_only_missing_columns() {
        let store = store().await;
        sqlx::query("CREATE TABLE parts (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO parts (id, name) VALUES (1, 'Belt')")
            .execute(store.pool())
            .await
            .unwrap();

        let migrator = SchemaMigrator::new(store.pool().clone());
        assert_eq!(migrator.reconcile(&parts_schema()).await.unwrap(), 2);

        // Existing rows survive and pick up the default.
        let qty: i64 = sqlx::query_scalar("SELECT quantity FROM parts WHERE id = 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(qty, 0);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = store().await;
        let migrator = SchemaMigrator::new(store.pool().clone());

        assert!(migrator.reconcile(&parts_schema()).await.unwrap() > 0);
        assert_eq!(migrator.reconcile(&parts_schema()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_column_does_not_stop_the_rest() {
        let store = store().await;
        sqlx::query("CREATE TABLE parts (id INTEGER PRIMARY KEY)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO parts (id) VALUES (1)")
            .execute(store.pool())
            .await
            .unwrap();

        // NOT NULL without a default cannot be added to a table with rows.
        let schema = ExpectedSchema::new().table(
            TableSpec::new("parts")
                .column("id", "INTEGER PRIMARY KEY")
                .column("sku", "TEXT NOT NULL")
                .column("name", "TEXT"),
        );

        let migrator = SchemaMigrator::new(store.pool().clone());
        assert_eq!(migrator.reconcile(&schema).await.unwrap(), 1);

        let names: Vec<String> = table_info(store.pool(), "parts")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id".to_string(), "name".to_string()]);
    }

    #[tokio::test]
    async fn test_never_drops_extra_columns() {
        let store = store().await;
        sqlx::query("CREATE TABLE parts (id INTEGER PRIMARY KEY, legacy TEXT)")
            .execute(store.pool())
            .await
            .unwrap();

        let migrator = SchemaMigrator::new(store.pool().clone());
        migrator.reconcile(&parts_schema()).await.unwrap();

        let columns = table_info(store.pool(), "parts").await.unwrap();
        assert!(columns.iter().any(|c| c.name == "legacy"));
    }
}
