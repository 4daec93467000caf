//! # Mirrored Table Repository
//!
//! Local copies of server tables, replaced wholesale on each sync.
//!
//! ## Shadow Build and Atomic Swap
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  TX 1 (build)                                                          │
//! │    DROP TABLE IF EXISTS "parts_temp"      ← leftover of a failed run   │
//! │    CREATE TABLE "parts_temp" (translated columns)                      │
//! │    INSERT INTO "parts_temp" ... × N                                    │
//! │  COMMIT                                                                 │
//! │                                                                         │
//! │  TX 2 (swap)                                                           │
//! │    DROP TABLE IF EXISTS "parts"                                        │
//! │    ALTER TABLE "parts_temp" RENAME TO "parts"                          │
//! │  COMMIT                                                                 │
//! │                                                                         │
//! │  Readers (WAL) see the committed snapshot before TX 2 or after it:     │
//! │  the complete old table or the complete new one.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows that exist only locally in a mirrored table do not survive a swap.
//! Local writes travel through the pending operation queue instead.

use std::collections::HashSet;

use keystone_core::validation::{quote_ident, shadow_name, validate_identifier, validate_table_name};
use keystone_core::{CoreError, LocalColumn, RowValue, ValidationError};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::error::DbResult;
use crate::schema_migrator::{table_info, ColumnInfo};

/// Repository for mirrored server tables.
#[derive(Debug, Clone)]
pub struct MirrorRepository {
    pool: SqlitePool,
}

impl MirrorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MirrorRepository { pool }
    }

    /// Replaces `table` with exactly `rows`.
    ///
    /// ## Returns
    /// Number of rows now in the table.
    ///
    /// ## Errors
    /// Any failure before the swap commits leaves the previous table
    /// untouched.
    pub async fn replace_table(
        &self,
        table: &str,
        columns: &[LocalColumn],
        rows: Vec<Vec<RowValue>>,
    ) -> DbResult<u64> {
        validate_table_name(table)?;
        validate_columns(columns)?;

        let shadow = shadow_name(table);
        let quoted_table = quote_ident(table);
        let quoted_shadow = quote_ident(&shadow);

        let column_defs = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.local_type.as_sql()))
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");

        let drop_shadow = format!("DROP TABLE IF EXISTS {quoted_shadow}");
        let create_shadow = format!("CREATE TABLE {quoted_shadow} ({column_defs})");
        let insert = format!("INSERT INTO {quoted_shadow} ({column_list}) VALUES ({placeholders})");

        debug!(table = %table, columns = columns.len(), rows = rows.len(), "Building shadow table");

        // Build
        let mut tx = self.pool.begin().await?;
        sqlx::query(&drop_shadow).execute(&mut *tx).await?;
        sqlx::query(&create_shadow).execute(&mut *tx).await?;

        let mut inserted: u64 = 0;
        for row in rows {
            if row.len() != columns.len() {
                return Err(CoreError::RowWidthMismatch {
                    expected: columns.len(),
                    actual: row.len(),
                }
                .into());
            }

            let mut query = sqlx::query(&insert);
            for value in row {
                query = bind_value(query, value);
            }
            query.execute(&mut *tx).await?;
            inserted += 1;
        }
        tx.commit().await?;

        // Swap
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {quoted_table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("ALTER TABLE {quoted_shadow} RENAME TO {quoted_table}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(table = %table, rows = inserted, "Swapped in new table snapshot");
        Ok(inserted)
    }

    /// Returns true if the table exists.
    pub async fn table_exists(&self, table: &str) -> DbResult<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Number of rows in a mirrored table.
    pub async fn row_count(&self, table: &str) -> DbResult<i64> {
        validate_identifier("table", table)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Column layout of a mirrored table.
    pub async fn columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        table_info(&self.pool, table).await
    }

    /// Reads rows in insertion order, values in column order.
    pub async fn rows(&self, table: &str, limit: Option<u32>) -> DbResult<Vec<Vec<RowValue>>> {
        validate_identifier("table", table)?;
        let mut sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

fn validate_columns(columns: &[LocalColumn]) -> DbResult<()> {
    if columns.is_empty() {
        return Err(ValidationError::Required {
            field: "columns".to_string(),
        }
        .into());
    }

    let mut seen = HashSet::new();
    for column in columns {
        validate_identifier("column", &column.name)?;
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(ValidationError::Duplicate {
                field: "column".to_string(),
                value: column.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: RowValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value.into_storage() {
        RowValue::Null => query.bind(None::<String>),
        RowValue::Integer(i) => query.bind(i),
        RowValue::Real(f) => query.bind(f),
        RowValue::Text(s) => query.bind(s),
        RowValue::Bytes(b) => query.bind(b),
        // into_storage already turned booleans into integers
        RowValue::Boolean(b) => query.bind(i64::from(b)),
    }
}

fn decode_row(row: &SqliteRow) -> DbResult<Vec<RowValue>> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &SqliteRow, idx: usize) -> DbResult<RowValue> {
    let type_name = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(RowValue::Null);
        }
        raw.type_info().name().to_string()
    };

    let value = match type_name.as_str() {
        "INTEGER" => RowValue::Integer(row.try_get(idx)?),
        "REAL" => RowValue::Real(row.try_get(idx)?),
        "BLOB" => RowValue::Bytes(row.try_get(idx)?),
        _ => RowValue::Text(row.try_get(idx)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pool::{temp_db_path, DbConfig, LocalStore};
    use keystone_core::schema::{translate_columns, RemoteColumn};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn part_columns() -> Vec<LocalColumn> {
        translate_columns(&[
            RemoteColumn::new("id", "integer"),
            RemoteColumn::new("name", "character varying(80)"),
            RemoteColumn::new("in_stock", "boolean"),
            RemoteColumn::new("unit_cost", "numeric(10,2)"),
        ])
    }

    fn part_rows(n: i64) -> Vec<Vec<RowValue>> {
        (0..n)
            .map(|i| {
                vec![
                    RowValue::Integer(i),
                    RowValue::Text(format!("part-{i}")),
                    RowValue::Boolean(i % 2 == 0),
                    RowValue::Real(1.5 * i as f64),
                ]
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replace_creates_and_replaces() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let mirror = store.mirror();

        assert_eq!(mirror.replace_table("parts", &part_columns(), part_rows(3)).await.unwrap(), 3);
        assert_eq!(mirror.row_count("parts").await.unwrap(), 3);

        assert_eq!(mirror.replace_table("parts", &part_columns(), part_rows(1)).await.unwrap(), 1);
        assert_eq!(mirror.row_count("parts").await.unwrap(), 1);
        assert!(!mirror.table_exists("parts_temp").await.unwrap());

        let rows = mirror.rows("parts", None).await.unwrap();
        assert_eq!(
            rows[0],
            vec![
                RowValue::Integer(0),
                RowValue::Text("part-0".into()),
                RowValue::Integer(1),
                RowValue::Real(0.0),
            ]
        );

        let columns = mirror.columns("parts").await.unwrap();
        assert_eq!(columns[2].declared_type, "INTEGER");
        assert_eq!(columns[3].declared_type, "REAL");
    }

    #[tokio::test]
    async fn test_schema_change_is_picked_up() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let mirror = store.mirror();
        mirror.replace_table("parts", &part_columns(), part_rows(2)).await.unwrap();

        let narrower = translate_columns(&[RemoteColumn::new("id", "bigint")]);
        mirror
            .replace_table("parts", &narrower, vec![vec![RowValue::Integer(9)]])
            .await
            .unwrap();

        assert_eq!(mirror.columns("parts").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_row_keeps_old_snapshot() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let mirror = store.mirror();
        mirror.replace_table("parts", &part_columns(), part_rows(4)).await.unwrap();

        let mut rows = part_rows(2);
        rows.push(vec![RowValue::Integer(1)]);
        assert!(mirror.replace_table("parts", &part_columns(), rows).await.is_err());

        assert_eq!(mirror.row_count("parts").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_rejects_reserved_and_invalid_names() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let mirror = store.mirror();

        let err = mirror
            .replace_table("pending_operations", &part_columns(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        assert_eq!(store.pending().pending_count().await.unwrap(), 0);

        let bad = translate_columns(&[RemoteColumn::new("id; DROP TABLE x", "int")]);
        assert!(mirror.replace_table("parts", &bad, vec![]).await.is_err());

        let dup = translate_columns(&[RemoteColumn::new("id", "int"), RemoteColumn::new("ID", "int")]);
        assert!(mirror.replace_table("parts", &dup, vec![]).await.is_err());

        assert!(mirror.replace_table("parts", &[], vec![]).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reader_sees_old_or_new_count() {
        let path = temp_db_path();
        let store = LocalStore::open(DbConfig::new(&path)).await.unwrap();
        let mirror = store.mirror();
        mirror.replace_table("parts", &part_columns(), part_rows(100)).await.unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let mirror = store.mirror();
            let done = done.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    seen.push(mirror.row_count("parts").await.unwrap());
                    tokio::task::yield_now().await;
                }
                seen.push(mirror.row_count("parts").await.unwrap());
                seen
            })
        };

        for _ in 0..3 {
            mirror.replace_table("parts", &part_columns(), part_rows(250)).await.unwrap();
            mirror.replace_table("parts", &part_columns(), part_rows(100)).await.unwrap();
        }
        mirror.replace_table("parts", &part_columns(), part_rows(250)).await.unwrap();
        done.store(true, Ordering::SeqCst);

        let seen = reader.await.unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&n| n == 100 || n == 250), "{seen:?}");
        assert_eq!(*seen.last().unwrap(), 250);
    }
}
