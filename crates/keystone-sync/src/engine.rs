//! # Sync Engine
//!
//! Mirrors server tables into the Local Store, one table at a time.
//!
//! ## Per-Table Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        sync_tables(["sites", "parts"])                  │
//! │                                                                         │
//! │  for each table:                                                       │
//! │    ┌──────────────┐                                                    │
//! │    │ cancelled?   │── yes ──► Error { "cancelled" } (not started)      │
//! │    └──────┬───────┘                                                    │
//! │           ▼                                                             │
//! │    ┌──────────────┐   RemoteSource::fetch_table                        │
//! │    │ 1. Fetch     │   columns + every row                              │
//! │    └──────┬───────┘                                                    │
//! │           ▼                                                             │
//! │    ┌──────────────┐   remote type ──► INTEGER / TEXT / REAL / BLOB     │
//! │    │ 2. Translate │   value ──► RowValue (bool 0/1, canonical dates)   │
//! │    └──────┬───────┘                                                    │
//! │           ▼                                                             │
//! │    ┌──────────────┐   "<table>_temp" built in one transaction,         │
//! │    │ 3-4. Swap    │   swapped into place in another                    │
//! │    └──────┬───────┘                                                    │
//! │           ▼                                                             │
//! │    ┌──────────────┐   Success { rows } | Error { message }             │
//! │    │ 5. Record    │   one table's failure never stops the others       │
//! │    └──────────────┘                                                    │
//! │                                                                         │
//! │  6. All tables succeeded ──► advance checkpoint + marker file          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation is checked before each table. A table whose swap has started
//! always runs to completion or failure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use keystone_core::schema::translate_columns;
use keystone_core::validation::validate_table_name;
use keystone_core::value::convert_row;
use keystone_core::{SyncReport, TableOutcome};
use keystone_db::LocalStore;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteSource;

/// Message reported for tables skipped because the run was cancelled.
pub const CANCELLED_MESSAGE: &str = "cancelled";

// =============================================================================
// Cancel Flag
// =============================================================================

/// Cooperative cancellation shared between the caller and a running sync.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Full-table synchronization from a [`RemoteSource`] into the Local Store.
#[derive(Clone)]
pub struct SyncEngine {
    store: LocalStore,
    remote: Arc<dyn RemoteSource>,
}

impl SyncEngine {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteSource>) -> Self {
        SyncEngine { store, remote }
    }

    /// Syncs `tables` and returns the outcome of each.
    ///
    /// ## Errors
    /// Only fatal storage errors. Everything else is reported per table.
    pub async fn sync_tables(&self, tables: &[String]) -> SyncResult<SyncReport> {
        self.sync_tables_with_cancel(tables, &CancelFlag::new()).await
    }

    /// [`sync_tables`](Self::sync_tables), checking `cancel` before each
    /// table.
    pub async fn sync_tables_with_cancel(
        &self,
        tables: &[String],
        cancel: &CancelFlag,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let mut seen = HashSet::new();
        // SQLite identifiers are case-insensitive; the first spelling wins
        let tables: Vec<&String> = tables
            .iter()
            .filter(|t| seen.insert(t.to_ascii_lowercase()))
            .collect();

        info!(tables = tables.len(), "Sync started");

        let mut report = SyncReport::new();
        for table in tables {
            if cancel.is_cancelled() {
                debug!(table = %table, "Skipping table, sync cancelled");
                report.insert(
                    table.clone(),
                    TableOutcome::Error {
                        message: CANCELLED_MESSAGE.to_string(),
                    },
                );
                continue;
            }

            let outcome = match self.sync_table(table).await {
                Ok(rows) => TableOutcome::Success { rows },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(table = %table, error = %e, "Table sync failed");
                    TableOutcome::Error {
                        message: table_message(e),
                    }
                }
            };

            self.store.checkpoints().record_outcome(table, &outcome).await?;
            report.insert(table.clone(), outcome);
        }

        let failed = report.values().filter(|o| !o.is_success()).count();
        if failed == 0 && !report.is_empty() {
            let checkpoint = self.store.checkpoints().advance(Utc::now()).await?;
            info!(
                tables = report.len(),
                checkpoint = %checkpoint.timestamp,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Sync finished"
            );
        } else {
            warn!(
                tables = report.len(),
                failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Sync finished with failures, checkpoint unchanged"
            );
        }

        Ok(report)
    }

    /// Fetch, translate and swap one table. Returns the rows written.
    async fn sync_table(&self, table: &str) -> SyncResult<u64> {
        validate_table_name(table).map_err(|e| SyncError::table(table, e.to_string()))?;

        let remote = self.remote.fetch_table(table).await?;
        let columns = translate_columns(&remote.columns);

        // Every row is converted before the local table is touched.
        let rows = remote
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                convert_row(&columns, row)
                    .map_err(|e| SyncError::table(table, format!("row {i}: {e}")))
            })
            .collect::<SyncResult<Vec<_>>>()?;

        let written = self.store.mirror().replace_table(table, &columns, rows).await?;
        info!(table = %table, rows = written, "Table synced");
        Ok(written)
    }
}

fn table_message(err: SyncError) -> String {
    match err {
        SyncError::TableSyncError { message, .. } => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRemote;
    use keystone_core::RowValue;
    use keystone_db::DbConfig;
    use serde_json::json;

    async fn engine(remote: Arc<MemoryRemote>) -> (LocalStore, SyncEngine) {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngine::new(store.clone(), remote);
        (store, engine)
    }

    fn names(tables: &[&str]) -> Vec<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    fn sites(remote: &MemoryRemote) {
        remote.put(
            "sites",
            &[("id", "integer"), ("name", "character varying(120)"), ("active", "boolean")],
            vec![
                json!({"id": 1, "name": "North", "active": true}),
                json!({"id": 2, "name": "South", "active": false}),
                json!({"id": 3, "name": "East", "active": true}),
            ],
        );
    }

    #[tokio::test]
    async fn test_sites_with_translated_booleans() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        let (store, engine) = engine(remote).await;

        let report = engine.sync_tables(&names(&["sites"])).await.unwrap();
        assert_eq!(report["sites"], TableOutcome::Success { rows: 3 });

        let mirror = store.mirror();
        assert_eq!(mirror.row_count("sites").await.unwrap(), 3);
        let rows = mirror.rows("sites", None).await.unwrap();
        let active: Vec<RowValue> = rows.iter().map(|r| r[2].clone()).collect();
        assert_eq!(
            active,
            vec![RowValue::Integer(1), RowValue::Integer(0), RowValue::Integer(1)]
        );

        let columns = mirror.columns("sites").await.unwrap();
        assert_eq!(columns[2].declared_type.to_uppercase(), "INTEGER");
        assert!(store.last_checkpoint().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_one_table_failure_is_isolated() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        remote.put(
            "machines",
            &[("id", "bigint"), ("installed_at", "timestamp with time zone")],
            vec![json!([10, "2024-03-01T08:30:00+02:00"])],
        );
        let (store, engine) = engine(remote.clone()).await;

        // A first good run gives sites an old snapshot
        engine.sync_tables(&names(&["sites"])).await.unwrap();
        let first_checkpoint = store.last_checkpoint().await.unwrap();

        remote.fail("sites", "connection reset mid-fetch");
        let report = engine.sync_tables(&names(&["sites", "machines"])).await.unwrap();

        assert_eq!(report["machines"], TableOutcome::Success { rows: 1 });
        assert_eq!(report["sites"].status_str(), "error");
        assert!(report["sites"].error().unwrap().contains("connection reset"));

        // Old snapshot intact, checkpoint not advanced
        assert_eq!(store.mirror().row_count("sites").await.unwrap(), 3);
        assert_eq!(store.last_checkpoint().await.unwrap(), first_checkpoint);

        let machines = store.mirror().rows("machines", None).await.unwrap();
        assert_eq!(machines[0][1], RowValue::Text("2024-03-01 06:30:00".into()));

        let statuses = store.checkpoints().table_statuses().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(!statuses.iter().find(|s| s.table_name == "sites").unwrap().outcome.is_success());
    }

    #[tokio::test]
    async fn test_resync_replaces_rows() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put(
            "parts",
            &[("id", "serial"), ("price", "numeric(10,2)")],
            (1..=5).map(|i| json!({"id": i, "price": "9.50"})).collect(),
        );
        let (store, engine) = engine(remote.clone()).await;
        engine.sync_tables(&names(&["parts"])).await.unwrap();
        assert_eq!(store.mirror().row_count("parts").await.unwrap(), 5);

        remote.put("parts", &[("id", "serial"), ("price", "numeric(10,2)")], vec![json!([1, 1.25])]);
        let report = engine.sync_tables(&names(&["parts"])).await.unwrap();
        assert_eq!(report["parts"].rows_synced(), 1);

        let rows = store.mirror().rows("parts", None).await.unwrap();
        assert_eq!(rows, vec![vec![RowValue::Integer(1), RowValue::Real(1.25)]]);
    }

    #[tokio::test]
    async fn test_bad_row_keeps_previous_snapshot() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        let (store, engine) = engine(remote.clone()).await;
        engine.sync_tables(&names(&["sites"])).await.unwrap();

        remote.put("sites", &[("id", "integer"), ("name", "text")], vec![json!([1, "a", "extra"])]);
        let report = engine.sync_tables(&names(&["sites"])).await.unwrap();

        assert!(report["sites"].error().unwrap().starts_with("row 0"));
        assert_eq!(store.mirror().row_count("sites").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reserved_table_rejected_without_fetch() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        let (_store, engine) = engine(remote.clone()).await;

        let report = engine
            .sync_tables(&names(&["auth_tokens", "sites"]))
            .await
            .unwrap();
        assert!(!report["auth_tokens"].is_success());
        assert!(report["sites"].is_success());
        assert_eq!(remote.fetched(), vec!["sites".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_between_tables() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        // Cancellation requested while the first table is being fetched
        let remote = Arc::new(MemoryRemote::with_hook(move |_| trigger.cancel()));
        sites(&remote);
        remote.put("parts", &[("id", "integer")], vec![json!([1])]);
        let (store, engine) = engine(remote.clone()).await;

        let report = engine
            .sync_tables_with_cancel(&names(&["sites", "parts"]), &cancel)
            .await
            .unwrap();

        assert_eq!(report["sites"], TableOutcome::Success { rows: 3 });
        assert_eq!(
            report["parts"],
            TableOutcome::Error { message: CANCELLED_MESSAGE.into() }
        );
        assert_eq!(remote.fetched(), vec!["sites".to_string()]);
        assert!(store.last_checkpoint().await.unwrap().is_none());
        assert!(!store.mirror().table_exists("parts").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_names_synced_once() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        let (_store, engine) = engine(remote.clone()).await;

        let report = engine.sync_tables(&names(&["sites", "sites"])).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(remote.fetched().len(), 1);
    }

    #[tokio::test]
    async fn test_names_differing_in_case_synced_once() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        let (_store, engine) = engine(remote.clone()).await;

        let report = engine.sync_tables(&names(&["sites", "Sites", "SITES"])).await.unwrap();
        assert_eq!(report.len(), 1);
        assert!(report.contains_key("sites"));
        assert_eq!(remote.fetched(), vec!["sites".to_string()]);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let shared = flag.clone();
        assert!(!flag.is_cancelled());
        shared.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!shared.is_cancelled());
    }
}
