//! # Remote Source
//!
//! Where the sync engine reads authoritative tables from.
//!
//! ## Wire Format
//! ```text
//! GET  /sync/schema/{table}
//!      ◄── {"table": "sites", "columns": [{"name": "id", "data_type": "integer"}, ...]}
//!
//! POST /sync   {"table": "sites"}
//!      ◄── {"table": "sites", "rows": [{"id": 1, ...}, [2, ...], ...]}
//! ```
//!
//! A row is either an object keyed by column name or an array in schema
//! order.

use async_trait::async_trait;
use keystone_core::validation::validate_table_name;
use keystone_core::{HttpMethod, RemoteColumn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::transport::TransportClient;

pub const SYNC_PATH: &str = "/sync";
pub const SCHEMA_PATH: &str = "/sync/schema";

/// Column metadata and full row set of one remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTable {
    pub name: String,
    pub columns: Vec<RemoteColumn>,
    pub rows: Vec<Value>,
}

/// Source of authoritative table contents.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches column definitions and every row of `table`.
    async fn fetch_table(&self, table: &str) -> SyncResult<RemoteTable>;
}

#[derive(Debug, Deserialize)]
struct SchemaResponse {
    #[serde(default)]
    table: Option<String>,
    columns: Vec<RemoteColumn>,
}

#[derive(Debug, Deserialize)]
struct RowsResponse {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    rows: Vec<Value>,
}

/// [`RemoteSource`] over the sync HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpRemoteSource {
    client: TransportClient,
}

impl HttpRemoteSource {
    pub fn new(client: TransportClient) -> Self {
        HttpRemoteSource { client }
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_table(&self, table: &str) -> SyncResult<RemoteTable> {
        validate_table_name(table)?;

        let schema = self
            .client
            .request_with_retry(HttpMethod::Get, &format!("{SCHEMA_PATH}/{table}"), None)
            .await?;
        let schema: SchemaResponse = serde_json::from_value(schema.body)?;
        check_table(table, schema.table.as_deref())?;
        if schema.columns.is_empty() {
            return Err(SyncError::table(table, "remote reported no columns"));
        }

        let body = json!({ "table": table });
        let rows = self
            .client
            .request_with_retry(HttpMethod::Post, SYNC_PATH, Some(&body))
            .await?;
        let rows: RowsResponse = serde_json::from_value(rows.body)?;
        check_table(table, rows.table.as_deref())?;

        debug!(table = %table, columns = schema.columns.len(), rows = rows.rows.len(), "Fetched remote table");
        Ok(RemoteTable {
            name: table.to_string(),
            columns: schema.columns,
            rows: rows.rows,
        })
    }
}

fn check_table(requested: &str, reported: Option<&str>) -> SyncResult<()> {
    match reported {
        Some(name) if name != requested => Err(SyncError::table(
            requested,
            format!("server answered for table {name}"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session, spawn_server};
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn app() -> Router {
        Router::new()
            .route(
                "/sync/schema/{table}",
                get(|Path(table): Path<String>| async move {
                    match table.as_str() {
                        "sites" => (
                            StatusCode::OK,
                            Json(json!({
                                "table": "sites",
                                "columns": [
                                    {"name": "id", "data_type": "integer"},
                                    {"name": "active", "data_type": "boolean"}
                                ]
                            })),
                        ),
                        _ => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown table"}))),
                    }
                }),
            )
            .route(
                "/sync",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["table"], "sites");
                    Json(json!({
                        "table": "sites",
                        "rows": [{"id": 1, "active": true}, [2, false]]
                    }))
                }),
            )
    }

    #[tokio::test]
    async fn test_fetch_table_over_http() {
        let base = spawn_server(app()).await;
        let (_store, _tokens, client) = session(&base).await;
        let remote = HttpRemoteSource::new(client);

        let table = remote.fetch_table("sites").await.unwrap();
        assert_eq!(table.columns[1], RemoteColumn::new("active", "boolean"));
        assert_eq!(table.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_table_is_server_error() {
        let base = spawn_server(app()).await;
        let (_store, _tokens, client) = session(&base).await;
        let remote = HttpRemoteSource::new(client);

        let result = remote.fetch_table("machines").await;
        assert!(matches!(result, Err(SyncError::ServerError { status: 404, .. })));
    }

    #[test]
    fn test_check_table() {
        assert!(check_table("sites", None).is_ok());
        assert!(check_table("sites", Some("sites")).is_ok());
        assert!(matches!(
            check_table("sites", Some("parts")),
            Err(SyncError::TableSyncError { .. })
        ));
    }
}
