//! Shared fixtures for the in-crate tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Duration as ChronoDuration;
use keystone_core::RemoteColumn;
use keystone_db::{DbConfig, LocalStore};
use serde_json::{Map, Value};

use crate::auth::TokenManager;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteSource, RemoteTable};
use crate::retry::RetryPolicy;
use crate::transport::{TransportClient, TransportConfig};

pub(crate) const TEST_USER: &str = "u-1";

/// Serves `app` on an ephemeral localhost port. Returns the base URL.
pub(crate) async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A localhost address nothing is listening on.
pub(crate) async fn unused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub(crate) fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

/// In-memory store, token manager with a live token for [`TEST_USER`], and a
/// client pointed at `base_url`.
pub(crate) async fn session(base_url: &str) -> (LocalStore, Arc<TokenManager>, TransportClient) {
    let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        "test-secret",
        ChronoDuration::hours(1),
    ));
    tokens.issue(TEST_USER, "alice", Map::new()).await.unwrap();

    let config = TransportConfig {
        base_url: base_url.to_string(),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_secs(1),
    };
    let client = TransportClient::new(config, tokens.clone(), TEST_USER, fast_retry(1)).unwrap();
    (store, tokens, client)
}

/// In-memory [`RemoteSource`] with failure
/// injection.
#[derive(Default)]
pub(crate) struct MemoryRemote {
    tables: Mutex<HashMap<String, RemoteTable>>,
    failures: Mutex<HashMap<String, String>>,
    fetched: Mutex<Vec<String>>,
    on_fetch: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl MemoryRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Calls `hook` with the table name at the start of every fetch.
    pub(crate) fn with_hook(hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        MemoryRemote {
            on_fetch: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    pub(crate) fn put(&self, name: &str, columns: &[(&str, &str)], rows: Vec<Value>) {
        let table = RemoteTable {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, t)| RemoteColumn::new(*n, *t))
                .collect(),
            rows,
        };
        self.tables.lock().unwrap().insert(name.to_string(), table);
    }

    /// Makes every fetch of `name` fail with a network error.
    pub(crate) fn fail(&self, name: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), message.to_string());
    }

    pub(crate) fn heal(&self, name: &str) {
        self.failures.lock().unwrap().remove(name);
    }

    pub(crate) fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn fetch_table(&self, table: &str) -> SyncResult<RemoteTable> {
        if let Some(hook) = &self.on_fetch {
            hook(table);
        }
        self.fetched.lock().unwrap().push(table.to_string());

        if let Some(message) = self.failures.lock().unwrap().get(table) {
            return Err(SyncError::NetworkError(message.clone()));
        }
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| SyncError::ServerError {
                status: 404,
                message: format!("unknown table {table}"),
            })
    }
}
