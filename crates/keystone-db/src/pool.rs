//! # Local Store
//!
//! Connection pool creation and the [`LocalStore`] handle.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Local Store                                     │
//! │                                                                         │
//! │  App Startup                                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbConfig::new(path) ← Configure pool, encryption key                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  LocalStore::open(config).await                                        │
//! │       │  1. create pool (fails fast: StorageUnavailable)               │
//! │       │  2. probe sqlite_master (corrupt file: StorageUnavailable)     │
//! │       │  3. reconcile built-in schema                                  │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────┐                           │
//! │  │            SqlitePool (shared)          │                           │
//! │  │  foreground enqueue ─┐  ┌─ background   │                           │
//! │  │                      ▼  ▼    sync engine│                           │
//! │  │  ┌─────┐ ┌─────┐ ┌─────┐ ┌─────┐        │                           │
//! │  │  │Conn1│ │Conn2│ │Conn3│ │Conn4│ ...    │                           │
//! │  │  └─────┘ └─────┘ └─────┘ └─────┘        │                           │
//! │  └─────────────────────────────────────────┘                           │
//! │                                                                         │
//! │  queue_lock: the one mutex, held by pending-queue writes               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability
//! WAL journal with `synchronous = FULL`: once a write call returns, the
//! row survives a crash. There is no in-memory fallback when the file cannot
//! be opened.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keystone_core::{AuthToken, CachedResponse, HttpMethod, PendingOperation};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::crypto::PayloadCipher;
use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::cache::CacheRepository;
use crate::repository::checkpoint::CheckpointRepository;
use crate::repository::credential::CredentialRepository;
use crate::repository::mirror::MirrorRepository;
use crate::repository::pending::PendingRepository;
use crate::repository::token::TokenRepository;
use crate::schema_migrator::SchemaMigrator;

const MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Local Store configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/keystone/keystone.db")
///     .encryption_key("passphrase")
///     .max_connections(5);
/// ```
#[derive(Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 5
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection acquire timeout.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    /// Default: 10 minutes
    pub idle_timeout: Option<Duration>,

    /// How long a writer waits on SQLite's lock.
    /// Default: 5 seconds
    pub busy_timeout: Duration,

    /// Passphrase for encryption at rest. `None` stores plaintext.
    pub encryption_key: Option<String>,

    /// Plain-text marker file rewritten after each successful sync.
    /// Default: `<database>.last_sync` next to the database file.
    pub checkpoint_marker: Option<PathBuf>,

    /// Whether to reconcile the built-in schema on open.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a configuration for a database file. The file is created if
    /// missing; its parent directory too.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let database_path = path.into();
        let checkpoint_marker = Some(database_path.with_extension("last_sync"));

        DbConfig {
            database_path,
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            busy_timeout: Duration::from_secs(5),
            encryption_key: None,
            checkpoint_marker,
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection acquire timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables encryption at rest with the given passphrase.
    pub fn encryption_key(mut self, passphrase: impl Into<String>) -> Self {
        self.encryption_key = Some(passphrase.into());
        self
    }

    /// Overrides the checkpoint marker location.
    pub fn checkpoint_marker(mut self, path: Option<PathBuf>) -> Self {
        self.checkpoint_marker = path;
        self
    }

    /// Sets whether to reconcile the built-in schema on open.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory configuration (for testing).
    ///
    /// A single connection that is never reaped; closing it would drop the
    /// database.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(MEMORY_PATH),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
            busy_timeout: Duration::from_secs(5),
            encryption_key: None,
            checkpoint_marker: None,
            run_migrations: true,
        }
    }

    fn is_memory(&self) -> bool {
        self.database_path == Path::new(MEMORY_PATH)
    }
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("database_path", &self.database_path)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("encrypted", &self.encryption_key.is_some())
            .field("checkpoint_marker", &self.checkpoint_marker)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

// =============================================================================
// Local Store
// =============================================================================

/// Handle to the Local Store.
///
/// Cheap to clone. Every clone shares the pool, cipher and queue mutex.
/// Repositories are handed out per call (`store.pending()`, `store.cache()`).
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    cipher: PayloadCipher,
    queue_lock: Arc<Mutex<()>>,
    checkpoint_marker: Option<PathBuf>,
}

impl LocalStore {
    /// Opens (or creates) the store.
    ///
    /// ## Returns
    /// * `Ok(LocalStore)` - Ready-to-use store, schema reconciled
    /// * `Err(DbError::StorageUnavailable)` - File corrupt, unreadable, or
    ///   its directory cannot be created
    pub async fn open(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            encrypted = config.encryption_key.is_some(),
            "Opening local store"
        );

        let connect_options = if config.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::StorageUnavailable(e.to_string()))?
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        DbError::StorageUnavailable(format!(
                            "cannot create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
            }
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true)
        };

        let connect_options = connect_options
            // Readers keep seeing the last committed snapshot while a writer works
            .journal_mode(SqliteJournalMode::Wal)
            // Commit is on disk before the call returns
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(if config.is_memory() { None } else { Some(Duration::from_secs(1800)) })
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                error!(error = %e, "Local store could not be opened");
                DbError::StorageUnavailable(e.to_string())
            })?;

        // A garbage file can survive connection setup; the first real read
        // cannot.
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sqlite_master")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Local store failed its integrity probe");
                DbError::StorageUnavailable(e.to_string())
            })?;

        info!(max_connections = config.max_connections, "Local store pool created");

        let cipher = match &config.encryption_key {
            Some(key) => PayloadCipher::from_passphrase(key),
            None => PayloadCipher::disabled(),
        };

        let store = LocalStore {
            pool,
            cipher,
            queue_lock: Arc::new(Mutex::new(())),
            checkpoint_marker: config.checkpoint_marker.clone(),
        };

        if config.run_migrations {
            store.run_migrations().await?;
        }

        Ok(store)
    }

    /// Reconciles the built-in schema. Returns the number of DDL statements
    /// applied.
    pub async fn run_migrations(&self) -> DbResult<usize> {
        migrations::run_migrations(&self.pool).await
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns true when sensitive columns are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_enabled()
    }

    // -------------------------------------------------------------------------
    // Repositories
    // -------------------------------------------------------------------------

    /// Pending operation queue.
    pub fn pending(&self) -> PendingRepository {
        PendingRepository::new(self.pool.clone(), self.cipher.clone(), self.queue_lock.clone())
    }

    /// Response cache.
    pub fn cache(&self) -> CacheRepository {
        CacheRepository::new(self.pool.clone(), self.cipher.clone())
    }

    /// Persisted auth tokens.
    pub fn tokens(&self) -> TokenRepository {
        TokenRepository::new(self.pool.clone(), self.cipher.clone())
    }

    /// Offline login credentials.
    pub fn credentials(&self) -> CredentialRepository {
        CredentialRepository::new(self.pool.clone())
    }

    /// Mirrored server tables.
    pub fn mirror(&self) -> MirrorRepository {
        MirrorRepository::new(self.pool.clone())
    }

    /// Sync checkpoint and per-table status.
    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone(), self.checkpoint_marker.clone())
    }

    /// Schema migrator over this store.
    pub fn migrator(&self) -> SchemaMigrator {
        SchemaMigrator::new(self.pool.clone())
    }

    // -------------------------------------------------------------------------
    // Store contract
    // -------------------------------------------------------------------------

    /// Durably queues a mutation. Returns the operation id once the row is
    /// committed.
    pub async fn enqueue(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<&serde_json::Value>,
    ) -> DbResult<String> {
        self.pending().enqueue(method, endpoint, payload).await
    }

    /// Pending operations in enqueue order.
    pub async fn pending_operations(&self) -> DbResult<Vec<PendingOperation>> {
        self.pending().pending_operations().await
    }

    pub async fn mark_synced(&self, id: &str) -> DbResult<()> {
        self.pending().mark_synced(id).await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> DbResult<()> {
        self.pending().mark_failed(id, error).await
    }

    /// Moves a failed operation back to pending.
    pub async fn retry(&self, id: &str) -> DbResult<bool> {
        self.pending().retry(id).await
    }

    pub async fn cache_response(&self, endpoint: &str, payload: &serde_json::Value) -> DbResult<()> {
        self.cache().put(endpoint, payload).await
    }

    pub async fn cached_response(&self, endpoint: &str) -> DbResult<Option<CachedResponse>> {
        self.cache().get(endpoint).await
    }

    /// Drops the cached response for `endpoint`. Returns whether one existed.
    pub async fn invalidate_cached(&self, endpoint: &str) -> DbResult<bool> {
        self.cache().invalidate(endpoint).await
    }

    pub async fn clear_cache(&self) -> DbResult<u64> {
        self.cache().clear().await
    }

    pub async fn store_token(&self, token: &AuthToken) -> DbResult<()> {
        self.tokens().store(token).await
    }

    pub async fn load_token(&self, user_id: &str) -> DbResult<Option<AuthToken>> {
        self.tokens().load(user_id).await
    }

    pub async fn delete_token(&self, user_id: &str) -> DbResult<bool> {
        self.tokens().delete(user_id).await
    }

    /// Last fully successful sync.
    pub async fn last_checkpoint(&self) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self.checkpoints().load().await?.map(|c| c.timestamp))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Closes the pool. Every write that returned Ok is already on disk.
    pub async fn close(&self) {
        info!("Closing local store");
        self.pool.close().await;
    }

    /// Checks if the store can execute queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Fresh database path under the system temp dir.
#[cfg(test)]
pub(crate) fn temp_db_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("keystone-test-{}", uuid::Uuid::new_v4()))
        .join("keystone.db")
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        assert!(store.health_check().await);
        assert!(!store.is_encrypted());
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = DbConfig::new("/tmp/keystone/app.db")
            .max_connections(10)
            .min_connections(2)
            .encryption_key("k");

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(
            config.checkpoint_marker,
            Some(PathBuf::from("/tmp/keystone/app.last_sync"))
        );
        assert!(!format!("{config:?}").contains("\"k\""));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_unavailable() {
        let path = temp_db_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"this is definitely not a sqlite database, just text padding it out")
            .unwrap();

        let err = LocalStore::open(DbConfig::new(&path)).await.unwrap_err();
        assert!(matches!(err, DbError::StorageUnavailable(_)), "{err:?}");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_pending_survives_restart_in_order() {
        let path = temp_db_path();

        let ids = {
            let store = LocalStore::open(DbConfig::new(&path)).await.unwrap();
            let mut ids = Vec::new();
            for n in 0..5 {
                let id = store
                    .enqueue(HttpMethod::Post, "/api/parts", Some(&json!({ "n": n })))
                    .await
                    .unwrap();
                ids.push(id);
            }
            store.mark_synced(&ids[1]).await.unwrap();
            // Simulated crash: drop without close.
            ids
        };

        let store = LocalStore::open(DbConfig::new(&path)).await.unwrap();
        let pending: Vec<String> = store
            .pending_operations()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();

        assert_eq!(pending, vec![ids[0].clone(), ids[2].clone(), ids[3].clone(), ids[4].clone()]);
    }

    #[tokio::test]
    async fn test_reopen_applies_no_migrations() {
        let path = temp_db_path();
        LocalStore::open(DbConfig::new(&path)).await.unwrap().close().await;

        let store = LocalStore::open(DbConfig::new(&path).run_migrations(false)).await.unwrap();
        assert_eq!(store.run_migrations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_store_writes_no_plaintext() {
        let path = temp_db_path();
        let store = LocalStore::open(DbConfig::new(&path).encryption_key("s3cret"))
            .await
            .unwrap();

        store
            .enqueue(HttpMethod::Put, "/api/machines/7", Some(&json!({"serial": "SN-PLAINTEXT"})))
            .await
            .unwrap();
        store
            .cache_response("/api/machines/7", &json!({"serial": "SN-PLAINTEXT"}))
            .await
            .unwrap();

        let raw: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM pending_operations UNION ALL SELECT payload FROM response_cache",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().all(|p| !p.contains("SN-PLAINTEXT")));

        let ops = store.pending_operations().await.unwrap();
        assert_eq!(ops[0].payload, Some(json!({"serial": "SN-PLAINTEXT"})));
        store.close().await;

        // Without the key the payload cannot be read back.
        let store = LocalStore::open(DbConfig::new(&path)).await.unwrap();
        let err = store.pending_operations().await.unwrap_err();
        assert!(matches!(err, DbError::Encryption(_)));
    }
}
