//! # Sync Configuration
//!
//! Configuration for the local store, tokens, remote endpoint and sync loop.
//!
//! ## Configuration Priority
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Configuration Loading Order                         │
//! │                                                                         │
//! │  1. Default values (hardcoded)                                         │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  2. Config file (keystone.toml)                                        │
//! │     • Explicit --config path, or                                       │
//! │     • Platform config dir:                                             │
//! │       - Linux: ~/.config/keystone/keystone.toml                        │
//! │       - macOS: ~/Library/Application Support/io.Keystone.keystone/     │
//! │       - Windows: %APPDATA%\Keystone\keystone\config\                   │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  3. Environment variables (override file values)                       │
//! │     • KEYSTONE_DB_PATH, KEYSTONE_ENCRYPT, KEYSTONE_ENCRYPTION_KEY      │
//! │     • KEYSTONE_SECRET_KEY, KEYSTONE_TOKEN_TTL_DAYS, KEYSTONE_USER_ID   │
//! │     • KEYSTONE_REMOTE_URL                                              │
//! │     • KEYSTONE_SYNC_TABLES, KEYSTONE_SYNC_INTERVAL_SECS                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use keystone_core::validation::validate_table_set;
use keystone_db::DbConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Store Settings
// =============================================================================

/// Local store settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database file location.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Encrypt payload and token columns.
    #[serde(default)]
    pub encrypt_at_rest: bool,

    /// Passphrase for encryption at rest. Required when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Last-sync marker file. Defaults to the database path with a
    /// `.last_sync` extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_marker: Option<PathBuf>,
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("io", "Keystone", "keystone")
        .map(|dirs| dirs.data_dir().join("keystone.db"))
        .unwrap_or_else(|| PathBuf::from("keystone.db"))
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            db_path: default_db_path(),
            encrypt_at_rest: false,
            encryption_key: None,
            max_connections: default_max_connections(),
            checkpoint_marker: None,
        }
    }
}

impl fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSettings")
            .field("db_path", &self.db_path)
            .field("encrypt_at_rest", &self.encrypt_at_rest)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("checkpoint_marker", &self.checkpoint_marker)
            .finish()
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Token signing and session settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret used to sign tokens. Must not be empty.
    #[serde(default)]
    pub secret_key: String,

    /// Token lifetime in days. Zero issues tokens that are already expired.
    #[serde(default = "default_token_ttl_days")]
    pub token_ttl_days: u32,

    /// User whose persisted token the background agent uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

fn default_token_ttl_days() -> u32 {
    7
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            secret_key: String::new(),
            token_ttl_days: default_token_ttl_days(),
            user_id: None,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("secret_key", &"<redacted>")
            .field("token_ttl_days", &self.token_ttl_days)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl AuthSettings {
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.token_ttl_days))
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Remote HTTP endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the server, e.g. `https://maint.example.com`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Connectivity probe timeout (seconds).
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_probe_timeout() -> u64 {
    3
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl RemoteSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Entity tables mirrored from the server.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Interval between background sync cycles (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Synced operations older than this are deleted by cleanup (days).
    #[serde(default = "default_cleanup_days")]
    pub cleanup_after_days: u32,
}

fn default_interval() -> u64 {
    300
}
fn default_cleanup_days() -> u32 {
    30
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            tables: Vec::new(),
            interval_secs: default_interval(),
            cleanup_after_days: default_cleanup_days(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Shared retry schedule for transport, table fetches and queue replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts, including the first. Also the number of failed
    /// deliveries after which a queued operation is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Growth factor between delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete configuration.
///
/// ## Example Config File
/// ```toml
/// [store]
/// db_path = "/var/lib/keystone/keystone.db"
/// encrypt_at_rest = true
/// encryption_key = "correct horse battery staple"
///
/// [auth]
/// secret_key = "change-me"
/// token_ttl_days = 7
/// user_id = "tech-01"
///
/// [remote]
/// base_url = "https://maint.example.com"
/// request_timeout_secs = 30
///
/// [sync]
/// tables = ["sites", "machines", "parts"]
/// interval_secs = 300
///
/// [retry]
/// max_attempts = 5
/// initial_backoff_ms = 500
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (keystone.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.auth.secret_key.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "auth.secret_key must not be empty".into(),
            ));
        }

        if self.store.encrypt_at_rest
            && self
                .store
                .encryption_key
                .as_deref()
                .map_or(true, |k| k.is_empty())
        {
            return Err(SyncError::InvalidConfig(
                "store.encryption_key is required when encrypt_at_rest is on".into(),
            ));
        }

        let url = url::Url::parse(&self.remote.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "Remote URL must start with http:// or https://, got: {}",
                self.remote.base_url
            )));
        }

        validate_table_set(&self.sync.tables)
            .map_err(|e| SyncError::InvalidConfig(format!("sync.tables: {e}")))?;

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }

        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "remote.request_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `KEYSTONE_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("KEYSTONE_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.store.db_path = PathBuf::from(path);
        }

        if let Some(flag) = var("KEYSTONE_ENCRYPT") {
            self.store.encrypt_at_rest = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        if let Some(key) = var("KEYSTONE_ENCRYPTION_KEY") {
            self.store.encryption_key = Some(key);
        }

        if let Some(secret) = var("KEYSTONE_SECRET_KEY") {
            self.auth.secret_key = secret;
        }

        if let Some(ttl) = var("KEYSTONE_TOKEN_TTL_DAYS") {
            match ttl.trim().parse::<u32>() {
                Ok(days) => self.auth.token_ttl_days = days,
                Err(_) => warn!(value = %ttl, "Ignoring invalid KEYSTONE_TOKEN_TTL_DAYS"),
            }
        }

        if let Some(user) = var("KEYSTONE_USER_ID") {
            self.auth.user_id = Some(user);
        }

        if let Some(url) = var("KEYSTONE_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.remote.base_url = url;
        }

        if let Some(tables) = var("KEYSTONE_SYNC_TABLES") {
            self.sync.tables = tables
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(secs) = var("KEYSTONE_SYNC_INTERVAL_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(s) => self.sync.interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid KEYSTONE_SYNC_INTERVAL_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "Keystone", "keystone")
            .map(|dirs| dirs.config_dir().join("keystone.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Local store configuration derived from `[store]`.
    pub fn db_config(&self) -> DbConfig {
        let mut db = DbConfig::new(&self.store.db_path).max_connections(self.store.max_connections);
        if self.store.encrypt_at_rest {
            if let Some(key) = &self.store.encryption_key {
                db = db.encryption_key(key.clone());
            }
        }
        if self.store.checkpoint_marker.is_some() {
            db = db.checkpoint_marker(self.store.checkpoint_marker.clone());
        }
        db
    }

    pub fn tables(&self) -> &[String] {
        &self.sync.tables
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs.max(1))
    }
}
