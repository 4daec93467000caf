//! # Keystone Agent
//!
//! Headless launcher for the sync core.
//!
//! ## Usage
//! ```bash
//! # Sync on the configured interval until Ctrl-C / SIGTERM
//! keystone-agent run
//!
//! # One cycle: replay queued operations, then mirror every table
//! keystone-agent sync-once --config ./keystone.toml
//!
//! # Queue size, checkpoint and per-table results as JSON
//! keystone-agent status
//! ```
//!
//! ## Log Levels
//! - `RUST_LOG=debug` - Show debug messages
//! - `RUST_LOG=keystone_sync=trace` - Trace the sync crate only
//! - Default: `info,keystone=debug,sqlx=warn`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use keystone_db::{DbError, LocalStore};
use keystone_sync::{
    HttpRemoteSource, OutboxProcessor, RetryPolicy, SyncAgent, SyncAgentConfig, SyncConfig,
    SyncEngine, TokenManager, TransportClient, TransportConfig,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: keystone-agent [run|sync-once|status] [--config PATH]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    SyncOnce,
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let (command, config_path) = match parse_args(std::env::args().skip(1)) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    match execute(command, config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "keystone-agent failed");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keystone=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<(Command, Option<PathBuf>), String> {
    let args: Vec<String> = args.collect();
    let mut command = Command::Run;
    let mut config_path = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "run" => command = Command::Run,
            "sync-once" => command = Command::SyncOnce,
            "status" => command = Command::Status,
            "--config" | "-c" => {
                let path = args.get(i + 1).ok_or("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    Ok((command, config_path))
}

async fn execute(
    command: Command,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::load(config_path)?;

    let store = match LocalStore::open(config.db_config().run_migrations(false)).await {
        Ok(store) => store,
        Err(DbError::StorageUnavailable(reason)) => {
            error!(path = %config.store.db_path.display(), reason = %reason, "Local store unavailable");
            return Err(format!("local store unavailable: {reason}").into());
        }
        Err(e) => return Err(e.into()),
    };
    let applied = store.run_migrations().await?;
    info!(
        path = %config.store.db_path.display(),
        encrypted = store.is_encrypted(),
        applied,
        "Local store ready"
    );

    let result = match command {
        Command::Status => print_status(&store).await,
        Command::SyncOnce | Command::Run => sync(command, &config, &store).await,
    };

    store.close().await;
    result
}

async fn sync(
    command: Command,
    config: &SyncConfig,
    store: &LocalStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let user_id = config
        .auth
        .user_id
        .clone()
        .ok_or("auth.user_id (or KEYSTONE_USER_ID) is required to sync")?;

    let tokens = Arc::new(TokenManager::from_settings(store.clone(), &config.auth));
    if let Err(e) = tokens.current_token(&user_id).await {
        warn!(user_id = %user_id, error = %e, "No usable session, server calls will fail until login");
    }

    let client = TransportClient::new(
        TransportConfig::from_settings(&config.remote),
        tokens,
        user_id,
        RetryPolicy::from_settings(&config.retry),
    )?;
    let engine = SyncEngine::new(
        store.clone(),
        Arc::new(HttpRemoteSource::new(client.clone())),
    );
    let outbox = Arc::new(OutboxProcessor::new(store.clone(), client));
    let agent = SyncAgent::new(store.clone(), engine, SyncAgentConfig::from_config(config))
        .with_outbox(outbox);

    if command == Command::SyncOnce {
        let status = agent.run_once().await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        return match status.last_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        };
    }

    let handle = agent.spawn();
    shutdown_signal().await;
    info!("Shutdown requested");
    handle.shutdown().await;
    Ok(())
}

async fn print_status(store: &LocalStore) -> Result<(), Box<dyn std::error::Error>> {
    let pending = store.pending().pending_count().await?;
    let checkpoint = store.last_checkpoint().await?;
    let tables = store.checkpoints().table_statuses().await?;

    let status = json!({
        "pending_count": pending,
        "last_checkpoint": checkpoint,
        "tables": tables,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
