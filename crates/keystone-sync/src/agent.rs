//! # Sync Agent
//!
//! Background task that keeps the Local Store in step with the server.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │   SyncAgentHandle (cloneable)                                          │
//! │     request_sync() ──┐    cancel_sync()      shutdown()                │
//! │                      │         │                  │                     │
//! │                      ▼         ▼                  ▼                     │
//! │   ┌──────────────────────────────────────────────────────────────────┐ │
//! │   │  agent task:  select! { shutdown, interval tick, request }       │ │
//! │   │                                                                  │ │
//! │   │  cycle:                                                          │ │
//! │   │    1. OutboxProcessor::replay_pending()   (queued mutations up)  │ │
//! │   │    2. SyncEngine::sync_tables_with_cancel (tables down)          │ │
//! │   │    3. cleanup of old synced operations                           │ │
//! │   │    4. SyncStatus updated, events emitted                         │ │
//! │   └──────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  At most one cycle runs at a time. A request made while a cycle is     │
//! │  running is dropped and `request_sync()` returns false.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keystone_core::SyncReport;
use keystone_db::LocalStore;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::engine::{CancelFlag, SyncEngine};
use crate::outbox::{OutboxProcessor, ReplayReport};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the agent's state for external queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// A cycle is in progress.
    pub running: bool,

    /// Last advanced checkpoint.
    pub last_checkpoint: Option<DateTime<Utc>>,

    /// Per-table outcomes of the last cycle.
    pub last_outcomes: SyncReport,

    /// Result of the last outbox replay.
    pub last_replay: Option<ReplayReport>,

    /// First error of the last cycle, cleared by a clean cycle.
    pub last_error: Option<String>,

    /// Operations still waiting in the queue.
    pub pending_count: i64,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives status changes, e.g. to forward them to a UI.
pub trait SyncEventEmitter: Send + Sync {
    /// Emitted when a cycle starts and when it ends.
    fn emit_status(&self, status: &SyncStatus);

    /// Emitted after each cycle.
    fn emit_progress(&self, pending: i64, tables_synced: usize);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// Discards every event.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: i64, _tables_synced: usize) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Agent Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SyncAgentConfig {
    /// Tables mirrored on every cycle, in order.
    pub tables: Vec<String>,

    /// Time between scheduled cycles.
    pub interval: Duration,

    /// Synced operations older than this are deleted. Zero keeps them.
    pub cleanup_after_days: u32,
}

impl SyncAgentConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        SyncAgentConfig {
            tables: config.tables().to_vec(),
            interval: config.sync_interval(),
            cleanup_after_days: config.sync.cleanup_after_days,
        }
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Runs sync cycles on a schedule and on demand.
pub struct SyncAgent {
    store: LocalStore,
    engine: SyncEngine,
    outbox: Option<Arc<OutboxProcessor>>,
    config: SyncAgentConfig,
    status: Arc<RwLock<SyncStatus>>,
    emitter: Arc<dyn SyncEventEmitter>,
    running: Arc<AtomicBool>,
    cancel: CancelFlag,
}

impl SyncAgent {
    pub fn new(store: LocalStore, engine: SyncEngine, config: SyncAgentConfig) -> Self {
        SyncAgent {
            store,
            engine,
            outbox: None,
            config,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            emitter: Arc::new(NoOpEmitter),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancelFlag::new(),
        }
    }

    /// Replays queued operations at the start of every cycle.
    pub fn with_outbox(mut self, outbox: Arc<OutboxProcessor>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Runs one cycle on the caller's task and returns the resulting status.
    pub async fn run_once(&self) -> SyncStatus {
        self.run_cycle().await;
        self.status().await
    }

    /// Moves the agent onto its own task. The first cycle starts immediately.
    pub fn spawn(self) -> SyncAgentHandle {
        let (request_tx, request_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let status = self.status.clone();
        let running = self.running.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run(request_rx, shutdown_rx));

        SyncAgentHandle {
            request_tx,
            shutdown_tx,
            status,
            running,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(self, mut request_rx: mpsc::Receiver<()>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            tables = self.config.tables.len(),
            interval_secs = self.config.interval.as_secs(),
            "Sync agent started"
        );

        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Sync agent shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    debug!("Scheduled sync");
                    self.run_cycle().await;
                }

                Some(()) = request_rx.recv() => {
                    debug!("Requested sync");
                    self.run_cycle().await;
                }
            }
        }

        info!("Sync agent stopped");
    }

    async fn run_cycle(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Sync already running, skipping cycle");
            return;
        }
        self.cancel.reset();
        self.update_status(|s| s.running = true).await;

        let mut errors: Vec<String> = Vec::new();
        let mut replay = None;

        if let Some(outbox) = &self.outbox {
            match outbox.replay_pending().await {
                Ok(report) => {
                    if report.auth_required {
                        errors.push("outbox replay stopped: login required".to_string());
                    }
                    replay = Some(report);
                }
                Err(e) => {
                    error!(error = %e, "Outbox replay failed");
                    self.emitter.emit_error(&e.to_string(), e.is_retryable());
                    errors.push(e.to_string());
                }
            }
        }

        let outcomes = match self
            .engine
            .sync_tables_with_cancel(&self.config.tables, &self.cancel)
            .await
        {
            Ok(report) => {
                for (table, outcome) in &report {
                    if let Some(message) = outcome.error() {
                        errors.push(format!("{table}: {message}"));
                    }
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "Table sync aborted");
                self.emitter.emit_error(&e.to_string(), e.is_retryable());
                errors.push(e.to_string());
                None
            }
        };

        if self.config.cleanup_after_days > 0 {
            match self
                .store
                .pending()
                .cleanup_synced(self.config.cleanup_after_days)
                .await
            {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Removed old synced operations"),
                Err(e) => warn!(error = %e, "Cleanup of synced operations failed"),
            }
        }

        let pending_count = match self.store.pending().pending_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Could not count pending operations");
                None
            }
        };
        let last_checkpoint = match self.store.last_checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(error = %e, "Could not read checkpoint");
                None
            }
        };

        let tables_synced = outcomes
            .as_ref()
            .map(|r| r.values().filter(|o| o.is_success()).count())
            .unwrap_or(0);

        let status = self
            .update_status(|s| {
                s.running = false;
                if let Some(report) = outcomes {
                    s.last_outcomes = report;
                }
                if replay.is_some() {
                    s.last_replay = replay;
                }
                if let Some(count) = pending_count {
                    s.pending_count = count;
                }
                if last_checkpoint.is_some() {
                    s.last_checkpoint = last_checkpoint;
                }
                s.last_error = errors.into_iter().next();
            })
            .await;
        self.emitter.emit_progress(status.pending_count, tables_synced);

        match &status.last_error {
            None => info!(pending = status.pending_count, tables_synced, "Sync cycle complete"),
            Some(e) => warn!(pending = status.pending_count, tables_synced, error = %e, "Sync cycle completed with errors"),
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) -> SyncStatus {
        let snapshot = {
            let mut status = self.status.write().await;
            f(&mut status);
            status.clone()
        };
        self.emitter.emit_status(&snapshot);
        snapshot
    }
}

// =============================================================================
// Agent Handle
// =============================================================================

/// Handle for controlling a spawned [`SyncAgent`].
#[derive(Clone)]
pub struct SyncAgentHandle {
    request_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    status: Arc<RwLock<SyncStatus>>,
    running: Arc<AtomicBool>,
    cancel: CancelFlag,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncAgentHandle {
    /// Asks for a cycle now. Returns false if one is already running or
    /// already requested, or the agent has stopped.
    pub fn request_sync(&self) -> bool {
        if self.running.load(Ordering::SeqCst) {
            debug!("Sync already running, request ignored");
            return false;
        }
        match self.request_tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Closed(())) => {
                warn!("Sync agent is not running");
                false
            }
        }
    }

    /// Stops the running cycle before its next table.
    pub fn cancel_sync(&self) {
        if self.running.load(Ordering::SeqCst) {
            info!("Cancelling sync");
            self.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Stops the agent once the table in progress is done and waits for
    /// the task to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.shutdown_tx.send(()).await;

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Sync agent task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRemote;
    use keystone_core::TableOutcome;
    use keystone_db::DbConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingEmitter {
        statuses: AtomicUsize,
        progress: AtomicUsize,
    }

    impl SyncEventEmitter for CountingEmitter {
        fn emit_status(&self, _status: &SyncStatus) {
            self.statuses.fetch_add(1, Ordering::SeqCst);
        }
        fn emit_progress(&self, _pending: i64, _tables_synced: usize) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }
        fn emit_error(&self, _message: &str, _retryable: bool) {}
    }

    fn config(tables: &[&str]) -> SyncAgentConfig {
        SyncAgentConfig {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            interval: Duration::from_secs(3600),
            cleanup_after_days: 30,
        }
    }

    fn sites(remote: &MemoryRemote) {
        remote.put(
            "sites",
            &[("id", "integer"), ("name", "text")],
            vec![json!({"id": 1, "name": "North"})],
        );
    }

    async fn agent(remote: Arc<MemoryRemote>, tables: &[&str]) -> (LocalStore, SyncAgent) {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngine::new(store.clone(), remote);
        (store.clone(), SyncAgent::new(store, engine, config(tables)))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_run_once_updates_status() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        let (_store, agent) = agent(remote, &["sites"]).await;
        let emitter = Arc::new(CountingEmitter::default());
        let agent = agent.with_emitter(emitter.clone());

        let status = agent.run_once().await;
        assert!(!status.running);
        assert_eq!(status.last_outcomes["sites"], TableOutcome::Success { rows: 1 });
        assert!(status.last_checkpoint.is_some());
        assert!(status.last_error.is_none());
        assert_eq!(emitter.statuses.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.progress.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_table_reported_in_status() {
        let remote = Arc::new(MemoryRemote::new());
        sites(&remote);
        remote.fail("parts", "connection reset");
        let (_store, agent) = agent(remote.clone(), &["sites", "parts"]).await;

        let status = agent.run_once().await;
        assert!(status.last_outcomes["sites"].is_success());
        assert!(status.last_error.unwrap().starts_with("parts:"));
        assert!(status.last_checkpoint.is_none());

        remote.heal("parts");
        remote.put("parts", &[("id", "integer")], vec![json!({"id": 9})]);
        let status = agent.run_once().await;
        assert!(status.last_error.is_none());
        assert!(status.last_checkpoint.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_requests_coalesce_while_running() {
        let remote = Arc::new(MemoryRemote::with_hook(|_| {
            std::thread::sleep(Duration::from_millis(300));
        }));
        sites(&remote);
        let (_store, agent) = agent(remote.clone(), &["sites"]).await;
        let handle = agent.spawn();

        // The first tick starts a cycle right away
        wait_until(|| handle.is_running()).await;
        assert!(!handle.request_sync());

        wait_until(|| !handle.is_running()).await;
        assert!(handle.request_sync());
        wait_until(|| remote.fetched().len() == 2).await;

        handle.shutdown().await;
        assert!(!handle.request_sync());
        assert_eq!(handle.status().await.last_outcomes["sites"], TableOutcome::Success { rows: 1 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_skips_remaining_tables() {
        let fetching = Arc::new(AtomicBool::new(false));
        let flag = fetching.clone();
        let remote = Arc::new(MemoryRemote::with_hook(move |_| {
            flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
        }));
        sites(&remote);
        remote.put("parts", &[("id", "integer")], vec![json!({"id": 1})]);
        let (_store, agent) = agent(remote.clone(), &["sites", "parts"]).await;
        let handle = agent.spawn();

        // Cancel while "sites" is being fetched
        wait_until(|| fetching.load(Ordering::SeqCst)).await;
        handle.cancel_sync();
        wait_until(|| !handle.is_running()).await;

        let status = handle.status().await;
        assert!(status.last_outcomes["sites"].is_success());
        assert_eq!(status.last_outcomes["parts"].error(), Some("cancelled"));
        assert!(status.last_checkpoint.is_none());
        handle.shutdown().await;
    }
}
