//! # Outbox Processor
//!
//! Replays queued mutations to the server in enqueue order.
//!
//! ## Replay Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Outbox Replay Pass                               │
//! │                                                                         │
//! │  replay lock held (one pass at a time)                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  probe() ── false ──► return (nothing attempted)                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  for op in pending (ORDER BY seq):                                     │
//! │     send op.method op.endpoint op.payload                              │
//! │       ├── 2xx ─────────────► mark_synced, next                         │
//! │       ├── 4xx rejection ───► mark_failed, next                         │
//! │       ├── transient ───────► record_attempt                            │
//! │       │                      attempts >= max ─► mark_failed            │
//! │       │                      stop the pass                             │
//! │       └── auth failure ────► stop the pass (re-login needed)           │
//! │                                                                         │
//! │  Stopping on a transient failure keeps later operations behind         │
//! │  earlier ones.                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use keystone_db::LocalStore;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::transport::TransportClient;

/// Result of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Operations confirmed by the server.
    pub delivered: u32,
    /// Operations moved to `failed` during this pass.
    pub failed: u32,
    /// Operations still pending afterwards.
    pub remaining: i64,
    /// The server was unreachable, nothing was attempted.
    pub offline: bool,
    /// The pass stopped on an authorization failure.
    pub auth_required: bool,
}

/// Replays the pending operation queue.
pub struct OutboxProcessor {
    store: LocalStore,
    client: TransportClient,
    /// Delivery attempts after which an operation is marked failed.
    max_attempts: u32,
    /// Held for a whole pass. Shared with gateways that send directly.
    replay_lock: Arc<Mutex<()>>,
}

impl OutboxProcessor {
    pub fn new(store: LocalStore, client: TransportClient) -> Self {
        let max_attempts = client.retry_policy().max_attempts;
        OutboxProcessor {
            store,
            client,
            max_attempts,
            replay_lock: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn replay_lock(&self) -> Arc<Mutex<()>> {
        self.replay_lock.clone()
    }

    /// Runs one replay pass.
    pub async fn replay_pending(&self) -> SyncResult<ReplayReport> {
        let _guard = self.replay_lock.lock().await;
        let pending = self.store.pending();
        let mut report = ReplayReport::default();

        if !self.client.probe().await {
            report.offline = true;
            report.remaining = pending.pending_count().await?;
            debug!(remaining = report.remaining, "Offline, skipping outbox replay");
            return Ok(report);
        }

        let operations = pending.pending_operations().await?;
        if operations.is_empty() {
            return Ok(report);
        }
        info!(count = operations.len(), "Replaying pending operations");

        for op in operations {
            let result = self
                .client
                .request(op.method, &op.endpoint, op.payload.as_ref())
                .await;

            match result {
                Ok(response) => {
                    pending.mark_synced(&op.id).await?;
                    report.delivered += 1;
                    debug!(operation_id = %op.id, status = response.status, "Operation delivered");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_retryable() => {
                    let attempts = pending.record_attempt(&op.id, &e.to_string()).await?;
                    if attempts >= i64::from(self.max_attempts) {
                        pending.mark_failed(&op.id, &e.to_string()).await?;
                        report.failed += 1;
                        warn!(operation_id = %op.id, attempts, error = %e, "Operation failed after max attempts");
                    } else {
                        debug!(operation_id = %op.id, attempts, error = %e, "Delivery failed, will retry");
                    }
                    break;
                }
                Err(e) if e.is_auth_error() => {
                    warn!(operation_id = %op.id, error = %e, "Replay stopped, login required");
                    report.auth_required = true;
                    break;
                }
                Err(e @ SyncError::ServerError { .. }) => {
                    pending.mark_failed(&op.id, &e.to_string()).await?;
                    report.failed += 1;
                    warn!(operation_id = %op.id, error = %e, "Operation rejected by server");
                }
                Err(e) => {
                    pending.mark_failed(&op.id, &e.to_string()).await?;
                    report.failed += 1;
                    warn!(operation_id = %op.id, error = %e, "Operation could not be sent");
                }
            }
        }

        report.remaining = pending.pending_count().await?;
        info!(
            delivered = report.delivered,
            failed = report.failed,
            remaining = report.remaining,
            "Outbox replay finished"
        );
        Ok(report)
    }
}
