//! # Offline Gateway
//!
//! Front door for application calls that must work with or without a
//! network.
//!
//! ```text
//!   submit(POST /api/work-orders, body)        fetch(/api/sites)
//!          │                                          │
//!          ▼                                          ▼
//!   delivery lock (shared with replay)               │
//!   enqueue (durable first)                    online? ── no ──► cache
//!   invalidate cache entry                         │
//!          │                                       ▼
//!   online and queue empty? ── no ──► Queued    GET ── ok ──► cache, Live
//!          │                                       └─ transient ──► cache
//!          ▼
//!   send ── ok ──► mark_synced, Delivered
//! ```
//!
//! A gateway built with [`OfflineGateway::with_outbox`] holds the outbox
//! replay lock from enqueue to send, so a concurrent replay pass never sees
//! an operation the gateway is still delivering.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keystone_core::HttpMethod;
use keystone_db::LocalStore;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::outbox::OutboxProcessor;
use crate::transport::{TransportClient, TransportResponse};

/// Why a submitted mutation was left in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// The server did not answer the probe.
    Offline,
    /// Older operations are still waiting; sending now would reorder them.
    Backlog,
    /// The send failed with a retryable error.
    Transient,
    /// The session could not be refreshed.
    ReauthRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Delivered {
        id: String,
        response: TransportResponse,
    },
    Queued {
        id: String,
        reason: QueueReason,
    },
}

impl SubmitOutcome {
    pub fn operation_id(&self) -> &str {
        match self {
            SubmitOutcome::Delivered { id, .. } | SubmitOutcome::Queued { id, .. } => id,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SubmitOutcome::Delivered { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Live(Value),
    Cached {
        payload: Value,
        cached_at: DateTime<Utc>,
    },
}

impl FetchOutcome {
    pub fn payload(&self) -> &Value {
        match self {
            FetchOutcome::Live(payload) | FetchOutcome::Cached { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            FetchOutcome::Live(payload) | FetchOutcome::Cached { payload, .. } => payload,
        }
    }
}

/// Offline-aware reads and writes on top of the transport.
#[derive(Debug, Clone)]
pub struct OfflineGateway {
    store: LocalStore,
    client: TransportClient,
    delivery_lock: Arc<Mutex<()>>,
}

impl OfflineGateway {
    pub fn new(store: LocalStore, client: TransportClient) -> Self {
        OfflineGateway {
            store,
            client,
            delivery_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serializes direct sends with `outbox` replay passes.
    pub fn with_outbox(mut self, outbox: &OutboxProcessor) -> Self {
        self.delivery_lock = outbox.replay_lock();
        self
    }

    /// Records a mutation and delivers it now if that keeps queue order.
    ///
    /// ## Errors
    /// - `ServerError`: the server rejected the operation (it is marked failed)
    /// - storage errors from the enqueue itself
    pub async fn submit(
        &self,
        method: HttpMethod,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> SyncResult<SubmitOutcome> {
        let _guard = self.delivery_lock.lock().await;
        let id = self.store.enqueue(method, endpoint, payload).await?;
        self.store.invalidate_cached(endpoint).await?;

        if !self.client.probe().await {
            debug!(operation_id = %id, endpoint = %endpoint, "Offline, operation queued");
            return Ok(SubmitOutcome::Queued { id, reason: QueueReason::Offline });
        }

        let pending = self.store.pending();
        if pending.pending_count().await? > 1 {
            debug!(operation_id = %id, "Older operations pending, operation queued");
            return Ok(SubmitOutcome::Queued { id, reason: QueueReason::Backlog });
        }

        match self.client.request(method, endpoint, payload).await {
            Ok(response) => {
                pending.mark_synced(&id).await?;
                Ok(SubmitOutcome::Delivered { id, response })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) if e.is_retryable() => {
                pending.record_attempt(&id, &e.to_string()).await?;
                debug!(operation_id = %id, error = %e, "Send failed, operation queued");
                Ok(SubmitOutcome::Queued { id, reason: QueueReason::Transient })
            }
            Err(e) if e.is_auth_error() => {
                warn!(operation_id = %id, error = %e, "Login required, operation queued");
                Ok(SubmitOutcome::Queued { id, reason: QueueReason::ReauthRequired })
            }
            Err(e) => {
                pending.mark_failed(&id, &e.to_string()).await?;
                warn!(operation_id = %id, error = %e, "Operation rejected by server");
                Err(e)
            }
        }
    }

    /// Reads `endpoint`, falling back to the last cached response.
    pub async fn fetch(&self, endpoint: &str) -> SyncResult<FetchOutcome> {
        let failure = if self.client.probe().await {
            match self.client.get(endpoint).await {
                Ok(response) => {
                    self.store.cache_response(endpoint, &response.body).await?;
                    return Ok(FetchOutcome::Live(response.body));
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            }
        } else {
            SyncError::NetworkError(format!("server unreachable, no live copy of {endpoint}"))
        };

        match self.store.cached_response(endpoint).await? {
            Some(cached) => {
                debug!(endpoint = %endpoint, cached_at = %cached.cached_at, "Serving cached response");
                Ok(FetchOutcome::Cached {
                    payload: cached.payload,
                    cached_at: cached.cached_at,
                })
            }
            None => Err(failure),
        }
    }
}
