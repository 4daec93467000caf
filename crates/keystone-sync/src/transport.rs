//! # Transport Client
//!
//! Authenticated HTTP client for every outbound call.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Transport Request Flow                            │
//! │                                                                         │
//! │   request(method, path, body)                                          │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   TokenManager::current_token(user) ── none ──► AuthError               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   send with "Authorization: Bearer <token>"                            │
//! │        │                                                                │
//! │        ├── 2xx ─────────────────────────────────► Ok(response)          │
//! │        ├── connect / timeout / IO ──────────────► NetworkError          │
//! │        ├── other non-2xx ───────────────────────► ServerError(status)   │
//! │        └── 401                                                          │
//! │             │                                                           │
//! │             ▼                                                           │
//! │        refresh_session (single-flight per user) ── fails ─► AuthError   │
//! │             │                                                           │
//! │             ▼                                                           │
//! │        replay once ── 401 again ──► AuthError                           │
//! │                    └─ otherwise ──► as above                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every call carries the configured request timeout. `probe()` uses its
//! own shorter timeout and never sends credentials.

use std::sync::Arc;
use std::time::Duration;

use keystone_core::validation::validate_endpoint;
use keystone_core::HttpMethod;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::TokenManager;
use crate::config::RemoteSettings;
use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

/// Unauthenticated connectivity endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Longest server message kept in a `ServerError`.
const MAX_ERROR_MESSAGE_LEN: usize = 512;

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the server.
    pub base_url: String,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Whole-request timeout.
    pub request_timeout: Duration,

    /// Timeout for `probe()`.
    pub probe_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            base_url: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl TransportConfig {
    pub fn from_settings(settings: &RemoteSettings) -> Self {
        TransportConfig {
            base_url: settings.base_url.clone(),
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            probe_timeout: settings.probe_timeout(),
        }
    }
}

// =============================================================================
// Response
// =============================================================================

/// A successful response.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed JSON body. Empty bodies are `Null`, non-JSON bodies a string.
    pub body: Value,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// =============================================================================
// Transport Client
// =============================================================================

/// Bearer-authenticated HTTP client bound to one user's session.
#[derive(Debug, Clone)]
pub struct TransportClient {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenManager>,
    user_id: String,
    probe_timeout: Duration,
    retry: RetryPolicy,
}

impl TransportClient {
    /// Creates a client that authenticates as `user_id`.
    pub fn new(
        config: TransportConfig,
        tokens: Arc<TokenManager>,
        user_id: impl Into<String>,
        retry: RetryPolicy,
    ) -> SyncResult<Self> {
        let mut base_url = Url::parse(&config.base_url)?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(config.base_url));
        }
        // Url::join replaces the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(TransportClient {
            http,
            base_url,
            tokens,
            user_id: user_id.into(),
            probe_timeout: config.probe_timeout,
            retry,
        })
    }

    /// Same session with a different retry policy.
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        TransportClient { retry, ..self }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sends an authenticated request.
    ///
    /// On a 401 the session is refreshed once and the request replayed once.
    ///
    /// ## Errors
    /// - `AuthError`: no session, refresh failed, or rejected after refresh
    /// - `NetworkError`: connect, timeout or IO failure
    /// - `ServerError`: any other non-2xx status
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> SyncResult<TransportResponse> {
        let url = self.url(path)?;
        let token = self.tokens.current_token(&self.user_id).await?;

        let response = self.send(method, &url, body, &token.token).await?;
        if response.status != StatusCode::UNAUTHORIZED.as_u16() {
            return finish(response);
        }

        warn!(method = %method, path = %path, "Request unauthorized, refreshing session");
        let fresh = self
            .tokens
            .refresh_session(&self.user_id, &token.token)
            .await
            .map_err(|e| match e {
                SyncError::AuthError(_) => e,
                other if other.is_auth_error() => SyncError::AuthError(other.to_string()),
                other => other,
            })?;

        let replay = self.send(method, &url, body, &fresh.token).await?;
        if replay.status == StatusCode::UNAUTHORIZED.as_u16() {
            warn!(method = %method, path = %path, "Request rejected after refresh");
            return Err(SyncError::AuthError(
                "request rejected after token refresh, login required".into(),
            ));
        }
        finish(replay)
    }

    /// [`request`](Self::request) wrapped in the shared retry policy.
    ///
    /// Only for idempotent calls.
    pub async fn request_with_retry(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> SyncResult<TransportResponse> {
        self.retry
            .run(path, || self.request(method, path, body))
            .await
    }

    pub async fn get(&self, path: &str) -> SyncResult<TransportResponse> {
        self.request(HttpMethod::Get, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> SyncResult<TransportResponse> {
        self.request(HttpMethod::Post, path, Some(body)).await
    }

    /// True if the server answers its health endpoint with a 2xx in time.
    pub async fn probe(&self) -> bool {
        let url = match self.url(HEALTH_PATH) {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self.http.get(url).timeout(self.probe_timeout).send().await {
            Ok(resp) => {
                let online = resp.status().is_success();
                debug!(status = resp.status().as_u16(), online, "Connectivity probe");
                online
            }
            Err(e) => {
                debug!(error = %e, "Connectivity probe failed");
                false
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn url(&self, path: &str) -> SyncResult<Url> {
        validate_endpoint(path)?;
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &Url,
        body: Option<&Value>,
        token: &str,
    ) -> SyncResult<TransportResponse> {
        let mut builder = self
            .http
            .request(to_reqwest(method), url.clone())
            .bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        debug!(method = %method, url = %url.path(), status, "Response received");

        Ok(TransportResponse {
            status,
            body: parse_body(&text),
        })
    }
}

fn to_reqwest(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn finish(response: TransportResponse) -> SyncResult<TransportResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let message = match &response.body {
        Value::Object(map) => ["error", "message", "detail"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(String::from)
            .unwrap_or_else(|| response.body.to_string()),
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    Err(SyncError::ServerError {
        status: response.status,
        message: message.chars().take(MAX_ERROR_MESSAGE_LEN).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_retry, session, spawn_server, unused_addr};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Hits(Arc<AtomicUsize>);

    impl Hits {
        fn next(&self) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst) + 1
        }
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_401_once_then_refresh_and_replay() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/api/sites",
                get(|State(hits): State<Hits>, headers: HeaderMap| async move {
                    assert!(headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("Bearer ")));
                    if hits.next() == 1 {
                        (HttpStatus::UNAUTHORIZED, Json(json!({"error": "expired"})))
                    } else {
                        (HttpStatus::OK, Json(json!([{"id": 1}, {"id": 2}])))
                    }
                }),
            )
            .with_state(hits.clone());
        let base = spawn_server(app).await;
        let (_store, tokens, client) = session(&base).await;

        let response = client.get("/api/sites").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!([{"id": 1}, {"id": 2}]));
        assert_eq!(tokens.refresh_count(), 1);
        assert_eq!(hits.count(), 2);
    }

    #[tokio::test]
    async fn test_second_401_is_auth_error() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/api/sites",
                get(|State(hits): State<Hits>| async move {
                    hits.next();
                    HttpStatus::UNAUTHORIZED
                }),
            )
            .with_state(hits.clone());
        let base = spawn_server(app).await;
        let (_store, tokens, client) = session(&base).await;

        let result = client.get("/api/sites").await;
        assert!(matches!(result, Err(SyncError::AuthError(_))));
        assert_eq!(tokens.refresh_count(), 1);
        assert_eq!(hits.count(), 2);
    }

    #[tokio::test]
    async fn test_server_error_and_retry() {
        let hits = Hits::default();
        let app = Router::new()
            .route(
                "/api/parts",
                post(|State(hits): State<Hits>, Json(body): Json<Value>| async move {
                    assert_eq!(body, json!({"name": "belt"}));
                    hits.next();
                    (HttpStatus::SERVICE_UNAVAILABLE, Json(json!({"message": "maintenance"})))
                }),
            )
            .route("/api/bad", post(|| async { (HttpStatus::UNPROCESSABLE_ENTITY, "bad part") }))
            .with_state(hits.clone());
        let base = spawn_server(app).await;
        let (_store, _tokens, client) = session(&base).await;
        let client = client.with_retry(fast_retry(3));

        let body = json!({"name": "belt"});
        match client.request_with_retry(HttpMethod::Post, "/api/parts", Some(&body)).await {
            Err(SyncError::ServerError { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "maintenance");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(hits.count(), 3);

        // 4xx is not retried
        let result = client.request_with_retry(HttpMethod::Post, "/api/bad", Some(&body)).await;
        assert!(matches!(result, Err(SyncError::ServerError { status: 422, .. })));
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let app = Router::new().route("/api/ping", axum::routing::delete(|| async { HttpStatus::NO_CONTENT }));
        let base = spawn_server(app).await;
        let (_store, _tokens, client) = session(&base).await;

        let response = client.request(HttpMethod::Delete, "/api/ping", None).await.unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.body, Value::Null);
    }

    #[tokio::test]
    async fn test_probe() {
        let app = Router::new().route(
            "/health",
            get(|headers: HeaderMap| async move {
                assert!(headers.get("authorization").is_none());
                "ok"
            }),
        );
        let base = spawn_server(app).await;
        let (_store, _tokens, client) = session(&base).await;
        assert!(client.probe().await);

        let (_store, _tokens, offline) = session(&format!("http://{}", unused_addr().await)).await;
        assert!(!offline.probe().await);
    }

    #[tokio::test]
    async fn test_unreachable_is_network_error() {
        let (_store, _tokens, client) = session(&format!("http://{}", unused_addr().await)).await;
        let result = client.get("/api/sites").await;
        assert!(matches!(result, Err(SyncError::NetworkError(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_request_timeout_is_network_error() {
        let app = Router::new().route(
            "/api/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let base = spawn_server(app).await;
        let (_store, tokens, _client) = session(&base).await;

        let config = TransportConfig {
            base_url: base,
            request_timeout: Duration::from_millis(200),
            ..TransportConfig::default()
        };
        let client = TransportClient::new(config, tokens, "u-1", RetryPolicy::no_retry()).unwrap();
        assert!(matches!(client.get("/api/slow").await, Err(SyncError::NetworkError(_))));
    }

    #[tokio::test]
    async fn test_no_session_is_auth_error() {
        let (store, tokens, client) = session("http://127.0.0.1:9").await;
        tokens.revoke("u-1").await.unwrap();
        assert!(matches!(client.get("/api/sites").await, Err(SyncError::AuthError(_))));
        drop(store);
    }

    #[test]
    fn test_base_url_keeps_prefix() {
        let url = Url::parse("https://maint.example.com/api/").unwrap();
        assert_eq!(
            url.join("sync/schema/sites").unwrap().as_str(),
            "https://maint.example.com/api/sync/schema/sites"
        );
    }

    #[test]
    fn test_finish_maps_status() {
        let ok = TransportResponse { status: 201, body: json!({"id": 7}) };
        assert!(finish(ok).is_ok());

        let err = finish(TransportResponse { status: 404, body: json!({"detail": "no such site"}) });
        match err {
            Err(SyncError::ServerError { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such site");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
